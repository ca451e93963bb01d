//! Suite Core Library
//!
//! The shared substrate of the service adapter suite: a pooled connection to
//! the key-value store, a generic persistent record model, a pub/sub state
//! bus, an encrypted multi-account credential vault and the service registry
//! that ties them together.

pub mod bus;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod helpers;
pub mod registry;
pub mod store;
pub mod vault;

pub use error::{Error, Result};
