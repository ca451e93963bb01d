//! Connection Management
//!
//! Pooled access to the external key-value store, reconnect-with-backoff and
//! health probing for everything layered above it.

mod backend;
mod backoff;
mod manager;
mod memory;
mod redis;
mod url;

pub use backend::*;
pub use backoff::*;
pub use manager::*;
pub use memory::*;
pub use redis::*;
pub use url::*;
