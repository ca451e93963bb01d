//! Helper Utilities
//!
//! Common utilities used across the crate.

mod crypto;
mod fs;
mod glob;

pub use crypto::*;
pub use fs::*;
pub use glob::*;
