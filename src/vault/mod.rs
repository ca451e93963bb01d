//! Credential Vault
//!
//! Encrypted multi-account credentials with validation scheduling.

mod account;
mod credential_vault;
mod schedule;
mod validator;

pub use account::*;
pub use credential_vault::*;
pub use schedule::*;
pub use validator::*;
