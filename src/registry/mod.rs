//! Service Registry
//!
//! Service descriptors, their lifecycle state machine, and the registry that
//! manages them.

mod descriptor;
mod service_registry;

pub use descriptor::*;
pub use service_registry::*;
