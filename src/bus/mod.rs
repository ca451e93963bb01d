//! State Change Bus
//!
//! Publish/subscribe notification of record mutations over the store's channel
//! primitive. Observers (UI, schedulers, other registries) subscribe instead of
//! polling.

mod events;
mod state_bus;

pub use events::*;
pub use state_bus::*;
