mod record;
mod record_store;

pub use record::*;
pub use record_store::*;
