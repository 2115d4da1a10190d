pub mod event_store;
pub mod fact_store;

pub use event_store::{EventStore, EventStoreConfig};
pub use fact_store::{FactStore, Subscription};
