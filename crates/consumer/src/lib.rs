//! Consumer group runtime and the delivery store it feeds.

pub mod backoff;
pub mod delivery_store;
pub mod runtime;

pub use backoff::Backoff;
pub use delivery_store::{DeliveryStore, UpsertOutcome};
pub use runtime::{ConsumerRuntime, ConsumerState, ConsumerStatus, StatusSnapshot};
