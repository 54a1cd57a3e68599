//! Append-only event store boundary.
//!
//! Streams are keyed by aggregate id. No storage assumptions: the in-memory
//! store backs tests and dev wiring.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
