//! Append-only event store boundary.
//!
//! Streams are keyed by [`StreamId`](eventide_core::StreamId) and versioned
//! from 0. Both implementations stage the transactional outbox inside the
//! append when wired to one.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
