//! Inbox: consumer-side deduplication for at-least-once delivery.

pub mod consumer;
pub mod postgres;
pub mod store;

pub use consumer::{ConsumeError, ConsumeOutcome, IdempotentConsumer};
pub use postgres::PostgresInboxStore;
pub use store::{InMemoryInboxStore, InboxError, InboxMessage, InboxSave, InboxStore};
