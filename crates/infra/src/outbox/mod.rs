//! Transactional outbox: durable outbound messages staged with each append
//! and drained by the [`OutboxRelay`].

pub mod metrics;
pub mod postgres;
pub mod relay;
pub mod store;
pub mod types;

pub use metrics::{OutboxRelayMetrics, RelayMetricsSnapshot};
pub use postgres::PostgresOutboxStore;
pub use relay::{OutboxRelay, OutboxRelayConfig, RelayCycleReport, RelayError, backoff_delay};
pub use store::{InMemoryOutboxStore, OutboxStats, OutboxStore, OutboxStoreError};
pub use types::{MAX_ATTEMPTS_EXCEEDED, OutboxMessage, OutboxStatus};
