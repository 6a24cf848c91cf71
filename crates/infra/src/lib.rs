//! Infrastructure layer: event store, snapshots, replay, outbox/inbox
//! delivery, projections and their Postgres adapters.

pub mod config;
pub mod db;
pub mod event_store;
pub mod inbox;
pub mod outbox;
pub mod projections;
pub mod read_model;
pub mod replay;
pub mod repository;
pub mod snapshot;

pub use config::{ConfigError, PipelineConfig};
pub use repository::{AggregateRepository, CommitContext, RepositoryError};

#[cfg(test)]
mod test_support;
