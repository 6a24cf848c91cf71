//! `eventide-core`: foundation building blocks for the event-sourced pipeline.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the aggregate capability, optimistic-concurrency expectations,
//! the domain error model, and the clock abstraction.

pub mod aggregate;
pub mod clock;
pub mod error;
pub mod id;

pub use aggregate::{AggregateRoot, EventSourcedAggregate, ExpectedVersion, SnapshotCapable};
pub use clock::{Clock, FixedClock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{EventId, MessageId, StreamId, TenantId};
