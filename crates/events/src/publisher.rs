//! Outbound publishing port.
//!
//! The outbox relay hands each pending envelope to an `EventPublisherPort`.
//! The port is the **transport boundary**: a message broker, an HTTP webhook,
//! an in-process fan-out for tests. Events are already durable in the event
//! store and the outbox before they reach the port, so a failed publish is
//! recoverable:
//!
//! ```text
//! append ──► event store + outbox row ──► relay ──► EventPublisherPort ──► consumers
//!                                            ▲            │
//!                                            └── retry ◄──┘ (Err)
//! ```
//!
//! ## Delivery Guarantees
//!
//! Delivery is **at-least-once**: a publish that succeeded on the wire but
//! whose acknowledgement was lost is retried, so consumers must deduplicate
//! (see the inbox).

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::EventEnvelope;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// The transport could not deliver the message. The relay retries it.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl PublishError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

/// Transport-agnostic publisher used by the outbox relay.
///
/// Implementations must be safe to share across tasks.
#[async_trait]
pub trait EventPublisherPort: Send + Sync {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError>;
}

#[async_trait]
impl<P> EventPublisherPort for Arc<P>
where
    P: EventPublisherPort + ?Sized,
{
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError> {
        (**self).publish(envelope).await
    }
}
