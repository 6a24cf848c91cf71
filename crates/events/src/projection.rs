use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::{DecodeError, EventEnvelope};

/// Failure while applying one event to a projection.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The read-model store rejected or failed the write.
    #[error("read model store failed: {0}")]
    Store(String),

    /// The projection refused the event (e.g. it references unknown state).
    #[error("event rejected: {0}")]
    Rejected(String),
}

/// A projection builds a read model from committed events.
///
/// Projections implement the **CQRS read model pattern**: they transform events
/// (write model) into queryable state (read model).
///
/// ## Disposability
///
/// Read models are **disposable**: `reset()` deletes everything the projection
/// owns, after which replaying the event log rebuilds it. Events are the
/// source of truth.
///
/// ## Idempotency
///
/// Events can be delivered more than once (at-least-once outbox delivery).
/// Live consumers put an inbox in front of `project`; projections should still
/// prefer upserts keyed by aggregate id so a replayed event converges to the
/// same state.
///
/// ## Error Handling
///
/// `project` returns an error for events it cannot apply. Rebuilds count these
/// errors and carry on with the next event; they never abort the rebuild.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Stable name used for registration, lag tracking and logging.
    fn name(&self) -> &str;

    /// Apply a single event to the read model.
    async fn project(&self, envelope: &EventEnvelope) -> Result<(), ProjectionError>;

    /// Delete all read-model state owned by this projection.
    async fn reset(&self) -> Result<(), ProjectionError>;
}

#[async_trait]
impl<P> Projection for Arc<P>
where
    P: Projection + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn project(&self, envelope: &EventEnvelope) -> Result<(), ProjectionError> {
        (**self).project(envelope).await
    }

    async fn reset(&self) -> Result<(), ProjectionError> {
        (**self).reset().await
    }
}
