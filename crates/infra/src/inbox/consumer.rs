//! Exactly-once processing on top of at-least-once delivery.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use eventide_core::{Clock, SystemClock};
use eventide_events::EventEnvelope;

use super::store::{InboxError, InboxMessage, InboxSave, InboxStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The handler ran and the message is marked processed.
    Processed,
    /// The event id was already claimed; the handler did not run.
    Duplicate,
}

#[derive(Debug, Error)]
pub enum ConsumeError<E> {
    #[error(transparent)]
    Inbox(#[from] InboxError),

    /// The handler failed. The claim was released so redelivery can retry.
    #[error("handler failed: {0}")]
    Handler(E),
}

/// Wraps a handler with inbox claim, mark-processed and release-on-error.
///
/// ```text
/// save (claim) ──Duplicate──► skip
///      │
///   Recorded ──► handler ──Ok──► mark_as_processed
///                   │
///                  Err ──► release ──► Err(Handler)
/// ```
pub struct IdempotentConsumer<S> {
    inbox: S,
    clock: Arc<dyn Clock>,
}

impl<S: InboxStore> IdempotentConsumer<S> {
    pub fn new(inbox: S) -> Self {
        Self {
            inbox,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn inbox(&self) -> &S {
        &self.inbox
    }

    pub async fn consume<F, Fut, E>(
        &self,
        envelope: &EventEnvelope,
        handler: F,
    ) -> Result<ConsumeOutcome, ConsumeError<E>>
    where
        F: FnOnce(EventEnvelope) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let message = InboxMessage::new(envelope.clone(), self.clock.now());
        let message_id = message.id;

        if self.inbox.save(message).await? == InboxSave::Duplicate {
            debug!(event_id = %envelope.event_id(), "duplicate delivery skipped");
            return Ok(ConsumeOutcome::Duplicate);
        }

        match handler(envelope.clone()).await {
            Ok(()) => {
                self.inbox
                    .mark_as_processed(message_id, self.clock.now())
                    .await?;
                Ok(ConsumeOutcome::Processed)
            }
            Err(e) => {
                if let Err(release_err) = self.inbox.release(envelope.event_id()).await {
                    warn!(
                        event_id = %envelope.event_id(),
                        error = %release_err,
                        "failed to release inbox claim"
                    );
                }
                Err(ConsumeError::Handler(e))
            }
        }
    }
}
