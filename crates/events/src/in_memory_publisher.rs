//! In-memory publisher for tests/dev.

use std::sync::{Mutex, mpsc};

use async_trait::async_trait;

use crate::EventEnvelope;
use crate::publisher::{EventPublisherPort, PublishError};

/// A subscription to envelopes published through an [`InMemoryPublisher`].
///
/// Each subscription receives a copy of every envelope published after it
/// was created (broadcast semantics), in publish order.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::Receiver<EventEnvelope>,
}

impl Subscription {
    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<EventEnvelope> {
        self.receiver.try_iter().collect()
    }
}

/// In-memory publisher.
///
/// - No IO
/// - Records every published envelope for assertions
/// - Best-effort fan-out to live subscriptions (dead ones are dropped)
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    published: Mutex<Vec<EventEnvelope>>,
    subscribers: Mutex<Vec<mpsc::Sender<EventEnvelope>>>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel();

        // A poisoned lock still yields a subscription; it just never receives.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription { receiver: rx }
    }

    /// Copies of everything published so far, in order.
    pub fn published(&self) -> Vec<EventEnvelope> {
        self.published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn published_count(&self) -> usize {
        self.published.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[async_trait]
impl EventPublisherPort for InMemoryPublisher {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError> {
        self.published
            .lock()
            .map_err(|_| PublishError::transport("publisher lock poisoned"))?
            .push(envelope.clone());

        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| PublishError::transport("publisher lock poisoned"))?;
        subs.retain(|tx| tx.send(envelope.clone()).is_ok());

        tracing::trace!(
            event_id = %envelope.event_id(),
            event_type = envelope.event_type(),
            subscribers = subs.len(),
            "published envelope in memory"
        );
        Ok(())
    }
}
