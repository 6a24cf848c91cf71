//! Live projection consumer.
//!
//! Envelopes arriving from the relay pass through an inbox so redelivered
//! events are projected once. After a successful projection the lag
//! (`now - occurred_at`) is recorded with the consistency monitor.
//!
//! The inbox deduplicates by event id, so each runner needs its own inbox.

use std::sync::Arc;

use tracing::{debug, instrument};

use eventide_core::{Clock, SystemClock};
use eventide_events::{EventEnvelope, Projection, ProjectionError};

use super::consistency::ConsistencyMonitor;
use crate::inbox::{ConsumeError, ConsumeOutcome, IdempotentConsumer, InboxStore};

pub type RunnerError = ConsumeError<ProjectionError>;

pub struct ProjectionRunner<S> {
    projection: Arc<dyn Projection>,
    consumer: IdempotentConsumer<S>,
    monitor: Arc<ConsistencyMonitor>,
    clock: Arc<dyn Clock>,
}

impl<S: InboxStore> ProjectionRunner<S> {
    pub fn new(projection: Arc<dyn Projection>, inbox: S, monitor: Arc<ConsistencyMonitor>) -> Self {
        monitor.register(projection.name());
        Self {
            projection,
            consumer: IdempotentConsumer::new(inbox),
            monitor,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.consumer = self.consumer.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn projection_name(&self) -> &str {
        self.projection.name()
    }

    #[instrument(
        skip(self, envelope),
        fields(projection = self.projection.name(), event_id = %envelope.event_id()),
        err
    )]
    pub async fn handle(&self, envelope: &EventEnvelope) -> Result<ConsumeOutcome, RunnerError> {
        let projection = self.projection.clone();
        let outcome = self
            .consumer
            .consume(envelope, |envelope| async move {
                projection.project(&envelope).await
            })
            .await?;

        if outcome == ConsumeOutcome::Processed {
            let lag_ms = (self.clock.now() - envelope.occurred_at())
                .num_milliseconds()
                .max(0) as u64;
            self.monitor.record_lag(self.projection.name(), lag_ms);
            debug!(lag_ms, "event projected");
        }
        Ok(outcome)
    }

    /// Handle a batch in order, stopping at the first failure.
    pub async fn handle_all(&self, envelopes: &[EventEnvelope]) -> Result<usize, RunnerError> {
        let mut processed = 0;
        for envelope in envelopes {
            if self.handle(envelope).await? == ConsumeOutcome::Processed {
                processed += 1;
            }
        }
        Ok(processed)
    }
}
