//! Outbox message and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use eventide_core::MessageId;
use eventide_events::EventEnvelope;

/// Reason recorded when a message exhausts its retry budget.
pub const MAX_ATTEMPTS_EXCEEDED: &str = "max attempts exceeded";

/// Delivery status derived from the message timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Not yet delivered; `attempts` failed publishes so far.
    Pending { attempts: u32 },
    /// Delivered. Terminal and immutable.
    Published,
    /// Exhausted its retry budget. Terminal.
    DeadLettered,
}

impl OutboxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Published | OutboxStatus::DeadLettered)
    }
}

/// A durable outbound message staged alongside the event it carries.
///
/// Lifecycle:
///
/// ```text
/// pending(0) ──fail──► pending(1) ──fail──► … ──► pending(max) ──► dead-lettered
///     │                     │
///     └──────success────────┴──────────────► published
/// ```
///
/// `attempts` increments only on a failed publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub envelope: EventEnvelope,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn new(envelope: EventEnvelope, created_at: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            envelope,
            created_at,
            published_at: None,
            attempts: 0,
            last_attempt_at: None,
            error: None,
            dead_lettered_at: None,
        }
    }

    pub fn status(&self) -> OutboxStatus {
        if self.published_at.is_some() {
            OutboxStatus::Published
        } else if self.dead_lettered_at.is_some() {
            OutboxStatus::DeadLettered
        } else {
            OutboxStatus::Pending {
                attempts: self.attempts,
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status(), OutboxStatus::Pending { .. })
    }

    pub(crate) fn mark_published(&mut self, at: DateTime<Utc>) {
        self.published_at = Some(at);
        self.error = None;
    }

    pub(crate) fn mark_failed(&mut self, error: String, at: DateTime<Utc>) {
        self.attempts += 1;
        self.last_attempt_at = Some(at);
        self.error = Some(error);
    }

    pub(crate) fn mark_dead_lettered(&mut self, reason: String, at: DateTime<Utc>) {
        self.dead_lettered_at = Some(at);
        self.error = Some(reason);
    }
}
