use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **typed** (a closed enum per aggregate, decoded through an
///   [`EventRegistry`](crate::EventRegistry))
/// - designed to be **append-only**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "order.placed").
    fn event_type(&self) -> &'static str;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Serialize the variant's data (without the type tag) for storage.
    fn to_payload(&self) -> Result<JsonValue, serde_json::Error>;
}
