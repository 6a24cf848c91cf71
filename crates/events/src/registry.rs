//! Registry mapping stored `event_type` strings to typed decoders.
//!
//! Stored payloads are untyped JSON. Each aggregate declares a closed enum of
//! its events and registers one decoder per event type, so decoding is an
//! explicit lookup that fails loudly on unknown types instead of guessing.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no decoder registered for event type '{0}'")]
    UnknownEventType(String),

    #[error("payload for event type '{event_type}' could not be decoded: {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

type Decoder<E> = Box<dyn Fn(&JsonValue) -> Result<E, serde_json::Error> + Send + Sync>;

/// Typed decoder table for one event enum `E`.
pub struct EventRegistry<E> {
    decoders: HashMap<String, Decoder<E>>,
}

impl<E> EventRegistry<E> {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register a decoder: payloads of `event_type` deserialize into `T` and
    /// are wrapped into the enum with `wrap`.
    ///
    /// Registering the same type twice replaces the earlier decoder.
    pub fn register<T, F>(mut self, event_type: impl Into<String>, wrap: F) -> Self
    where
        E: 'static,
        T: DeserializeOwned + 'static,
        F: Fn(T) -> E + Send + Sync + 'static,
    {
        let decoder: Decoder<E> = Box::new(move |payload: &JsonValue| {
            serde_json::from_value::<T>(payload.clone()).map(&wrap)
        });
        self.decoders.insert(event_type.into(), decoder);
        self
    }

    pub fn decode(&self, event_type: &str, payload: &JsonValue) -> Result<E, DecodeError> {
        let decoder = self
            .decoders
            .get(event_type)
            .ok_or_else(|| DecodeError::UnknownEventType(event_type.to_string()))?;

        decoder(payload).map_err(|source| DecodeError::Payload {
            event_type: event_type.to_string(),
            source,
        })
    }

    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl<E> Default for EventRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> core::fmt::Debug for EventRegistry<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}
