//! Outbox rows.
//!
//! The engine never talks to a broker. It appends an [`OutboxMessage`] inside
//! the unit of work that produced the state change; a relay outside this
//! workspace reads rows back in `sequence` order and forwards them.

use crate::event::{EventSerializationError, OutboxEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event ready to be written to the outbox table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Aggregate kind, e.g. `"product"` or `"order"`
    pub aggregate_type: String,
    /// Aggregate identifier
    pub aggregate_id: String,
    /// Versioned event type
    pub event_type: String,
    /// Encoded payload
    pub payload: Vec<u8>,
    /// Correlation and tracing metadata
    pub metadata: Option<serde_json::Value>,
    /// When the change happened
    pub occurred_at: DateTime<Utc>,
}

impl OutboxMessage {
    /// Encode `event` into an outbox row.
    ///
    /// # Errors
    ///
    /// Returns [`EventSerializationError`] if the payload cannot be encoded.
    pub fn from_event<E: OutboxEvent>(
        event: &E,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self, EventSerializationError> {
        let (aggregate_type, aggregate_id) = event.aggregate();
        Ok(Self {
            aggregate_type: aggregate_type.to_string(),
            aggregate_id,
            event_type: event.event_type().to_string(),
            payload: event.encode()?,
            metadata: None,
            occurred_at,
        })
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A persisted outbox row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxRecord {
    /// Monotonic position assigned on insert
    pub sequence: i64,
    /// The stored message
    pub message: OutboxMessage,
}

impl OutboxRecord {
    /// Decode the payload as `E`.
    ///
    /// # Errors
    ///
    /// Returns [`EventSerializationError::Deserialize`] if the payload is not an `E`.
    pub fn decode<E: OutboxEvent>(&self) -> Result<E, EventSerializationError> {
        E::decode(&self.message.payload)
    }
}
