//! # Event Envelope
//!
//! Wire wrapper around every integration event.
//!
//! ```json
//! {
//!   "eventId": "<uuid>",
//!   "eventType": "user.created",
//!   "timestamp": 1718000000000,
//!   "version": "1.0",
//!   "source": "accounts",
//!   "payload": { }
//! }
//! ```
//!
//! The partition key (aggregate id) is not part of the body; it travels as a
//! transport-level key on [`crate::BusMessage`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Standard event envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<T> {
    /// Unique event identifier (idempotency key, broker message id)
    pub event_id: Uuid,

    /// Dotted, lowercase event name
    pub event_type: String,

    /// Send time in epoch milliseconds
    pub timestamp: i64,

    /// Envelope protocol version
    pub version: String,

    /// Service that produced the event
    pub source: String,

    /// Event-specific payload
    pub payload: T,
}

impl<T> EventEnvelope<T> {
    /// Create an envelope with a fresh event id and the current time
    pub fn new(event_type: String, version: String, source: String, payload: T) -> Self {
        Self::with_event_id(Uuid::new_v4(), event_type, version, source, payload)
    }

    /// Create an envelope with an explicit event id
    pub fn with_event_id(
        event_id: Uuid,
        event_type: String,
        version: String,
        source: String,
        payload: T,
    ) -> Self {
        Self {
            event_id,
            event_type,
            timestamp: Utc::now().timestamp_millis(),
            version,
            source,
            payload,
        }
    }
}

/// Validate the envelope fields of a raw JSON message
///
/// # Validation Rules
///
/// - `eventId`: must be a valid UUID
/// - `eventType`, `version`, `source`: must be non-empty strings
/// - `timestamp`: must be an integer
/// - `payload`: must be present
pub fn validate_envelope_fields(envelope: &serde_json::Value) -> Result<(), String> {
    let event_id = envelope
        .get("eventId")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid eventId")?;
    Uuid::parse_str(event_id).map_err(|e| format!("eventId is not a UUID: {e}"))?;

    for field in ["eventType", "version", "source"] {
        let value = envelope
            .get(field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("Missing or invalid {field}"))?;
        if value.is_empty() {
            return Err(format!("{field} cannot be empty"));
        }
    }

    envelope
        .get("timestamp")
        .and_then(|v| v.as_i64())
        .ok_or("Missing or invalid timestamp")?;

    if envelope.get("payload").is_none() {
        return Err("Missing payload".to_string());
    }

    Ok(())
}
