//! Queue envelope, processing states, and dead-letter types.
//!
//! [`Envelope`] wraps a [`ChangeEvent`] with routing metadata while it travels
//! through the partitioned queue. [`DeadLetterRecord`] captures envelopes that
//! reached the terminal dead-letter state for later inspection and replay.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, RelayError, Stage};
use crate::event::ChangeEvent;

/// ISO-8601 formatted timestamp string.
///
/// Thin wrapper providing type clarity without requiring a datetime
/// library dependency. The ingestor validates the format on entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    /// Create a new timestamp from an ISO-8601 string.
    #[must_use]
    pub fn new(iso8601: impl Into<String>) -> Self {
        Self(iso8601.into())
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A change event plus routing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: ChangeEvent,
    /// Routing key; always the event's `source_id`.
    pub partition_key: String,
    /// Queue partition derived from `partition_key`.
    pub partition: u32,
    pub attempt_count: u32,
    pub dead_letter: bool,
    /// Correlation id for tracing across stages.
    pub trace_id: String,
}

impl Envelope {
    #[must_use]
    pub fn source_id(&self) -> &str {
        &self.event.source_id
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.event.sequence
    }
}

/// Per-envelope processing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    Received,
    Processing,
    Applied,
    RetryScheduled,
    DeadLettered,
}

impl ProcessingState {
    /// Terminal states end an envelope's lifecycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Applied | Self::DeadLettered)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Processing => "PROCESSING",
            Self::Applied => "APPLIED",
            Self::RetryScheduled => "RETRY_SCHEDULED",
            Self::DeadLettered => "DEAD_LETTERED",
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope routed to the dead-letter channel with its final error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// The envelope as it was when it failed, original payload intact.
    pub envelope: Envelope,
    pub stage: Stage,
    pub error_kind: ErrorKind,
    pub error_code: String,
    pub error_message: String,
    pub attempt_count: u32,
    pub failed_at: Timestamp,
}

impl DeadLetterRecord {
    /// Build a record from the envelope and the error that ended it.
    #[must_use]
    pub fn new(envelope: &Envelope, error: &RelayError, failed_at: Timestamp) -> Self {
        let mut envelope = envelope.clone();
        envelope.dead_letter = true;
        Self {
            attempt_count: envelope.attempt_count,
            envelope,
            stage: error.stage,
            error_kind: error.kind,
            error_code: error.code.clone(),
            error_message: error.message.clone(),
            failed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{FieldMap, Operation};

    fn envelope() -> Envelope {
        let mut payload = FieldMap::new();
        payload.insert("name".into(), serde_json::json!("Acme"));
        Envelope {
            event: ChangeEvent {
                source_id: "A1".into(),
                entity_type: "Account".into(),
                operation: Operation::Update,
                sequence: 5,
                payload,
                emitted_at: Timestamp::new("2026-01-15T10:30:00Z"),
            },
            partition_key: "A1".into(),
            partition: 3,
            attempt_count: 4,
            dead_letter: false,
            trace_id: "t-1".into(),
        }
    }

    #[test]
    fn timestamp_transparent_serde() {
        let ts = Timestamp::new("2026-01-15T10:30:00Z");
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"2026-01-15T10:30:00Z\"");
    }

    #[test]
    fn terminal_states() {
        assert!(ProcessingState::Applied.is_terminal());
        assert!(ProcessingState::DeadLettered.is_terminal());
        assert!(!ProcessingState::RetryScheduled.is_terminal());
        assert!(!ProcessingState::Processing.is_terminal());
    }

    #[test]
    fn dead_letter_preserves_payload_and_error() {
        let err = RelayError::writeback("HTTP_503", "source unavailable");
        let record =
            DeadLetterRecord::new(&envelope(), &err, Timestamp::new("2026-01-15T10:31:00Z"));
        assert!(record.envelope.dead_letter);
        assert_eq!(record.attempt_count, 4);
        assert_eq!(record.error_kind, ErrorKind::Writeback);
        assert_eq!(record.stage, Stage::Writeback);
        assert_eq!(record.envelope.event.payload["name"], "Acme");
    }
}
