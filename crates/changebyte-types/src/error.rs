//! Structured error model for relay stages.
//!
//! Every failure that reaches the retry coordinator is a [`RelayError`]. Its
//! [`ErrorKind`] decides whether the envelope is retried or dead-lettered.
//! Construct via kind-specific factory methods.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classification of a relay failure.
///
/// Determines retry behavior and operator-facing categorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Raw event failed validation at ingest. Dropped and logged.
    MalformedEvent,
    /// Queue publish failed (retryable).
    Publish,
    /// Field mapping could not be applied (not retryable).
    SchemaMapping,
    /// Optimistic-lock contention or transient destination failure (retryable).
    ApplyConflict,
    /// Destination rejected the record (not retryable).
    ApplyRejected,
    /// Correlation writeback to the source failed (retryable).
    Writeback,
}

impl ErrorKind {
    /// Whether errors of this kind feed the backoff state machine.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Publish | Self::ApplyConflict | Self::Writeback)
    }

    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedEvent => "malformed_event",
            Self::Publish => "publish",
            Self::SchemaMapping => "schema_mapping",
            Self::ApplyConflict => "apply_conflict",
            Self::ApplyRejected => "apply_rejected",
            Self::Writeback => "writeback",
        }
    }

    /// Parse the storage form produced by [`ErrorKind::as_str`].
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "malformed_event" => Some(Self::MalformedEvent),
            "publish" => Some(Self::Publish),
            "schema_mapping" => Some(Self::SchemaMapping),
            "apply_conflict" => Some(Self::ApplyConflict),
            "apply_rejected" => Some(Self::ApplyRejected),
            "writeback" => Some(Self::Writeback),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Queue,
    Transform,
    Apply,
    Writeback,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Queue => "queue",
            Self::Transform => "transform",
            Self::Apply => "apply",
            Self::Writeback => "writeback",
        }
    }

    /// Retryable kind assigned to transport failures (timeouts, panicked
    /// calls) raised by external calls in this stage.
    #[must_use]
    pub fn transient_kind(self) -> ErrorKind {
        match self {
            Self::Ingest | Self::Queue => ErrorKind::Publish,
            Self::Transform | Self::Apply => ErrorKind::ApplyConflict,
            Self::Writeback => ErrorKind::Writeback,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categorized error crossing a component boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{kind}] {code}: {message}")]
pub struct RelayError {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RelayError {
    fn new(
        kind: ErrorKind,
        stage: Stage,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            stage,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Malformed raw event (dropped, not retried).
    #[must_use]
    pub fn malformed_event(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedEvent, Stage::Ingest, code, message)
    }

    /// Queue publish failure (retryable).
    #[must_use]
    pub fn publish(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Publish, Stage::Queue, code, message)
    }

    /// Field mapping failure (dead-lettered immediately).
    #[must_use]
    pub fn schema_mapping(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SchemaMapping, Stage::Transform, code, message)
    }

    /// Destination contention or transient failure (retryable).
    #[must_use]
    pub fn apply_conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ApplyConflict, Stage::Apply, code, message)
    }

    /// Destination-side validation rejection (dead-lettered immediately).
    #[must_use]
    pub fn apply_rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ApplyRejected, Stage::Apply, code, message)
    }

    /// Source writeback failure (retryable).
    #[must_use]
    pub fn writeback(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Writeback, Stage::Writeback, code, message)
    }

    /// Transport-level failure of an external call in `stage`. Retryable.
    #[must_use]
    pub fn transient(stage: Stage, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(stage.transient_kind(), stage, code, message)
    }

    /// External call in `stage` exceeded its deadline. Always retryable.
    #[must_use]
    pub fn timeout(stage: Stage, after: Duration) -> Self {
        Self::transient(
            stage,
            "TIMEOUT",
            format!("{stage} call timed out after {}ms", after.as_millis()),
        )
    }

    /// Attach structured diagnostic details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Raw event rejected by the ingestor. Lists every problem found.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed change event: {}", problems.join("; "))]
pub struct MalformedEventError {
    pub problems: Vec<String>,
}

impl From<MalformedEventError> for RelayError {
    fn from(err: MalformedEventError) -> Self {
        let message = err.to_string();
        RelayError::malformed_event("MALFORMED_EVENT", message)
            .with_details(serde_json::json!({ "problems": err.problems }))
    }
}
