//! State backend model types.
//!
//! Pure data types used by `StateBackend` implementations. Kept in the types
//! crate so both engine and state crates can share them without circular
//! dependencies.

use serde::{Deserialize, Serialize};

use crate::envelope::{DeadLetterRecord, Timestamp};
use crate::record::DedupKey;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque pipeline identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(String);

impl PipelineId {
    /// Create a new pipeline identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for PipelineId {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

// ---------------------------------------------------------------------------
// Run tracking
// ---------------------------------------------------------------------------

/// Status of a relay run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    /// Stopped by a shutdown signal; uncommitted envelopes are redelivered.
    Interrupted,
}

impl RunStatus {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate statistics for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub events_read: u64,
    pub events_applied: u64,
    pub events_skipped: u64,
    pub dead_lettered: u64,
    pub retries: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// Apply journal and dead letters
// ---------------------------------------------------------------------------

/// Journal entry written before a destination upsert and cleared with the
/// dedup commit. A surviving entry marks an apply interrupted mid-flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApply {
    pub dedup_key: DedupKey,
    pub source_id: String,
    pub sequence: u64,
    pub started_at: Timestamp,
}

/// Dead-letter record as stored, with its channel metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDeadLetter {
    pub id: i64,
    pub pipeline: PipelineId,
    pub run_id: i64,
    pub record: DeadLetterRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replayed_at: Option<Timestamp>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_id_display_and_as_str() {
        let pid = PipelineId::new("crm-to-mdm");
        assert_eq!(pid.as_str(), "crm-to-mdm");
        assert_eq!(pid.to_string(), "crm-to-mdm");
    }

    #[test]
    fn pipeline_id_eq_and_hash() {
        use std::collections::HashSet;
        let a = PipelineId::new("p1");
        let b = PipelineId::from("p1");
        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn run_status_as_str() {
        assert_eq!(RunStatus::Running.as_str(), "running");
        assert_eq!(RunStatus::Completed.as_str(), "completed");
        assert_eq!(RunStatus::Failed.as_str(), "failed");
        assert_eq!(RunStatus::Interrupted.as_str(), "interrupted");
    }

    #[test]
    fn run_status_serde_matches_storage_form() {
        let json = serde_json::to_string(&RunStatus::Interrupted).unwrap();
        assert_eq!(json, "\"interrupted\"");
    }

    #[test]
    fn run_stats_default_is_zeroed() {
        let stats = RunStats::default();
        assert_eq!(stats.events_read, 0);
        assert_eq!(stats.dead_lettered, 0);
        assert!(stats.error_message.is_none());
    }
}
