//! Transformed records, apply results, and correlation records.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::event::{FieldMap, Operation};

/// Deterministic identifier for one (source_id, sequence) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    /// Hex-encoded SHA-256 over `source_id`, a NUL separator, and the
    /// big-endian sequence.
    #[must_use]
    pub fn derive(source_id: &str, sequence: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(sequence.to_be_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Wrap an already-derived key (e.g. read back from storage).
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Record in destination schema, ready for the applier. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedRecord {
    pub dedup_key: DedupKey,
    pub source_id: String,
    pub sequence: u64,
    /// Destination entity name.
    pub entity: String,
    /// Merge key in the destination store. `None` for a DELETE that does
    /// not carry its key field; the applier then uses the key recorded for
    /// the source id by earlier changes.
    pub natural_key: Option<String>,
    pub fields: FieldMap,
    pub operation: Operation,
}

/// Why an apply call left the destination untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Dedup key already recorded; cached result returned.
    Duplicate,
    /// Sequence at or below the last-applied sequence for the source id.
    StaleSequence,
    /// DELETE for a record the destination has never seen.
    MissingTarget,
}

impl SkipReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::StaleSequence => "stale_sequence",
            Self::MissingTarget => "missing_target",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "duplicate" => Some(Self::Duplicate),
            "stale_sequence" => Some(Self::StaleSequence),
            "missing_target" => Some(Self::MissingTarget),
            _ => None,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of applying one record.
///
/// `applied` is true only when this call mutated the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub destination_id: Option<String>,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
}

impl ApplyResult {
    #[must_use]
    pub fn applied(destination_id: impl Into<String>) -> Self {
        Self {
            destination_id: Some(destination_id.into()),
            applied: true,
            reason: None,
        }
    }

    #[must_use]
    pub fn skipped(reason: SkipReason, destination_id: Option<String>) -> Self {
        Self {
            destination_id,
            applied: false,
            reason: Some(reason),
        }
    }

    /// The cached form returned when a dedup key is seen again.
    #[must_use]
    pub fn as_duplicate(&self) -> Self {
        Self::skipped(SkipReason::Duplicate, self.destination_id.clone())
    }
}

/// Destination id written back to a source record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationRecord {
    pub source_id: String,
    pub destination_id: String,
    pub applied_sequence: u64,
}

impl CorrelationRecord {
    /// True when writing `self` after `existing` would change nothing.
    #[must_use]
    pub fn is_covered_by(&self, existing: &CorrelationRecord) -> bool {
        existing.source_id == self.source_id
            && (existing.destination_id == self.destination_id
                || existing.applied_sequence >= self.applied_sequence)
    }
}
