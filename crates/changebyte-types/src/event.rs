//! Normalized change events emitted by a source system's CDC stream.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::envelope::Timestamp;

/// Largest sequence the relay accepts. Sequences are stored as signed
/// 64-bit integers.
pub const MAX_SEQUENCE: u64 = i64::MAX.unsigned_abs();

/// Field name to JSON value. Ordered so transforms are deterministic.
pub type FieldMap = BTreeMap<String, serde_json::Value>;

/// Kind of change captured for a source record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    #[serde(alias = "create", alias = "INSERT", alias = "insert")]
    Create,
    #[serde(alias = "update")]
    Update,
    #[serde(alias = "delete")]
    Delete,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Case-insensitive parse. `INSERT` is accepted for binlog-style sources.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CREATE" | "INSERT" => Some(Self::Create),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single change to a source record.
///
/// `sequence` is strictly increasing per `source_id`; anything at or below the
/// last-applied sequence is dropped downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub source_id: String,
    pub entity_type: String,
    pub operation: Operation,
    pub sequence: u64,
    #[serde(default)]
    pub payload: FieldMap,
    pub emitted_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_parse_accepts_aliases() {
        assert_eq!(Operation::parse("insert"), Some(Operation::Create));
        assert_eq!(Operation::parse(" Update "), Some(Operation::Update));
        assert_eq!(Operation::parse("DELETE"), Some(Operation::Delete));
        assert_eq!(Operation::parse("upsert"), None);
    }

    #[test]
    fn operation_serializes_upper_case() {
        let json = serde_json::to_string(&Operation::Delete).unwrap();
        assert_eq!(json, "\"DELETE\"");
    }

    #[test]
    fn change_event_payload_defaults_to_empty() {
        let event: ChangeEvent = serde_json::from_value(serde_json::json!({
            "source_id": "A1",
            "entity_type": "Account",
            "operation": "DELETE",
            "sequence": 9,
            "emitted_at": "2026-03-01T00:00:00Z"
        }))
        .unwrap();
        assert!(event.payload.is_empty());
        assert_eq!(event.operation, Operation::Delete);
    }
}
