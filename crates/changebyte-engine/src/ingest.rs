//! Normalization of raw source events into queue envelopes.
//!
//! Raw events arrive as bytes from a [`ChangeSource`](crate::connectors::ChangeSource).
//! The ingestor parses them, checks the required fields, and wraps the
//! resulting [`ChangeEvent`] in an [`Envelope`] routed by `source_id`.
//! Events failing validation come back as [`MalformedEventError`] listing
//! every problem found; the caller drops and logs them.

use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use changebyte_types::envelope::{Envelope, Timestamp};
use changebyte_types::error::MalformedEventError;
use changebyte_types::event::{ChangeEvent, FieldMap, Operation, MAX_SEQUENCE};
use changebyte_types::record::DedupKey;

const SOURCE_ID_KEYS: &[&str] = &["source_id"];
const ENTITY_TYPE_KEYS: &[&str] = &["entity_type", "table"];
const OPERATION_KEYS: &[&str] = &["operation", "type"];
const SEQUENCE_KEYS: &[&str] = &["sequence"];
const PAYLOAD_KEYS: &[&str] = &["payload", "data"];
const EMITTED_AT_KEYS: &[&str] = &["emitted_at", "timestamp"];
const CORRELATION_KEYS: &[&str] = &["correlation_id"];

/// Map a partition key onto `0..partitions`.
///
/// Stable across processes: the first eight bytes of the key's SHA-256
/// digest, big-endian, modulo the partition count.
#[must_use]
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let hash = u64::from_be_bytes(prefix);
    u32::try_from(hash % u64::from(partitions.max(1))).unwrap_or(0)
}

/// Entity-type and operation allow-lists. Empty lists admit everything.
#[derive(Debug, Clone, Default)]
pub struct IngestFilter {
    entity_types: HashSet<String>,
    operations: HashSet<Operation>,
}

impl IngestFilter {
    #[must_use]
    pub fn new(entity_types: &[String], operations: &[Operation]) -> Self {
        Self {
            entity_types: entity_types.iter().cloned().collect(),
            operations: operations.iter().copied().collect(),
        }
    }

    #[must_use]
    pub fn admits(&self, event: &ChangeEvent) -> bool {
        (self.entity_types.is_empty() || self.entity_types.contains(&event.entity_type))
            && (self.operations.is_empty() || self.operations.contains(&event.operation))
    }
}

/// Outcome of ingesting one raw event.
#[derive(Debug)]
pub enum Ingested {
    Accepted(Envelope),
    Filtered(Envelope),
}

#[derive(Debug, Clone)]
pub struct Ingestor {
    partitions: u32,
    filter: IngestFilter,
}

impl Ingestor {
    #[must_use]
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            filter: IngestFilter::default(),
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: IngestFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Parse and validate one raw event.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedEventError`] if the bytes are not a JSON object or
    /// any required field is missing or invalid.
    pub fn ingest_bytes(&self, raw: &[u8]) -> Result<Ingested, MalformedEventError> {
        let value: Value = serde_json::from_slice(raw).map_err(|e| MalformedEventError {
            problems: vec![format!("invalid JSON: {e}")],
        })?;
        self.ingest(&value)
    }

    /// Validate an already-parsed raw event.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedEventError`] listing every problem found.
    pub fn ingest(&self, raw: &Value) -> Result<Ingested, MalformedEventError> {
        let Some(obj) = raw.as_object() else {
            return Err(MalformedEventError {
                problems: vec!["event must be a JSON object".to_string()],
            });
        };

        let mut problems = Vec::new();

        let source_id = required_string(obj, SOURCE_ID_KEYS, &mut problems);
        let entity_type = required_string(obj, ENTITY_TYPE_KEYS, &mut problems);
        let operation = match lookup(obj, OPERATION_KEYS) {
            None => {
                problems.push("missing operation".to_string());
                None
            }
            Some(Value::String(s)) => {
                let op = Operation::parse(s);
                if op.is_none() {
                    problems.push(format!("unknown operation '{s}'"));
                }
                op
            }
            Some(other) => {
                problems.push(format!("operation must be a string, got {other}"));
                None
            }
        };
        let sequence = parse_sequence(lookup(obj, SEQUENCE_KEYS), &mut problems);
        let payload = parse_payload(lookup(obj, PAYLOAD_KEYS), operation, &mut problems);
        let emitted_at = parse_emitted_at(lookup(obj, EMITTED_AT_KEYS), &mut problems);
        let correlation_id = match lookup(obj, CORRELATION_KEYS) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(other) => {
                problems.push(format!("correlation_id must be a non-empty string, got {other}"));
                None
            }
        };

        let (
            Some(source_id),
            Some(entity_type),
            Some(operation),
            Some(sequence),
            Some(payload),
            Some(emitted_at),
        ) = (source_id, entity_type, operation, sequence, payload, emitted_at)
        else {
            return Err(MalformedEventError { problems });
        };
        if !problems.is_empty() {
            return Err(MalformedEventError { problems });
        }

        let event = ChangeEvent {
            source_id,
            entity_type,
            operation,
            sequence,
            payload,
            emitted_at,
        };
        let envelope = self.wrap(event, correlation_id);
        if self.filter.admits(&envelope.event) {
            Ok(Ingested::Accepted(envelope))
        } else {
            Ok(Ingested::Filtered(envelope))
        }
    }

    /// Wrap a validated event for the queue.
    #[must_use]
    pub fn wrap(&self, event: ChangeEvent, correlation_id: Option<String>) -> Envelope {
        let trace_id = correlation_id.unwrap_or_else(|| {
            let key = DedupKey::derive(&event.source_id, event.sequence);
            key.as_str()[..16].to_string()
        });
        let partition_key = event.source_id.clone();
        Envelope {
            partition: partition_for(&partition_key, self.partitions),
            partition_key,
            event,
            attempt_count: 0,
            dead_letter: false,
            trace_id,
        }
    }
}

fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k))
}

fn required_string(
    obj: &Map<String, Value>,
    keys: &[&str],
    problems: &mut Vec<String>,
) -> Option<String> {
    match lookup(obj, keys) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::String(_)) => {
            problems.push(format!("{} must not be empty", keys[0]));
            None
        }
        Some(other) => {
            problems.push(format!("{} must be a string, got {other}", keys[0]));
            None
        }
        None => {
            problems.push(format!("missing {}", keys[0]));
            None
        }
    }
}

fn parse_sequence(value: Option<&Value>, problems: &mut Vec<String>) -> Option<u64> {
    let sequence = match value {
        None => {
            problems.push("missing sequence".to_string());
            return None;
        }
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(_) => None,
    };
    match sequence {
        Some(seq) if seq > MAX_SEQUENCE => {
            problems.push(format!("sequence {seq} exceeds the maximum of {MAX_SEQUENCE}"));
            None
        }
        Some(seq) => Some(seq),
        None => {
            let shown = value.map(Value::to_string).unwrap_or_default();
            problems.push(format!("sequence must be a non-negative integer, got {shown}"));
            None
        }
    }
}

/// A missing or null payload is allowed for DELETE only.
fn parse_payload(
    value: Option<&Value>,
    operation: Option<Operation>,
    problems: &mut Vec<String>,
) -> Option<FieldMap> {
    match value {
        None | Some(Value::Null) => match operation {
            Some(op @ (Operation::Create | Operation::Update)) => {
                problems.push(format!("missing payload (required for {op})"));
                None
            }
            Some(Operation::Delete) | None => Some(FieldMap::new()),
        },
        Some(Value::Object(map)) => Some(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        Some(other) => {
            problems.push(format!("payload must be an object, got {other}"));
            None
        }
    }
}

fn parse_emitted_at(value: Option<&Value>, problems: &mut Vec<String>) -> Option<Timestamp> {
    match value {
        None => {
            problems.push("missing emitted_at".to_string());
            None
        }
        Some(Value::String(s)) => match DateTime::parse_from_rfc3339(s) {
            Ok(_) => Some(Timestamp::new(s.clone())),
            Err(e) => {
                problems.push(format!("emitted_at '{s}' is not RFC 3339: {e}"));
                None
            }
        },
        Some(Value::Number(n)) => {
            let parsed = n
                .as_i64()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
            match parsed {
                Some(dt) => Some(Timestamp::new(
                    dt.to_rfc3339_opts(SecondsFormat::Secs, true),
                )),
                None => {
                    problems.push(format!("emitted_at {n} is not a valid epoch timestamp"));
                    None
                }
            }
        }
        Some(other) => {
            problems.push(format!("emitted_at must be a timestamp, got {other}"));
            None
        }
    }
}
