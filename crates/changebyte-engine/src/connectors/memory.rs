//! In-memory connectors with failure injection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;

use changebyte_types::event::FieldMap;
use changebyte_types::record::CorrelationRecord;

use crate::apply::{DestinationError, DestinationRow, DestinationStore, RowWrite};
use crate::connectors::ChangeSource;
use crate::writeback::SourceWriteback;

/// Replays a fixed list of raw events.
#[derive(Debug, Default)]
pub struct MemorySource {
    events: VecDeque<Vec<u8>>,
}

impl MemorySource {
    #[must_use]
    pub fn new(events: impl IntoIterator<Item = Value>) -> Self {
        Self {
            events: events.into_iter().map(|v| v.to_string().into_bytes()).collect(),
        }
    }

    /// Raw bytes, passed to the ingestor as-is.
    #[must_use]
    pub fn from_raw(events: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            events: events.into_iter().collect(),
        }
    }
}

impl ChangeSource for MemorySource {
    fn poll(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.events.pop_front())
    }
}

/// Collects correlations; the next `n` calls can be made to fail.
#[derive(Debug, Default)]
pub struct MemoryWriteback {
    written: Mutex<Vec<CorrelationRecord>>,
    failures: AtomicU32,
    calls: AtomicU64,
}

impl MemoryWriteback {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Every successful write, in order.
    #[must_use]
    pub fn written(&self) -> Vec<CorrelationRecord> {
        self.written.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Calls made, failed ones included.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SourceWriteback for MemoryWriteback {
    fn write_correlation(&self, record: &CorrelationRecord) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("injected writeback failure");
        }
        self.written
            .lock()
            .map_err(|_| anyhow::anyhow!("writeback lock poisoned"))?
            .push(record.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Rows {
    by_key: BTreeMap<(String, String), DestinationRow>,
    next_id: u64,
}

/// Versioned key-value destination.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    rows: Mutex<Rows>,
    required: HashMap<String, Vec<String>>,
    injected: Mutex<VecDeque<DestinationError>>,
    mutations: AtomicU64,
}

impl MemoryDestination {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject non-delete writes to `entity` lacking any of `fields`.
    #[must_use]
    pub fn with_required(mut self, entity: &str, fields: &[&str]) -> Self {
        self.required.insert(
            entity.to_string(),
            fields.iter().map(ToString::to_string).collect(),
        );
        self
    }

    /// Queue an error for the next `put`.
    pub fn fail_next(&self, err: DestinationError) {
        if let Ok(mut injected) = self.injected.lock() {
            injected.push_back(err);
        }
    }

    /// Successful writes so far.
    #[must_use]
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn row(&self, entity: &str, natural_key: &str) -> Option<DestinationRow> {
        self.rows
            .lock()
            .ok()?
            .by_key
            .get(&(entity.to_string(), natural_key.to_string()))
            .cloned()
    }

    /// Live (non-tombstoned) rows of `entity`, keyed by natural key.
    #[must_use]
    pub fn live_rows(&self, entity: &str) -> BTreeMap<String, FieldMap> {
        self.rows
            .lock()
            .map(|rows| {
                rows.by_key
                    .iter()
                    .filter(|((e, _), row)| e == entity && !row.deleted)
                    .map(|((_, key), row)| (key.clone(), row.fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn poisoned() -> DestinationError {
    DestinationError::Unavailable("memory destination lock poisoned".into())
}

impl DestinationStore for MemoryDestination {
    fn get(
        &self,
        entity: &str,
        natural_key: &str,
    ) -> Result<Option<DestinationRow>, DestinationError> {
        let rows = self.rows.lock().map_err(|_| poisoned())?;
        Ok(rows
            .by_key
            .get(&(entity.to_string(), natural_key.to_string()))
            .cloned())
    }

    fn put(
        &self,
        entity: &str,
        natural_key: &str,
        write: RowWrite<'_>,
    ) -> Result<DestinationRow, DestinationError> {
        if let Some(err) = self.injected.lock().map_err(|_| poisoned())?.pop_front() {
            return Err(err);
        }
        if !write.deleted {
            if let Some(required) = self.required.get(entity) {
                if let Some(missing) = required
                    .iter()
                    .find(|f| write.fields.get(*f).map_or(true, Value::is_null))
                {
                    return Err(DestinationError::Rejected(format!(
                        "{entity}.{missing} is required"
                    )));
                }
            }
        }

        let mut rows = self.rows.lock().map_err(|_| poisoned())?;
        let key = (entity.to_string(), natural_key.to_string());
        let current = rows.by_key.get(&key).map(|r| (r.version, r.destination_id.clone()));

        let (version, destination_id) = match (current, write.expected_version) {
            (None, None) => {
                rows.next_id += 1;
                (1, format!("{entity}:{}", rows.next_id))
            }
            (Some((stored, id)), Some(expected)) if stored == expected => (stored + 1, id),
            (Some((stored, _)), expected) => {
                return Err(DestinationError::Conflict(format!(
                    "{entity}/{natural_key} is at version {stored}, expected {expected:?}"
                )));
            }
            (None, Some(expected)) => {
                return Err(DestinationError::Conflict(format!(
                    "{entity}/{natural_key} vanished, expected version {expected}"
                )));
            }
        };

        let row = DestinationRow {
            destination_id,
            fields: write.fields.clone(),
            version,
            deleted: write.deleted,
        };
        rows.by_key.insert(key, row.clone());
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(name: &str) -> FieldMap {
        let mut f = FieldMap::new();
        f.insert("name".into(), json!(name));
        f
    }

    #[test]
    fn test_source_drains_in_order() {
        let mut source = MemorySource::new(vec![json!({"a": 1}), json!({"a": 2})]);
        assert_eq!(source.poll().unwrap().unwrap(), br#"{"a":1}"#.to_vec());
        assert_eq!(source.poll().unwrap().unwrap(), br#"{"a":2}"#.to_vec());
        assert!(source.poll().unwrap().is_none());
    }

    #[test]
    fn test_optimistic_lock() {
        let dest = MemoryDestination::new();
        let f = fields("X");
        let row = dest
            .put("Customer", "A1", RowWrite { fields: &f, deleted: false, expected_version: None })
            .unwrap();
        assert_eq!(row.version, 1);
        assert_eq!(row.destination_id, "Customer:1");

        // Insert over an existing row conflicts.
        let err = dest
            .put("Customer", "A1", RowWrite { fields: &f, deleted: false, expected_version: None })
            .unwrap_err();
        assert!(matches!(err, DestinationError::Conflict(_)));

        // Stale version conflicts.
        let err = dest
            .put("Customer", "A1", RowWrite { fields: &f, deleted: false, expected_version: Some(7) })
            .unwrap_err();
        assert!(matches!(err, DestinationError::Conflict(_)));

        let row = dest
            .put("Customer", "A1", RowWrite { fields: &f, deleted: false, expected_version: Some(1) })
            .unwrap();
        assert_eq!(row.version, 2);
        assert_eq!(row.destination_id, "Customer:1");
        assert_eq!(dest.mutation_count(), 2);
    }

    #[test]
    fn test_required_fields_rejected() {
        let dest = MemoryDestination::new().with_required("Customer", &["email"]);
        let err = dest
            .put(
                "Customer",
                "A1",
                RowWrite { fields: &fields("X"), deleted: false, expected_version: None },
            )
            .unwrap_err();
        assert_eq!(err, DestinationError::Rejected("Customer.email is required".into()));
    }

    #[test]
    fn test_writeback_failure_injection_counts_calls() {
        let wb = MemoryWriteback::new();
        wb.fail_next(1);
        let record = CorrelationRecord {
            source_id: "A1".into(),
            destination_id: "Customer:1".into(),
            applied_sequence: 1,
        };
        assert!(wb.write_correlation(&record).is_err());
        assert!(wb.write_correlation(&record).is_ok());
        assert_eq!(wb.calls(), 2);
        assert_eq!(wb.written(), vec![record]);
    }
}
