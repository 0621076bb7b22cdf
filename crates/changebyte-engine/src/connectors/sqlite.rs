//! `SQLite` destination store.
//!
//! All entities share one `records` table keyed by `(entity, natural_key)`.
//! Field maps are stored as JSON. The `version` column is the optimistic-lock
//! token: updates only land when it still holds the value the applier read.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;

use changebyte_types::event::FieldMap;

use crate::apply::{DestinationError, DestinationRow, DestinationStore, RowWrite};

const CREATE_RECORDS: &str = "
CREATE TABLE IF NOT EXISTS records (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    entity      TEXT NOT NULL,
    natural_key TEXT NOT NULL,
    fields_json TEXT NOT NULL,
    version     INTEGER NOT NULL,
    deleted     INTEGER NOT NULL DEFAULT 0,
    updated_at  TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (entity, natural_key)
);
";

pub struct SqliteDestination {
    conn: Mutex<Connection>,
    required: HashMap<String, Vec<String>>,
}

fn unavailable(context: &str, err: &rusqlite::Error) -> DestinationError {
    DestinationError::Unavailable(format!("{context}: {err}"))
}

fn to_sql_version(version: u64) -> Result<i64, DestinationError> {
    i64::try_from(version)
        .map_err(|_| DestinationError::Rejected(format!("version {version} out of range")))
}

impl SqliteDestination {
    /// Open or create the destination database. `required` lists, per
    /// entity, fields a non-delete write must carry.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: &Path, required: HashMap<String, Vec<String>>) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open destination db: {}", path.display()))?;
        Self::init(conn, required)
    }

    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn in_memory(required: HashMap<String, Vec<String>>) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, required)
    }

    fn init(conn: Connection, required: HashMap<String, Vec<String>>) -> Result<Self> {
        conn.execute_batch(CREATE_RECORDS)
            .context("Failed to create destination schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            required,
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, DestinationError> {
        self.conn
            .lock()
            .map_err(|_| DestinationError::Unavailable("destination lock poisoned".into()))
    }

    fn read(
        conn: &Connection,
        entity: &str,
        natural_key: &str,
    ) -> Result<Option<DestinationRow>, DestinationError> {
        let row = conn
            .query_row(
                "SELECT id, fields_json, version, deleted FROM records
                 WHERE entity = ?1 AND natural_key = ?2",
                params![entity, natural_key],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, bool>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| unavailable("read", &e))?;

        row.map(|(id, fields_json, version, deleted)| {
            let fields: FieldMap = serde_json::from_str(&fields_json).map_err(|e| {
                DestinationError::Unavailable(format!("corrupt row {entity}:{id}: {e}"))
            })?;
            Ok(DestinationRow {
                destination_id: format!("{entity}:{id}"),
                fields,
                version: u64::try_from(version).unwrap_or_default(),
                deleted,
            })
        })
        .transpose()
    }

    fn check_required(&self, entity: &str, fields: &FieldMap) -> Result<(), DestinationError> {
        let Some(required) = self.required.get(entity) else {
            return Ok(());
        };
        let missing: Vec<&str> = required
            .iter()
            .filter(|f| fields.get(*f).map_or(true, Value::is_null))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DestinationError::Rejected(format!(
                "{entity} requires {}",
                missing.join(", ")
            )))
        }
    }
}

impl DestinationStore for SqliteDestination {
    fn get(
        &self,
        entity: &str,
        natural_key: &str,
    ) -> Result<Option<DestinationRow>, DestinationError> {
        let conn = self.lock_conn()?;
        Self::read(&conn, entity, natural_key)
    }

    fn put(
        &self,
        entity: &str,
        natural_key: &str,
        write: RowWrite<'_>,
    ) -> Result<DestinationRow, DestinationError> {
        if !write.deleted {
            self.check_required(entity, write.fields)?;
        }
        let fields_json = serde_json::to_string(write.fields)
            .map_err(|e| DestinationError::Rejected(format!("fields not serializable: {e}")))?;

        let conn = self.lock_conn()?;
        let changed = match write.expected_version {
            None => conn
                .execute(
                    "INSERT INTO records (entity, natural_key, fields_json, version, deleted)
                     VALUES (?1, ?2, ?3, 1, ?4)",
                    params![entity, natural_key, fields_json, write.deleted],
                )
                .or_else(|e| match e.sqlite_error_code() {
                    Some(ErrorCode::ConstraintViolation) => Ok(0),
                    _ => Err(unavailable("insert", &e)),
                })?,
            Some(expected) => conn
                .execute(
                    "UPDATE records
                     SET fields_json = ?3, version = version + 1, deleted = ?4,
                         updated_at = datetime('now')
                     WHERE entity = ?1 AND natural_key = ?2 AND version = ?5",
                    params![
                        entity,
                        natural_key,
                        fields_json,
                        write.deleted,
                        to_sql_version(expected)?
                    ],
                )
                .map_err(|e| unavailable("update", &e))?,
        };

        if changed == 0 {
            return Err(DestinationError::Conflict(format!(
                "{entity}/{natural_key} changed since expected version {:?}",
                write.expected_version
            )));
        }

        Self::read(&conn, entity, natural_key)?.ok_or_else(|| {
            DestinationError::Unavailable(format!("{entity}/{natural_key} missing after write"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn write(f: &FieldMap, expected_version: Option<u64>) -> RowWrite<'_> {
        RowWrite {
            fields: f,
            deleted: false,
            expected_version,
        }
    }

    #[test]
    fn test_insert_then_versioned_update() {
        let dest = SqliteDestination::in_memory(HashMap::new()).unwrap();
        let f = fields(&[("name", json!("Acme")), ("balance", json!(12.5))]);

        let row = dest.put("Customer", "ACC-1", write(&f, None)).unwrap();
        assert_eq!(row.version, 1);
        assert!(row.destination_id.starts_with("Customer:"));
        assert_eq!(row.fields, f);

        let g = fields(&[("name", json!("Acme Ltd"))]);
        let updated = dest.put("Customer", "ACC-1", write(&g, Some(1))).unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.destination_id, row.destination_id);

        let read = dest.get("Customer", "ACC-1").unwrap().unwrap();
        assert_eq!(read.fields["name"], json!("Acme Ltd"));
    }

    #[test]
    fn test_conflicts() {
        let dest = SqliteDestination::in_memory(HashMap::new()).unwrap();
        let f = fields(&[("name", json!("Acme"))]);
        dest.put("Customer", "ACC-1", write(&f, None)).unwrap();

        let dup = dest.put("Customer", "ACC-1", write(&f, None)).unwrap_err();
        assert!(matches!(dup, DestinationError::Conflict(_)));

        let stale = dest.put("Customer", "ACC-1", write(&f, Some(5))).unwrap_err();
        assert!(matches!(stale, DestinationError::Conflict(_)));
    }

    #[test]
    fn test_same_key_different_entities_are_distinct() {
        let dest = SqliteDestination::in_memory(HashMap::new()).unwrap();
        let f = fields(&[("x", json!(1))]);
        let a = dest.put("Customer", "K", write(&f, None)).unwrap();
        let b = dest.put("Contact", "K", write(&f, None)).unwrap();
        assert_ne!(a.destination_id, b.destination_id);
    }

    #[test]
    fn test_required_field_rejection_skips_deletes() {
        let required = HashMap::from([("Customer".to_string(), vec!["email".to_string()])]);
        let dest = SqliteDestination::in_memory(required).unwrap();
        let f = fields(&[("name", json!("Acme")), ("email", json!(null))]);

        let err = dest.put("Customer", "ACC-1", write(&f, None)).unwrap_err();
        assert_eq!(err, DestinationError::Rejected("Customer requires email".into()));

        let tombstone = RowWrite {
            fields: &f,
            deleted: true,
            expected_version: None,
        };
        assert!(dest.put("Customer", "ACC-1", tombstone).unwrap().deleted);
    }

    #[test]
    fn test_file_backed_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("crm.db");
        {
            let dest = SqliteDestination::open(&path, HashMap::new()).unwrap();
            let f = fields(&[("name", json!("Acme"))]);
            dest.put("Customer", "ACC-1", write(&f, None)).unwrap();
        }
        let dest = SqliteDestination::open(&path, HashMap::new()).unwrap();
        assert!(dest.get("Customer", "ACC-1").unwrap().is_some());
    }
}
