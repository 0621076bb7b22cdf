//! Connector and state backend construction from pipeline config.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use changebyte_state::{SqliteStateBackend, StateBackend};
use serde_json::Value;

use crate::apply::DestinationStore;
use crate::config::types::{PipelineConfig, StateBackendKind};
use crate::connectors::jsonl::{default_writeback_path, JsonlSource, JsonlWriteback};
use crate::connectors::memory::{MemoryDestination, MemorySource, MemoryWriteback};
use crate::connectors::sqlite::SqliteDestination;
use crate::connectors::ChangeSource;
use crate::queue::{DurableQueue, MemoryQueue};
use crate::writeback::SourceWriteback;

fn config_str<'a>(config: &'a Value, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str)
}

fn required_path(connector: &str, config: &Value) -> Result<PathBuf> {
    config_str(config, "path")
        .map(PathBuf::from)
        .with_context(|| format!("Connector '{connector}' requires config.path"))
}

/// Per-entity required fields from `config.required`.
fn required_fields(config: &Value) -> Result<HashMap<String, Vec<String>>> {
    match config.get("required") {
        None | Some(Value::Null) => Ok(HashMap::new()),
        Some(v) => serde_json::from_value(v.clone())
            .context("destination config.required must map entity names to field lists"),
    }
}

pub(crate) fn create_state_backend(config: &PipelineConfig) -> Result<Arc<dyn StateBackend>> {
    match config.state.backend {
        StateBackendKind::Sqlite => {
            let backend = if let Some(path) = &config.state.connection {
                SqliteStateBackend::open(Path::new(path)).context("Failed to open state DB")?
            } else {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                let state_path = PathBuf::from(home).join(".changebyte").join("state.db");
                SqliteStateBackend::open(&state_path)
                    .context("Failed to open default state DB")?
            };
            Ok(Arc::new(backend) as Arc<dyn StateBackend>)
        }
    }
}

pub(crate) fn open_source(config: &PipelineConfig) -> Result<Box<dyn ChangeSource>> {
    let source = &config.source;
    match source.use_ref.as_str() {
        "jsonl" => {
            let path = required_path("jsonl", &source.config)?;
            Ok(Box::new(JsonlSource::open(&path)?))
        }
        "memory" => {
            let events = match source.config.get("events") {
                Some(Value::Array(events)) => events.clone(),
                None | Some(Value::Null) => Vec::new(),
                Some(_) => anyhow::bail!("memory source config.events must be a list"),
            };
            Ok(Box::new(MemorySource::new(events)))
        }
        other => anyhow::bail!("Unknown source connector '{other}' (expected jsonl or memory)"),
    }
}

pub(crate) fn open_writeback(config: &PipelineConfig) -> Result<Arc<dyn SourceWriteback>> {
    let source = &config.source;
    match source.use_ref.as_str() {
        "jsonl" => {
            let path = match config_str(&source.config, "writeback_path") {
                Some(p) => PathBuf::from(p),
                None => default_writeback_path(&required_path("jsonl", &source.config)?),
            };
            tracing::debug!(path = %path.display(), "Opening JSONL writeback");
            Ok(Arc::new(JsonlWriteback::open(&path)?))
        }
        "memory" => Ok(Arc::new(MemoryWriteback::new())),
        other => anyhow::bail!("Unknown source connector '{other}' (expected jsonl or memory)"),
    }
}

pub(crate) fn open_destination(config: &PipelineConfig) -> Result<Arc<dyn DestinationStore>> {
    let destination = &config.destination;
    if destination.credentials.is_some() {
        tracing::debug!(
            connector = destination.use_ref.as_str(),
            "Destination credentials configured"
        );
    }
    let required = required_fields(&destination.config)?;
    match destination.use_ref.as_str() {
        "sqlite" => {
            let path = required_path("sqlite", &destination.config)?;
            Ok(Arc::new(SqliteDestination::open(&path, required)?))
        }
        "memory" => {
            let mut store = MemoryDestination::new();
            for (entity, fields) in &required {
                let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
                store = store.with_required(entity, &fields);
            }
            Ok(Arc::new(store))
        }
        other => {
            anyhow::bail!("Unknown destination connector '{other}' (expected sqlite or memory)")
        }
    }
}

/// Only `memory://` brokers are bundled. The log lives as long as the run.
pub(crate) fn create_queue(config: &PipelineConfig) -> Result<Arc<dyn DurableQueue>> {
    let broker = &config.broker;
    if let Some(endpoint) = broker
        .endpoints
        .iter()
        .find(|e| !e.starts_with("memory://"))
    {
        anyhow::bail!("Unsupported broker endpoint '{endpoint}' (only memory:// is bundled)");
    }
    Ok(Arc::new(MemoryQueue::new(broker.partitions)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_pipeline_str;
    use changebyte_types::state::PipelineId;
    use tempfile::tempdir;

    fn config(yaml: &str) -> PipelineConfig {
        parse_pipeline_str(yaml).unwrap()
    }

    #[test]
    fn test_create_state_backend_custom_path() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("state.db");
        let config = config(&format!(
            r#"
version: "1.0"
pipeline: test
source: {{ use: memory }}
destination: {{ use: memory }}
state:
  connection: "{}"
"#,
            db_path.display()
        ));

        let backend = create_state_backend(&config).unwrap();
        let run_id = backend.start_run(&PipelineId::new("test")).unwrap();
        assert!(run_id > 0);
        assert!(db_path.exists());
    }

    #[test]
    fn test_memory_source_reads_inline_events() {
        let config = config(
            r#"
version: "1.0"
pipeline: test
source:
  use: memory
  config:
    events:
      - { source_id: A1, entity_type: Account, operation: CREATE, sequence: 1, payload: {}, emitted_at: "2026-01-15T10:30:00Z" }
destination: { use: memory }
"#,
        );
        let mut source = open_source(&config).unwrap();
        assert!(source.poll().unwrap().is_some());
        assert!(source.poll().unwrap().is_none());
    }

    #[test]
    fn test_jsonl_source_requires_path() {
        let config = config(
            r#"
version: "1.0"
pipeline: test
source: { use: jsonl }
destination: { use: memory }
"#,
        );
        let err = open_source(&config).err().unwrap().to_string();
        assert!(err.contains("config.path"), "{err}");
    }

    #[test]
    fn test_unknown_connectors_rejected() {
        let config = config(
            r#"
version: "1.0"
pipeline: test
source: { use: kafka }
destination: { use: postgres }
"#,
        );
        assert!(open_source(&config).is_err());
        assert!(open_writeback(&config).is_err());
        let err = open_destination(&config).err().unwrap().to_string();
        assert!(err.contains("postgres"));
    }

    #[test]
    fn test_memory_destination_required_fields() {
        let config = config(
            r#"
version: "1.0"
pipeline: test
source: { use: memory }
destination:
  use: memory
  config:
    required:
      Customer: [email]
"#,
        );
        let dest = open_destination(&config).unwrap();
        let fields = changebyte_types::event::FieldMap::new();
        let err = dest
            .put(
                "Customer",
                "A1",
                crate::apply::RowWrite {
                    fields: &fields,
                    deleted: false,
                    expected_version: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, crate::apply::DestinationError::Rejected(_)));
    }

    #[test]
    fn test_only_memory_broker_bundled() {
        let mut cfg = config(
            r#"
version: "1.0"
pipeline: test
source: { use: memory }
destination: { use: memory }
broker:
  partitions: 4
"#,
        );
        assert_eq!(create_queue(&cfg).unwrap().partitions(), 4);

        cfg.broker.endpoints = vec!["kafka://broker:9092".into()];
        let err = create_queue(&cfg).err().unwrap().to_string();
        assert!(err.contains("kafka://broker:9092"));
    }
}
