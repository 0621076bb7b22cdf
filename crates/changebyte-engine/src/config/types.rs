//! Relay pipeline configuration model, deserialized from YAML.

use std::time::Duration;

use changebyte_types::event::Operation;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub version: String,
    pub pipeline: String,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub state: StateConfig,
}

/// Where change events come from, and which of them to relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "use")]
    pub use_ref: String,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Entity types to relay. Empty relays every type.
    #[serde(default)]
    pub entity_types: Vec<String>,
    /// Operations to relay. Empty relays every operation.
    #[serde(default)]
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    #[serde(rename = "use")]
    pub use_ref: String,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Opaque credential string handed to the destination connector.
    #[serde(default)]
    pub credentials: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
}

fn default_endpoints() -> Vec<String> {
    vec!["memory://local".to_string()]
}

fn default_partitions() -> u32 {
    16
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            partitions: default_partitions(),
        }
    }
}

/// Handling for events whose entity type has no mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmappedEntities {
    /// Dead-letter with a schema mapping error.
    #[default]
    Reject,
    /// Relay the payload unchanged, keyed by source id.
    Passthrough,
}

/// Handling for payload fields no rule touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmappedFields {
    #[default]
    Keep,
    Drop,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default)]
    pub unmapped_entities: UnmappedEntities,
    #[serde(default)]
    pub mappings: Vec<EntityMapping>,
}

/// Field mapping for one source entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMapping {
    pub entity_type: String,
    /// Destination entity. Defaults to `entity_type`.
    #[serde(default)]
    pub target: Option<String>,
    /// Output field holding the destination natural key. Defaults to the
    /// event's source id.
    #[serde(default)]
    pub natural_key: Option<String>,
    #[serde(default)]
    pub unmapped: UnmappedFields,
    /// Fields that must be present and non-null after the rules run.
    #[serde(default)]
    pub required: Vec<String>,
    /// Written as single-key maps (`- rename: { from: a, to: b }`), with
    /// unit conditions as plain strings (`when: is_null`).
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub rules: Vec<RuleSpec>,
}

/// One field rule, applied in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSpec {
    Rename {
        from: String,
        to: String,
    },
    Cast {
        field: String,
        to: CastType,
    },
    Default {
        field: String,
        value: serde_json::Value,
    },
    Drop {
        field: String,
        #[serde(default)]
        when: Option<DropCondition>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CastType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropCondition {
    IsNull,
    Equals(serde_json::Value),
    Matches(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub cap_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_retry_base_ms() -> u64 {
    200
}
fn default_retry_cap_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: default_retry_base_ms(),
            cap_ms: default_retry_cap_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_shards")]
    pub shards: u32,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

fn default_shards() -> u32 {
    4
}
fn default_idle_poll_ms() -> u64 {
    25
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

/// Deadlines for calls that leave the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_queue_ms")]
    pub queue_ms: u64,
    #[serde(default = "default_destination_ms")]
    pub destination_ms: u64,
    #[serde(default = "default_writeback_ms")]
    pub writeback_ms: u64,
}

fn default_queue_ms() -> u64 {
    5_000
}
fn default_destination_ms() -> u64 {
    10_000
}
fn default_writeback_ms() -> u64 {
    10_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            queue_ms: default_queue_ms(),
            destination_ms: default_destination_ms(),
            writeback_ms: default_writeback_ms(),
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn queue(&self) -> Duration {
        Duration::from_millis(self.queue_ms)
    }

    #[must_use]
    pub fn destination(&self) -> Duration {
        Duration::from_millis(self.destination_ms)
    }

    #[must_use]
    pub fn writeback(&self) -> Duration {
        Duration::from_millis(self.writeback_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackendKind,
    pub connection: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal_pipeline() {
        let yaml = r#"
version: "1.0"
pipeline: accounts_to_crm
source:
  use: jsonl
  config:
    path: /tmp/changes.jsonl
destination:
  use: sqlite
  config:
    path: /tmp/crm.db
"#;
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pipeline, "accounts_to_crm");
        assert_eq!(config.source.use_ref, "jsonl");
        assert!(config.source.entity_types.is_empty());
        // Defaults applied
        assert_eq!(config.broker.partitions, 16);
        assert_eq!(config.broker.endpoints, vec!["memory://local"]);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.workers.shards, 4);
        assert_eq!(config.timeouts.destination(), Duration::from_secs(10));
        assert_eq!(config.state.backend, StateBackendKind::Sqlite);
        assert_eq!(
            config.transform.unmapped_entities,
            UnmappedEntities::Reject
        );
    }

    #[test]
    fn test_deserialize_full_pipeline() {
        let yaml = r#"
version: "1.0"
pipeline: full
source:
  use: jsonl
  config:
    path: changes.jsonl
  entity_types: [Account]
  operations: [create, UPDATE]
destination:
  use: sqlite
  config:
    path: crm.db
  credentials: s3cret
broker:
  endpoints: ["memory://a", "memory://b"]
  partitions: 4
transform:
  unmapped_entities: passthrough
  mappings:
    - entity_type: Account
      target: Customer
      natural_key: account_number
      unmapped: drop
      required: [name]
      rules:
        - rename: { from: acct_no, to: account_number }
        - cast: { field: balance, to: float }
        - default: { field: tier, value: standard }
        - drop: { field: notes, when: is_null }
        - drop: { field: status, when: { equals: archived } }
        - drop: { field: email, when: { matches: "@example\\.com$" } }
retry:
  base_ms: 50
  cap_ms: 1000
  max_attempts: 3
workers:
  shards: 2
  idle_poll_ms: 5
timeouts:
  queue_ms: 100
  destination_ms: 200
  writeback_ms: 300
state:
  backend: sqlite
  connection: /tmp/state.db
"#;
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.source.operations,
            vec![Operation::Create, Operation::Update]
        );
        assert_eq!(config.destination.credentials.as_deref(), Some("s3cret"));
        assert_eq!(config.broker.partitions, 4);
        assert_eq!(
            config.transform.unmapped_entities,
            UnmappedEntities::Passthrough
        );

        let mapping = &config.transform.mappings[0];
        assert_eq!(mapping.target.as_deref(), Some("Customer"));
        assert_eq!(mapping.unmapped, UnmappedFields::Drop);
        assert_eq!(mapping.rules.len(), 6);
        assert_eq!(
            mapping.rules[0],
            RuleSpec::Rename {
                from: "acct_no".into(),
                to: "account_number".into()
            }
        );
        assert_eq!(
            mapping.rules[1],
            RuleSpec::Cast {
                field: "balance".into(),
                to: CastType::Float
            }
        );
        assert_eq!(
            mapping.rules[3],
            RuleSpec::Drop {
                field: "notes".into(),
                when: Some(DropCondition::IsNull)
            }
        );
        assert_eq!(
            mapping.rules[4],
            RuleSpec::Drop {
                field: "status".into(),
                when: Some(DropCondition::Equals(serde_json::json!("archived")))
            }
        );
        assert_eq!(
            mapping.rules[5],
            RuleSpec::Drop {
                field: "email".into(),
                when: Some(DropCondition::Matches("@example\\.com$".into()))
            }
        );

        assert_eq!(config.retry.base_ms, 50);
        assert_eq!(config.workers.shards, 2);
        assert_eq!(config.timeouts.writeback(), Duration::from_millis(300));
        assert_eq!(config.state.connection.as_deref(), Some("/tmp/state.db"));
    }

    #[test]
    fn test_unknown_rule_is_rejected() {
        let yaml = r#"
version: "1.0"
pipeline: bad
source: { use: jsonl }
destination: { use: sqlite }
transform:
  mappings:
    - entity_type: Account
      rules:
        - explode: { field: x }
"#;
        assert!(serde_yaml::from_str::<PipelineConfig>(yaml).is_err());
    }
}
