//! Semantic validation for parsed pipeline configuration values.

use std::collections::HashSet;

use anyhow::{bail, Result};

use crate::config::types::{PipelineConfig, TimeoutConfig};
use crate::transform::CompiledMapping;

fn validate_timeouts(timeouts: &TimeoutConfig, errors: &mut Vec<String>) {
    for (name, value) in [
        ("queue_ms", timeouts.queue_ms),
        ("destination_ms", timeouts.destination_ms),
        ("writeback_ms", timeouts.writeback_ms),
    ] {
        if value == 0 {
            errors.push(format!("timeouts.{name} must be > 0"));
        }
    }
}

fn validate_mappings(config: &PipelineConfig, errors: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for (i, mapping) in config.transform.mappings.iter().enumerate() {
        if mapping.entity_type.trim().is_empty() {
            errors.push(format!("transform.mappings[{i}] has an empty entity_type"));
            continue;
        }
        if !seen.insert(mapping.entity_type.as_str()) {
            errors.push(format!(
                "Entity type '{}' is mapped more than once",
                mapping.entity_type
            ));
        }
        if let Err(e) = CompiledMapping::compile(mapping) {
            errors.push(format!("Mapping for '{}': {e}", mapping.entity_type));
        }
    }
}

/// Validate a parsed pipeline configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipeline config.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    if config.source.use_ref.trim().is_empty() {
        errors.push("Source connector reference (use) must not be empty".to_string());
    }

    if config
        .source
        .entity_types
        .iter()
        .any(|t| t.trim().is_empty())
    {
        errors.push("source.entity_types must not contain empty names".to_string());
    }

    if config.destination.use_ref.trim().is_empty() {
        errors.push("Destination connector reference (use) must not be empty".to_string());
    }

    if config.broker.endpoints.is_empty() {
        errors.push("broker.endpoints must list at least one endpoint".to_string());
    }
    for endpoint in &config.broker.endpoints {
        if !endpoint.contains("://") {
            errors.push(format!(
                "Broker endpoint '{endpoint}' must be a URL (scheme://host)"
            ));
        }
    }

    if config.broker.partitions == 0 {
        errors.push("broker.partitions must be at least 1".to_string());
    }

    if config.workers.shards == 0 {
        errors.push("workers.shards must be at least 1".to_string());
    } else if config.workers.shards > config.broker.partitions {
        errors.push(format!(
            "workers.shards ({}) must not exceed broker.partitions ({})",
            config.workers.shards, config.broker.partitions
        ));
    }

    if config.retry.base_ms == 0 {
        errors.push("retry.base_ms must be > 0".to_string());
    }
    if config.retry.cap_ms < config.retry.base_ms {
        errors.push(format!(
            "retry.cap_ms ({}) must be >= retry.base_ms ({})",
            config.retry.cap_ms, config.retry.base_ms
        ));
    }

    validate_timeouts(&config.timeouts, &mut errors);
    validate_mappings(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_pipeline_str;

    fn valid_yaml() -> &'static str {
        r#"
version: "1.0"
pipeline: test_pipeline
source:
  use: jsonl
  config:
    path: changes.jsonl
destination:
  use: memory
broker:
  partitions: 8
workers:
  shards: 2
transform:
  mappings:
    - entity_type: Account
      rules:
        - rename: { from: acct, to: account_number }
"#
    }

    #[test]
    fn test_valid_pipeline_passes() {
        let config = parse_pipeline_str(valid_yaml()).unwrap();
        assert!(validate_pipeline(&config).is_ok());
    }

    #[test]
    fn test_wrong_version_fails() {
        let yaml = valid_yaml().replace("\"1.0\"", "\"2.0\"");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("Unsupported pipeline version"));
    }

    #[test]
    fn test_empty_pipeline_name_fails() {
        let yaml = valid_yaml().replace("test_pipeline", "\"\"");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("Pipeline name must not be empty"));
    }

    #[test]
    fn test_more_shards_than_partitions_fails() {
        let yaml = valid_yaml().replace("shards: 2", "shards: 9");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("must not exceed broker.partitions"));
    }

    #[test]
    fn test_duplicate_mapping_fails() {
        let yaml = format!(
            "{}    - entity_type: Account\n",
            valid_yaml()
        );
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("mapped more than once"));
    }

    #[test]
    fn test_bad_drop_pattern_fails() {
        let yaml = valid_yaml().replace(
            "- rename: { from: acct, to: account_number }",
            "- drop: { field: email, when: { matches: \"([\" } }",
        );
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("Mapping for 'Account'"), "got: {err}");
    }

    #[test]
    fn test_multiple_errors_reported() {
        let yaml = valid_yaml()
            .replace("\"1.0\"", "\"9.9\"")
            .replace("partitions: 8", "partitions: 0");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("Unsupported pipeline version"));
        assert!(err.contains("broker.partitions must be at least 1"));
    }

    #[test]
    fn test_zero_timeout_fails() {
        let yaml = format!("{}timeouts:\n  writeback_ms: 0\n", valid_yaml());
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("timeouts.writeback_ms must be > 0"));
    }
}
