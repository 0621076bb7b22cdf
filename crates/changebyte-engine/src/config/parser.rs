//! Pipeline YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::PipelineConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// Every missing variable is reported, not just the first.
///
/// # Errors
///
/// Returns an error if any referenced environment variable is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();

    let substituted = ENV_VAR_RE.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        std::env::var(name).unwrap_or_else(|_| {
            if !missing.iter().any(|m| m == name) {
                missing.push(name.to_string());
            }
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(substituted.into_owned())
}

/// Parse a pipeline YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_pipeline_str(yaml_str: &str) -> Result<PipelineConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    let config: PipelineConfig =
        serde_yaml::from_str(&substituted).context("Failed to parse pipeline YAML")?;
    Ok(config)
}

/// Parse a pipeline YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_pipeline(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    parse_pipeline_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("CB_TEST_DB_PATH", "/var/lib/crm.db");
        let input = "path: ${CB_TEST_DB_PATH}\nshards: 4";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "path: /var/lib/crm.db\nshards: 4");
        std::env::remove_var("CB_TEST_DB_PATH");
    }

    #[test]
    fn test_repeated_var_substituted_everywhere() {
        std::env::set_var("CB_TEST_DIR", "/data");
        let result = substitute_env_vars("${CB_TEST_DIR}/a ${CB_TEST_DIR}/b").unwrap();
        assert_eq!(result, "/data/a /data/b");
        std::env::remove_var("CB_TEST_DIR");
    }

    #[test]
    fn test_no_env_vars_passthrough() {
        let input = "pipeline: plain\nversion: \"1.0\"";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_multiple_missing_env_vars_all_reported() {
        let input = "${CB_MISSING_X} and ${CB_MISSING_Y} and ${CB_MISSING_X}";
        let err = substitute_env_vars(input).unwrap_err().to_string();
        assert!(err.contains("CB_MISSING_X, CB_MISSING_Y"), "got: {err}");
    }

    #[test]
    fn test_parse_pipeline_from_string() {
        std::env::set_var("CB_TEST_CHANGES", "/tmp/changes.jsonl");
        let yaml = r#"
version: "1.0"
pipeline: test
source:
  use: jsonl
  config:
    path: ${CB_TEST_CHANGES}
destination:
  use: memory
"#;
        let config = parse_pipeline_str(yaml).unwrap();
        assert_eq!(config.source.config["path"], "/tmp/changes.jsonl");
        assert_eq!(config.pipeline, "test");
        std::env::remove_var("CB_TEST_CHANGES");
    }

    #[test]
    fn test_parse_invalid_yaml_errors() {
        let yaml = "this is not: [valid: yaml: {{{}}}";
        assert!(parse_pipeline_str(yaml).is_err());
    }

    #[test]
    fn test_parse_missing_file_names_path() {
        let err = parse_pipeline(Path::new("/nonexistent/relay.yaml"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("/nonexistent/relay.yaml"));
    }
}
