//! Field mapping from source payloads to destination records.
//!
//! Each entity type's mapping is compiled once into a [`CompiledMapping`];
//! rules then run in declaration order against a copy of the payload.
//! Failures are `schema_mapping` errors, which are never retried.

use std::collections::{BTreeSet, HashMap};

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Number, Value};

use changebyte_types::envelope::Envelope;
use changebyte_types::error::RelayError;
use changebyte_types::event::{FieldMap, Operation};
use changebyte_types::record::{DedupKey, TransformedRecord};

use crate::config::types::{
    CastType, DropCondition, EntityMapping, RuleSpec, TransformConfig, UnmappedEntities,
    UnmappedFields,
};

#[derive(Debug)]
enum Condition {
    IsNull,
    Equals(Value),
    Matches(Regex),
}

impl Condition {
    fn holds(&self, value: Option<&Value>) -> bool {
        match self {
            Self::IsNull => matches!(value, None | Some(Value::Null)),
            Self::Equals(expected) => value == Some(expected),
            Self::Matches(re) => matches!(value, Some(Value::String(s)) if re.is_match(s)),
        }
    }
}

#[derive(Debug)]
enum Rule {
    Rename { from: String, to: String },
    Cast { field: String, to: CastType },
    Default { field: String, value: Value },
    Drop { field: String, when: Option<Condition> },
}

/// A validated, ready-to-run mapping for one entity type.
#[derive(Debug)]
pub struct CompiledMapping {
    target: String,
    natural_key: Option<String>,
    unmapped: UnmappedFields,
    required: Vec<String>,
    rules: Vec<Rule>,
}

impl CompiledMapping {
    /// Validate and compile a mapping.
    ///
    /// # Errors
    ///
    /// Returns an error for empty field names, self-renames, or invalid
    /// `matches` patterns.
    pub fn compile(entity: &EntityMapping) -> Result<Self> {
        let mut rules = Vec::with_capacity(entity.rules.len());
        for (i, rule) in entity.rules.iter().enumerate() {
            let compiled = match rule {
                RuleSpec::Rename { from, to } => {
                    if from.is_empty() || to.is_empty() {
                        bail!("rules[{i}]: rename needs non-empty 'from' and 'to'");
                    }
                    if from == to {
                        bail!("rules[{i}]: rename from '{from}' to itself");
                    }
                    Rule::Rename {
                        from: from.clone(),
                        to: to.clone(),
                    }
                }
                RuleSpec::Cast { field, to } => Rule::Cast {
                    field: non_empty(field, i)?,
                    to: *to,
                },
                RuleSpec::Default { field, value } => Rule::Default {
                    field: non_empty(field, i)?,
                    value: value.clone(),
                },
                RuleSpec::Drop { field, when } => {
                    let when = match when {
                        None => None,
                        Some(DropCondition::IsNull) => Some(Condition::IsNull),
                        Some(DropCondition::Equals(v)) => Some(Condition::Equals(v.clone())),
                        Some(DropCondition::Matches(pattern)) => {
                            let re = Regex::new(pattern).map_err(|e| {
                                anyhow::anyhow!("rules[{i}]: invalid pattern '{pattern}': {e}")
                            })?;
                            Some(Condition::Matches(re))
                        }
                    };
                    Rule::Drop {
                        field: non_empty(field, i)?,
                        when,
                    }
                }
            };
            rules.push(compiled);
        }

        Ok(Self {
            target: entity
                .target
                .clone()
                .unwrap_or_else(|| entity.entity_type.clone()),
            natural_key: entity.natural_key.clone(),
            unmapped: entity.unmapped,
            required: entity.required.clone(),
            rules,
        })
    }

    fn passthrough(entity_type: &str) -> Self {
        Self {
            target: entity_type.to_string(),
            natural_key: None,
            unmapped: UnmappedFields::Keep,
            required: Vec::new(),
            rules: Vec::new(),
        }
    }

    fn apply(&self, envelope: &Envelope) -> Result<TransformedRecord, RelayError> {
        let event = &envelope.event;
        let mut fields = event.payload.clone();
        let mut touched = BTreeSet::new();

        for rule in &self.rules {
            match rule {
                Rule::Rename { from, to } => {
                    if let Some(value) = fields.remove(from) {
                        fields.insert(to.clone(), value);
                        touched.insert(to.clone());
                    }
                }
                Rule::Cast { field, to } => {
                    if let Some(value) = fields.get_mut(field) {
                        *value = cast(value, *to).map_err(|reason| {
                            RelayError::schema_mapping(
                                "CAST_FAILED",
                                format!("cannot cast '{field}' to {to:?}: {reason}"),
                            )
                        })?;
                        touched.insert(field.clone());
                    }
                }
                Rule::Default { field, value } => {
                    let slot = fields.entry(field.clone()).or_insert(Value::Null);
                    if slot.is_null() {
                        *slot = value.clone();
                    }
                    touched.insert(field.clone());
                }
                Rule::Drop { field, when } => {
                    let drop = when
                        .as_ref()
                        .map_or(true, |cond| cond.holds(fields.get(field)));
                    if drop {
                        fields.remove(field);
                    }
                }
            }
        }

        if self.unmapped == UnmappedFields::Drop {
            fields.retain(|name, _| {
                touched.contains(name)
                    || self.required.contains(name)
                    || self.natural_key.as_deref() == Some(name.as_str())
            });
        }

        if event.operation != Operation::Delete {
            let missing: Vec<&str> = self
                .required
                .iter()
                .filter(|name| fields.get(*name).map_or(true, Value::is_null))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(RelayError::schema_mapping(
                    "MISSING_REQUIRED_FIELD",
                    format!("required field(s) missing: {}", missing.join(", ")),
                ));
            }
        }

        let natural_key = match &self.natural_key {
            None => Some(event.source_id.clone()),
            Some(name)
                if event.operation == Operation::Delete
                    && fields.get(name).map_or(true, Value::is_null) =>
            {
                None
            }
            Some(name) => Some(key_string(&fields, name)?),
        };

        Ok(TransformedRecord {
            dedup_key: DedupKey::derive(&event.source_id, event.sequence),
            source_id: event.source_id.clone(),
            sequence: event.sequence,
            entity: self.target.clone(),
            natural_key,
            fields,
            operation: event.operation,
        })
    }
}

fn non_empty(field: &str, index: usize) -> Result<String> {
    if field.is_empty() {
        bail!("rules[{index}]: field name must not be empty");
    }
    Ok(field.to_string())
}

fn key_string(fields: &FieldMap, name: &str) -> Result<String, RelayError> {
    match fields.get(name) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(RelayError::schema_mapping(
            "MISSING_NATURAL_KEY",
            format!("natural key field '{name}' is missing or not a string/number"),
        )),
    }
}

fn cast(value: &Value, to: CastType) -> Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match to {
        CastType::String => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(format!("{other} has no string form")),
        },
        CastType::Integer => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            Value::Number(n) => match n.as_f64() {
                #[allow(clippy::cast_possible_truncation)]
                Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Ok(Value::from(f as i64)),
                _ => Err(format!("{n} is not a whole number")),
            },
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|e| format!("'{s}': {e}")),
            other => Err(format!("{other} is not an integer")),
        },
        CastType::Float => {
            let f = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            f.and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("{value} is not a finite number"))
        }
        CastType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(Value::Bool(false)),
            Value::Number(n) if n.as_i64() == Some(1) => Ok(Value::Bool(true)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "0" => Ok(Value::Bool(false)),
                _ => Err(format!("'{s}' is not a boolean")),
            },
            other => Err(format!("{other} is not a boolean")),
        },
        CastType::Timestamp => {
            let parsed = match value {
                Value::String(s) => DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok()
                    .or_else(|| {
                        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                            .ok()
                            .map(|naive| naive.and_utc())
                    }),
                Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
                _ => None,
            };
            parsed
                .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
                .ok_or_else(|| format!("{value} is not a timestamp"))
        }
    }
}

/// Maps envelopes to destination records using per-entity mappings.
#[derive(Debug)]
pub struct Transformer {
    mappings: HashMap<String, CompiledMapping>,
    unmapped_entities: UnmappedEntities,
}

impl Transformer {
    /// Compile every mapping in `config`.
    ///
    /// # Errors
    ///
    /// Returns the first mapping that fails to compile.
    pub fn compile(config: &TransformConfig) -> Result<Self> {
        let mut mappings = HashMap::with_capacity(config.mappings.len());
        for entity in &config.mappings {
            let compiled = CompiledMapping::compile(entity).map_err(|e| {
                anyhow::anyhow!("mapping for '{}' is invalid: {e}", entity.entity_type)
            })?;
            mappings.insert(entity.entity_type.clone(), compiled);
        }
        Ok(Self {
            mappings,
            unmapped_entities: config.unmapped_entities,
        })
    }

    /// Map one envelope. Pure: the same envelope always yields the same
    /// record.
    ///
    /// # Errors
    ///
    /// Returns a `schema_mapping` [`RelayError`] if the entity type is
    /// unmapped (and not passed through), a cast fails, a required field is
    /// missing, or the natural key cannot be derived.
    pub fn transform(&self, envelope: &Envelope) -> Result<TransformedRecord, RelayError> {
        let entity_type = &envelope.event.entity_type;
        match self.mappings.get(entity_type) {
            Some(mapping) => mapping.apply(envelope),
            None => match self.unmapped_entities {
                UnmappedEntities::Passthrough => {
                    CompiledMapping::passthrough(entity_type).apply(envelope)
                }
                UnmappedEntities::Reject => Err(RelayError::schema_mapping(
                    "UNMAPPED_ENTITY",
                    format!("no mapping for entity type '{entity_type}'"),
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changebyte_types::envelope::Timestamp;
    use changebyte_types::error::ErrorKind;
    use changebyte_types::event::ChangeEvent;
    use serde_json::json;

    fn envelope(entity_type: &str, operation: Operation, payload: Value) -> Envelope {
        let payload: FieldMap = serde_json::from_value(payload).unwrap();
        Envelope {
            event: ChangeEvent {
                source_id: "A1".into(),
                entity_type: entity_type.into(),
                operation,
                sequence: 3,
                payload,
                emitted_at: Timestamp::new("2026-03-01T00:00:00Z"),
            },
            partition_key: "A1".into(),
            partition: 0,
            attempt_count: 0,
            dead_letter: false,
            trace_id: "t".into(),
        }
    }

    fn transformer(yaml: &str) -> Transformer {
        let config: TransformConfig = serde_yaml::from_str(yaml).unwrap();
        Transformer::compile(&config).unwrap()
    }

    const ACCOUNT: &str = r#"
mappings:
  - entity_type: Account
    target: Customer
    natural_key: account_number
    required: [name]
    rules:
      - rename: { from: acct_no, to: account_number }
      - cast: { field: balance, to: float }
      - cast: { field: active, to: boolean }
      - default: { field: tier, value: standard }
      - drop: { field: notes, when: is_null }
      - drop: { field: email, when: { matches: "@internal\\.example$" } }
"#;

    #[test]
    fn test_rules_apply_in_order() {
        let t = transformer(ACCOUNT);
        let env = envelope(
            "Account",
            Operation::Update,
            json!({
                "acct_no": "ACC-9",
                "name": "Acme",
                "balance": "12.5",
                "active": "yes",
                "notes": null,
                "email": "ops@internal.example",
                "region": "EU"
            }),
        );
        let rec = t.transform(&env).unwrap();
        assert_eq!(rec.entity, "Customer");
        assert_eq!(rec.natural_key.as_deref(), Some("ACC-9"));
        assert_eq!(rec.dedup_key, DedupKey::derive("A1", 3));
        assert_eq!(rec.fields["balance"], json!(12.5));
        assert_eq!(rec.fields["active"], json!(true));
        assert_eq!(rec.fields["tier"], json!("standard"));
        assert!(!rec.fields.contains_key("notes"));
        assert!(!rec.fields.contains_key("email"));
        assert!(!rec.fields.contains_key("acct_no"));
        // unmapped defaults to keep
        assert_eq!(rec.fields["region"], json!("EU"));
    }

    #[test]
    fn test_transform_is_deterministic() {
        let t = transformer(ACCOUNT);
        let env = envelope(
            "Account",
            Operation::Create,
            json!({ "acct_no": 7, "name": "Acme", "balance": 3 }),
        );
        assert_eq!(t.transform(&env).unwrap(), t.transform(&env).unwrap());
    }

    #[test]
    fn test_unmapped_drop_keeps_touched_and_required() {
        let t = transformer(
            r#"
mappings:
  - entity_type: Contact
    unmapped: drop
    required: [email]
    rules:
      - rename: { from: full_name, to: name }
"#,
        );
        let env = envelope(
            "Contact",
            Operation::Create,
            json!({ "full_name": "Ann", "email": "a@b.c", "internal_score": 9 }),
        );
        let rec = t.transform(&env).unwrap();
        assert_eq!(
            rec.fields.keys().cloned().collect::<Vec<_>>(),
            vec!["email".to_string(), "name".to_string()]
        );
        assert_eq!(rec.natural_key.as_deref(), Some("A1"));
    }

    #[test]
    fn test_missing_required_field_is_schema_error() {
        let t = transformer(ACCOUNT);
        let env = envelope("Account", Operation::Update, json!({ "acct_no": "X" }));
        let err = t.transform(&env).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SchemaMapping);
        assert_eq!(err.code, "MISSING_REQUIRED_FIELD");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_delete_skips_required_check() {
        let t = transformer(ACCOUNT);
        let env = envelope("Account", Operation::Delete, json!({ "acct_no": "ACC-9" }));
        let rec = t.transform(&env).unwrap();
        assert_eq!(rec.operation, Operation::Delete);
        assert_eq!(rec.natural_key.as_deref(), Some("ACC-9"));
    }

    #[test]
    fn test_delete_without_key_field_leaves_key_unresolved() {
        let t = transformer(ACCOUNT);
        let env = envelope("Account", Operation::Delete, json!({}));
        let rec = t.transform(&env).unwrap();
        assert_eq!(rec.entity, "Customer");
        assert_eq!(rec.natural_key, None);

        let bad = envelope("Account", Operation::Delete, json!({ "acct_no": true }));
        assert_eq!(t.transform(&bad).unwrap_err().code, "MISSING_NATURAL_KEY");
    }

    #[test]
    fn test_bad_cast_is_schema_error() {
        let t = transformer(ACCOUNT);
        let env = envelope(
            "Account",
            Operation::Update,
            json!({ "acct_no": "X", "name": "n", "balance": "lots" }),
        );
        let err = t.transform(&env).unwrap_err();
        assert_eq!(err.code, "CAST_FAILED");
        assert!(err.message.contains("balance"));
    }

    #[test]
    fn test_missing_natural_key_is_schema_error() {
        let t = transformer(ACCOUNT);
        let env = envelope("Account", Operation::Update, json!({ "name": "n" }));
        assert_eq!(t.transform(&env).unwrap_err().code, "MISSING_NATURAL_KEY");
    }

    #[test]
    fn test_unmapped_entity_reject_and_passthrough() {
        let reject = transformer("mappings: []");
        let env = envelope("Invoice", Operation::Create, json!({ "total": 5 }));
        assert_eq!(reject.transform(&env).unwrap_err().code, "UNMAPPED_ENTITY");

        let pass = transformer("unmapped_entities: passthrough");
        let rec = pass.transform(&env).unwrap();
        assert_eq!(rec.entity, "Invoice");
        assert_eq!(rec.natural_key.as_deref(), Some("A1"));
        assert_eq!(rec.fields["total"], json!(5));
    }

    #[test]
    fn test_casts() {
        assert_eq!(cast(&json!(12), CastType::String).unwrap(), json!("12"));
        assert_eq!(cast(&json!(" 42 "), CastType::Integer).unwrap(), json!(42));
        assert_eq!(cast(&json!(4.0), CastType::Integer).unwrap(), json!(4));
        assert!(cast(&json!(4.5), CastType::Integer).is_err());
        assert_eq!(cast(&json!("0"), CastType::Boolean).unwrap(), json!(false));
        assert_eq!(cast(&json!(null), CastType::Float).unwrap(), json!(null));
        assert_eq!(
            cast(&json!("2026-03-01 08:30:00"), CastType::Timestamp).unwrap(),
            json!("2026-03-01T08:30:00Z")
        );
        assert_eq!(
            cast(&json!("2026-03-01T10:30:00+02:00"), CastType::Timestamp).unwrap(),
            json!("2026-03-01T08:30:00Z")
        );
        assert!(cast(&json!({ "a": 1 }), CastType::String).is_err());
    }

    #[test]
    fn test_compile_rejects_self_rename() {
        let mapping: EntityMapping = serde_yaml::from_str(
            r#"
entity_type: A
rules:
  - rename: { from: x, to: x }
"#,
        )
        .unwrap();
        let err = CompiledMapping::compile(&mapping).unwrap_err().to_string();
        assert!(err.contains("to itself"));
    }
}
