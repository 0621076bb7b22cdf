//! Idempotent application of transformed records to the destination.
//!
//! Every apply goes through the same sequence: dedup lookup, stale-sequence
//! check, journal entry, optimistic-lock write, commit. The commit records
//! the result under the record's dedup key and advances the source's applied
//! sequence in one state transaction. A crash between the destination write
//! and the commit leaves a journal entry; the envelope is redelivered and the
//! version check on the destination keeps the second write consistent.

use std::sync::Arc;

use changebyte_state::{StateBackend, StateError};
use changebyte_types::error::RelayError;
use changebyte_types::event::{FieldMap, Operation, MAX_SEQUENCE};
use changebyte_types::record::{ApplyResult, SkipReason, TransformedRecord};
use changebyte_types::state::{PendingApply, PipelineId};

use crate::now_timestamp;

/// A destination record as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationRow {
    pub destination_id: String,
    pub fields: FieldMap,
    /// Incremented on every write; the optimistic-lock token.
    pub version: u64,
    /// Tombstoned by a DELETE.
    pub deleted: bool,
}

/// One conditional write.
#[derive(Debug, Clone, Copy)]
pub struct RowWrite<'a> {
    pub fields: &'a FieldMap,
    pub deleted: bool,
    /// `None` inserts and fails if the row exists; `Some(v)` updates only if
    /// the stored version is still `v`.
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DestinationError {
    #[error("version conflict: {0}")]
    Conflict(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl From<DestinationError> for RelayError {
    fn from(err: DestinationError) -> Self {
        match err {
            DestinationError::Conflict(msg) => RelayError::apply_conflict("VERSION_CONFLICT", msg),
            DestinationError::Rejected(msg) => RelayError::apply_rejected("REJECTED", msg),
            DestinationError::Unavailable(msg) => {
                RelayError::apply_conflict("DESTINATION_UNAVAILABLE", msg)
            }
        }
    }
}

/// Destination system contract. Calls may block.
pub trait DestinationStore: Send + Sync {
    /// # Errors
    ///
    /// Returns [`DestinationError::Unavailable`] when the store cannot be read.
    fn get(&self, entity: &str, natural_key: &str)
        -> Result<Option<DestinationRow>, DestinationError>;

    /// Conditional write. Returns the stored row.
    ///
    /// # Errors
    ///
    /// Returns [`DestinationError::Conflict`] when the version check fails,
    /// [`DestinationError::Rejected`] when the record violates a destination
    /// constraint.
    fn put(
        &self,
        entity: &str,
        natural_key: &str,
        write: RowWrite<'_>,
    ) -> Result<DestinationRow, DestinationError>;
}

fn state_unavailable(op: &str, err: &StateError) -> RelayError {
    RelayError::apply_conflict("STATE_UNAVAILABLE", format!("{op}: {err}"))
}

pub struct IdempotentApplier {
    pipeline: PipelineId,
    state: Arc<dyn StateBackend>,
    destination: Arc<dyn DestinationStore>,
}

impl IdempotentApplier {
    #[must_use]
    pub fn new(
        pipeline: PipelineId,
        state: Arc<dyn StateBackend>,
        destination: Arc<dyn DestinationStore>,
    ) -> Self {
        Self {
            pipeline,
            state,
            destination,
        }
    }

    /// Apply `record` at most once.
    ///
    /// A repeated dedup key returns the cached result marked as a duplicate
    /// without touching the destination. A sequence at or below the last
    /// applied one for the same source is skipped as stale.
    ///
    /// # Errors
    ///
    /// Returns `apply_conflict` for version conflicts and transient failures
    /// (destination or state), `apply_rejected` for destination rejections
    /// and for sequences above [`MAX_SEQUENCE`].
    pub fn apply(&self, record: &TransformedRecord) -> Result<ApplyResult, RelayError> {
        if record.sequence > MAX_SEQUENCE {
            return Err(RelayError::apply_rejected(
                "SEQUENCE_OUT_OF_RANGE",
                format!(
                    "sequence {} of '{}' exceeds {MAX_SEQUENCE}",
                    record.sequence, record.source_id
                ),
            ));
        }
        if let Some(cached) = self
            .state
            .lookup_dedup(&self.pipeline, &record.dedup_key)
            .map_err(|e| state_unavailable("dedup lookup", &e))?
        {
            tracing::debug!(
                source_id = record.source_id.as_str(),
                sequence = record.sequence,
                "Duplicate delivery, returning recorded result"
            );
            return Ok(cached.as_duplicate());
        }

        let applied = self
            .state
            .applied_sequence(&self.pipeline, &record.source_id)
            .map_err(|e| state_unavailable("applied sequence", &e))?;
        if let Some(last) = applied {
            if record.sequence <= last {
                tracing::debug!(
                    source_id = record.source_id.as_str(),
                    sequence = record.sequence,
                    applied_sequence = last,
                    "Dropping stale change"
                );
                return Ok(ApplyResult::skipped(SkipReason::StaleSequence, None));
            }
        }

        let result = match self.resolve_natural_key(record)? {
            Some(natural_key) => {
                self.state
                    .begin_apply(
                        &self.pipeline,
                        &PendingApply {
                            dedup_key: record.dedup_key.clone(),
                            source_id: record.source_id.clone(),
                            sequence: record.sequence,
                            started_at: now_timestamp(),
                        },
                    )
                    .map_err(|e| state_unavailable("journal", &e))?;
                self.write(record, &natural_key)?
            }
            // A keyless DELETE for a source never applied here.
            None => ApplyResult::skipped(SkipReason::MissingTarget, None),
        };

        let advanced = self
            .state
            .commit_apply(
                &self.pipeline,
                &record.dedup_key,
                &record.source_id,
                record.sequence,
                &result,
            )
            .map_err(|e| state_unavailable("commit", &e))?;
        if !advanced {
            tracing::warn!(
                source_id = record.source_id.as_str(),
                sequence = record.sequence,
                "Applied sequence was advanced concurrently; result recorded without advancing"
            );
        }

        Ok(result)
    }

    /// The record's own key, remembered for later keyless deletes, or the
    /// key remembered from earlier changes of the same source id.
    fn resolve_natural_key(
        &self,
        record: &TransformedRecord,
    ) -> Result<Option<String>, RelayError> {
        match &record.natural_key {
            Some(key) => {
                self.state
                    .remember_natural_key(
                        &self.pipeline,
                        &record.entity,
                        &record.source_id,
                        key,
                    )
                    .map_err(|e| state_unavailable("natural key", &e))?;
                Ok(Some(key.clone()))
            }
            None => {
                let remembered = self
                    .state
                    .natural_key(&self.pipeline, &record.entity, &record.source_id)
                    .map_err(|e| state_unavailable("natural key", &e))?;
                if remembered.is_none() {
                    tracing::debug!(
                        source_id = record.source_id.as_str(),
                        entity = record.entity.as_str(),
                        "No natural key recorded for keyless delete"
                    );
                }
                Ok(remembered)
            }
        }
    }

    fn write(
        &self,
        record: &TransformedRecord,
        natural_key: &str,
    ) -> Result<ApplyResult, RelayError> {
        let existing = self.destination.get(&record.entity, natural_key)?;

        match record.operation {
            Operation::Create | Operation::Update => {
                let (mut fields, expected_version) = match existing {
                    Some(row) if row.deleted => (FieldMap::new(), Some(row.version)),
                    Some(row) => (row.fields, Some(row.version)),
                    None => (FieldMap::new(), None),
                };
                fields.extend(record.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                let row = self.destination.put(
                    &record.entity,
                    natural_key,
                    RowWrite {
                        fields: &fields,
                        deleted: false,
                        expected_version,
                    },
                )?;
                Ok(ApplyResult::applied(row.destination_id))
            }
            Operation::Delete => match existing {
                None => Ok(ApplyResult::skipped(SkipReason::MissingTarget, None)),
                Some(row) if row.deleted => Ok(ApplyResult::skipped(
                    SkipReason::MissingTarget,
                    Some(row.destination_id),
                )),
                Some(row) => {
                    let stored = self.destination.put(
                        &record.entity,
                        natural_key,
                        RowWrite {
                            fields: &row.fields,
                            deleted: true,
                            expected_version: Some(row.version),
                        },
                    )?;
                    Ok(ApplyResult::applied(stored.destination_id))
                }
            },
        }
    }
}
