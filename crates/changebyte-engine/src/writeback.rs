//! Correlation writeback: telling the source which destination record its
//! change landed in.
//!
//! The last correlation written per source id is kept in the state backend.
//! A correlation already covered by the stored one (same destination, or an
//! equal or newer sequence) never reaches the source again, so redelivered
//! envelopes cost no extra network calls.

use std::sync::Arc;

use changebyte_state::StateBackend;
use changebyte_types::error::RelayError;
use changebyte_types::record::CorrelationRecord;
use changebyte_types::state::PipelineId;

/// Source-side endpoint that receives correlations. Calls may block.
pub trait SourceWriteback: Send + Sync {
    /// # Errors
    ///
    /// Any error is treated as transient and retried.
    fn write_correlation(&self, record: &CorrelationRecord) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritebackOutcome {
    Written,
    AlreadyRecorded,
}

pub struct CorrelationWriter {
    pipeline: PipelineId,
    state: Arc<dyn StateBackend>,
    source: Arc<dyn SourceWriteback>,
}

impl CorrelationWriter {
    #[must_use]
    pub fn new(
        pipeline: PipelineId,
        state: Arc<dyn StateBackend>,
        source: Arc<dyn SourceWriteback>,
    ) -> Self {
        Self {
            pipeline,
            state,
            source,
        }
    }

    /// Write `record` back to the source unless an equivalent one was
    /// already written.
    ///
    /// # Errors
    ///
    /// Returns a retryable `writeback` error if the source call or the
    /// correlation store fails.
    pub fn writeback(&self, record: &CorrelationRecord) -> Result<WritebackOutcome, RelayError> {
        let existing = self
            .state
            .get_correlation(&self.pipeline, &record.source_id)
            .map_err(|e| RelayError::writeback("STATE_UNAVAILABLE", e.to_string()))?;

        if let Some(existing) = existing {
            if record.is_covered_by(&existing) {
                if record.applied_sequence > existing.applied_sequence {
                    self.persist(record)?;
                }
                tracing::debug!(
                    source_id = record.source_id.as_str(),
                    destination_id = record.destination_id.as_str(),
                    "Correlation already written back"
                );
                return Ok(WritebackOutcome::AlreadyRecorded);
            }
        }

        self.source.write_correlation(record).map_err(|e| {
            RelayError::writeback("WRITEBACK_FAILED", format!("{e:#}")).with_details(
                serde_json::json!({
                    "source_id": record.source_id,
                    "destination_id": record.destination_id,
                }),
            )
        })?;
        self.persist(record)?;

        tracing::debug!(
            source_id = record.source_id.as_str(),
            destination_id = record.destination_id.as_str(),
            applied_sequence = record.applied_sequence,
            "Wrote correlation back to source"
        );
        Ok(WritebackOutcome::Written)
    }

    fn persist(&self, record: &CorrelationRecord) -> Result<(), RelayError> {
        self.state
            .put_correlation(&self.pipeline, record)
            .map(|_| ())
            .map_err(|e| RelayError::writeback("STATE_UNAVAILABLE", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::memory::MemoryWriteback;
    use changebyte_state::SqliteStateBackend;
    use changebyte_types::error::ErrorKind;

    fn writer() -> (CorrelationWriter, Arc<MemoryWriteback>, Arc<SqliteStateBackend>) {
        let state = Arc::new(SqliteStateBackend::in_memory().unwrap());
        let source = Arc::new(MemoryWriteback::new());
        let writer = CorrelationWriter::new(PipelineId::new("test"), state.clone(), source.clone());
        (writer, source, state)
    }

    fn corr(destination_id: &str, seq: u64) -> CorrelationRecord {
        CorrelationRecord {
            source_id: "A1".into(),
            destination_id: destination_id.into(),
            applied_sequence: seq,
        }
    }

    #[test]
    fn test_first_write_reaches_source() {
        let (writer, source, state) = writer();
        assert_eq!(
            writer.writeback(&corr("Customer:1", 1)).unwrap(),
            WritebackOutcome::Written
        );
        assert_eq!(source.written(), vec![corr("Customer:1", 1)]);
        assert_eq!(
            state
                .get_correlation(&PipelineId::new("test"), "A1")
                .unwrap(),
            Some(corr("Customer:1", 1))
        );
    }

    #[test]
    fn test_redelivery_skips_network_call() {
        let (writer, source, _) = writer();
        writer.writeback(&corr("Customer:1", 1)).unwrap();
        assert_eq!(
            writer.writeback(&corr("Customer:1", 1)).unwrap(),
            WritebackOutcome::AlreadyRecorded
        );
        // Same destination at a newer sequence: still no call.
        assert_eq!(
            writer.writeback(&corr("Customer:1", 4)).unwrap(),
            WritebackOutcome::AlreadyRecorded
        );
        assert_eq!(source.written().len(), 1);
    }

    #[test]
    fn test_new_destination_is_written() {
        let (writer, source, _) = writer();
        writer.writeback(&corr("Customer:1", 1)).unwrap();
        writer.writeback(&corr("Customer:2", 2)).unwrap();
        assert_eq!(source.written().len(), 2);
    }

    #[test]
    fn test_source_failure_is_retryable_and_not_recorded() {
        let (writer, source, state) = writer();
        source.fail_next(1);
        let err = writer.writeback(&corr("Customer:1", 1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Writeback);
        assert!(err.is_retryable());
        assert!(state
            .get_correlation(&PipelineId::new("test"), "A1")
            .unwrap()
            .is_none());

        assert_eq!(
            writer.writeback(&corr("Customer:1", 1)).unwrap(),
            WritebackOutcome::Written
        );
    }
}
