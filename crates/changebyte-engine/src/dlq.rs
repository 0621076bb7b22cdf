//! Dead-letter persistence helper used by the processor and the ingest task.

use changebyte_state::StateBackend;
use changebyte_types::envelope::DeadLetterRecord;
use changebyte_types::state::PipelineId;

use crate::error::PipelineError;

/// Persist one dead-lettered envelope. Returns its channel id.
///
/// # Errors
///
/// A storage failure is an infrastructure error: the envelope's offset must
/// stay uncommitted so it is redelivered rather than lost.
pub(crate) fn persist_dead_letter(
    state_backend: &dyn StateBackend,
    pipeline: &PipelineId,
    run_id: i64,
    record: &DeadLetterRecord,
) -> Result<i64, PipelineError> {
    match state_backend.insert_dead_letter(pipeline, run_id, record) {
        Ok(id) => {
            tracing::warn!(
                pipeline = pipeline.as_str(),
                dead_letter_id = id,
                source_id = record.envelope.source_id(),
                sequence = record.envelope.sequence(),
                trace_id = record.envelope.trace_id.as_str(),
                stage = %record.stage,
                error_kind = %record.error_kind,
                error_code = record.error_code.as_str(),
                attempt_count = record.attempt_count,
                "Envelope dead-lettered: {}",
                record.error_message
            );
            Ok(id)
        }
        Err(e) => {
            tracing::error!(
                pipeline = pipeline.as_str(),
                source_id = record.envelope.source_id(),
                sequence = record.envelope.sequence(),
                error = %e,
                "Failed to persist dead letter"
            );
            Err(e.into())
        }
    }
}
