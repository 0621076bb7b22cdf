//! State backend trait definition.
//!
//! [`StateBackend`] defines the storage contract for the dedup index, the
//! applied-sequence table, the apply journal, correlation records, the
//! dead-letter channel, and run history. Model types live in
//! [`changebyte_types`].
//!
//! Every per-source key is written only by the shard worker that owns the
//! source id, and the writes that advance it are compare-and-set, so
//! concurrent workers never lose each other's updates.

use changebyte_types::envelope::DeadLetterRecord;
use changebyte_types::record::{ApplyResult, CorrelationRecord, DedupKey};
use changebyte_types::state::{PendingApply, PipelineId, RunStats, RunStatus, StoredDeadLetter};

use crate::error;

/// Storage contract for relay state.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateBackend>`.
pub trait StateBackend: Send + Sync {
    /// Begin a new relay run, returning its unique ID.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn start_run(&self, pipeline: &PipelineId) -> error::Result<i64>;

    /// Finalize a relay run with status and aggregate stats.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()>;

    /// Look up a previously recorded apply result.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn lookup_dedup(
        &self,
        pipeline: &PipelineId,
        key: &DedupKey,
    ) -> error::Result<Option<ApplyResult>>;

    /// Highest sequence applied for `source_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn applied_sequence(&self, pipeline: &PipelineId, source_id: &str)
        -> error::Result<Option<u64>>;

    /// Journal an apply before the destination is touched.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn begin_apply(&self, pipeline: &PipelineId, pending: &PendingApply) -> error::Result<()>;

    /// In one transaction: record `key → result`, advance the applied
    /// sequence for `source_id` if `sequence` is higher, and clear the
    /// journal entry.
    ///
    /// Returns `false` when a higher sequence was already recorded.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure;
    /// nothing is written in that case.
    fn commit_apply(
        &self,
        pipeline: &PipelineId,
        key: &DedupKey,
        source_id: &str,
        sequence: u64,
        result: &ApplyResult,
    ) -> error::Result<bool>;

    /// Journal entries whose apply never committed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn pending_applies(&self, pipeline: &PipelineId) -> error::Result<Vec<PendingApply>>;

    /// Remember the destination natural key `source_id` maps to in `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn remember_natural_key(
        &self,
        pipeline: &PipelineId,
        entity: &str,
        source_id: &str,
        natural_key: &str,
    ) -> error::Result<()>;

    /// The natural key last remembered for `source_id` in `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn natural_key(
        &self,
        pipeline: &PipelineId,
        entity: &str,
        source_id: &str,
    ) -> error::Result<Option<String>>;

    /// Read the correlation last written back for `source_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_correlation(
        &self,
        pipeline: &PipelineId,
        source_id: &str,
    ) -> error::Result<Option<CorrelationRecord>>;

    /// Compare-and-set: store `record` only if no record with an equal or
    /// higher `applied_sequence` exists. Returns `true` if written.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn put_correlation(
        &self,
        pipeline: &PipelineId,
        record: &CorrelationRecord,
    ) -> error::Result<bool>;

    /// Persist a dead-lettered envelope. Returns its channel id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn insert_dead_letter(
        &self,
        pipeline: &PipelineId,
        run_id: i64,
        record: &DeadLetterRecord,
    ) -> error::Result<i64>;

    /// List dead letters, oldest first. Replayed entries are included only
    /// when `include_replayed` is set.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_dead_letters(
        &self,
        pipeline: &PipelineId,
        include_replayed: bool,
    ) -> error::Result<Vec<StoredDeadLetter>>;

    /// Fetch one dead letter by id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_dead_letter(
        &self,
        pipeline: &PipelineId,
        id: i64,
    ) -> error::Result<Option<StoredDeadLetter>>;

    /// Mark a dead letter as replayed. Returns `false` if it was unknown or
    /// already replayed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn mark_dead_letter_replayed(&self, pipeline: &PipelineId, id: i64) -> error::Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify the trait is object-safe (can be used as `dyn StateBackend`).
    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn StateBackend) {}
    }
}
