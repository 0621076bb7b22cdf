//! Execution mode types for relay runs.

use changebyte_types::error::RelayError;
use changebyte_types::record::TransformedRecord;

use crate::result::PipelineResult;

/// Runtime execution options (not part of pipeline YAML config).
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Ingest and transform only; no state, queue, destination or writeback.
    pub dry_run: bool,
    /// Maximum raw events to read from the source.
    pub limit: Option<u64>,
}

/// Result of a dry run.
#[derive(Debug)]
pub struct DryRunResult {
    pub events_read: u64,
    pub malformed: u64,
    pub filtered: u64,
    pub records: Vec<TransformedRecord>,
    /// `(source_id, sequence, error)` for events that would be dead-lettered.
    pub mapping_errors: Vec<(String, u64, RelayError)>,
    pub duration_secs: f64,
}

/// Either a normal relay result or a dry-run result.
#[derive(Debug)]
pub enum PipelineOutcome {
    Run(PipelineResult),
    DryRun(DryRunResult),
}
