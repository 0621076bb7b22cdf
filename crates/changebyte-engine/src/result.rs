//! Relay run, check, and replay result types.

use changebyte_types::record::ApplyResult;

/// Counters from the ingest task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub events_read: u64,
    pub malformed: u64,
    pub filtered: u64,
    pub published: u64,
    pub publish_retries: u64,
    pub dead_lettered: u64,
    pub interrupted: bool,
}

/// Counters from one shard worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardStats {
    pub shard: u32,
    pub delivered: u64,
    pub applied: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub missing_target: u64,
    pub dead_lettered: u64,
    pub retries: u64,
    pub writebacks: u64,
    pub writebacks_skipped: u64,
    pub interrupted: bool,
}

/// Result of a relay run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub run_id: i64,
    pub ingest: IngestStats,
    pub shards: Vec<ShardStats>,
    pub duration_secs: f64,
}

impl PipelineResult {
    fn sum(&self, f: impl Fn(&ShardStats) -> u64) -> u64 {
        self.shards.iter().map(f).sum()
    }

    #[must_use]
    pub fn applied(&self) -> u64 {
        self.sum(|s| s.applied)
    }

    /// Envelopes acknowledged without touching the destination.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.sum(|s| s.duplicates + s.stale + s.missing_target)
    }

    #[must_use]
    pub fn duplicates(&self) -> u64 {
        self.sum(|s| s.duplicates)
    }

    #[must_use]
    pub fn stale(&self) -> u64 {
        self.sum(|s| s.stale)
    }

    #[must_use]
    pub fn dead_lettered(&self) -> u64 {
        self.ingest.dead_lettered + self.sum(|s| s.dead_lettered)
    }

    #[must_use]
    pub fn retries(&self) -> u64 {
        self.ingest.publish_retries + self.sum(|s| s.retries)
    }

    #[must_use]
    pub fn writebacks(&self) -> u64 {
        self.sum(|s| s.writebacks)
    }

    #[must_use]
    pub fn interrupted(&self) -> bool {
        self.ingest.interrupted || self.shards.iter().any(|s| s.interrupted)
    }
}

/// Outcome of one component check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckStatus {
    Ok,
    Failed(String),
}

impl CheckStatus {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub(crate) fn from_result<T>(result: anyhow::Result<T>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(e) => Self::Failed(format!("{e:#}")),
        }
    }
}

/// Result of a pipeline check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub mappings: CheckStatus,
    pub state: CheckStatus,
    pub broker: CheckStatus,
    pub source: CheckStatus,
    pub writeback: CheckStatus,
    pub destination: CheckStatus,
}

impl CheckResult {
    #[must_use]
    pub fn all_ok(&self) -> bool {
        [
            &self.mappings,
            &self.state,
            &self.broker,
            &self.source,
            &self.writeback,
            &self.destination,
        ]
        .iter()
        .all(|s| s.is_ok())
    }
}

/// Result of replaying one dead letter.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    Applied {
        dead_letter_id: i64,
        result: ApplyResult,
    },
    /// Failed again; superseded by a new dead letter.
    DeadLetteredAgain {
        dead_letter_id: i64,
        replacement_id: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_sum_across_shards() {
        let result = PipelineResult {
            run_id: 1,
            ingest: IngestStats {
                publish_retries: 2,
                dead_lettered: 1,
                ..IngestStats::default()
            },
            shards: vec![
                ShardStats {
                    applied: 3,
                    duplicates: 1,
                    retries: 4,
                    ..ShardStats::default()
                },
                ShardStats {
                    shard: 1,
                    applied: 2,
                    stale: 2,
                    dead_lettered: 1,
                    ..ShardStats::default()
                },
            ],
            duration_secs: 0.5,
        };
        assert_eq!(result.applied(), 5);
        assert_eq!(result.skipped(), 3);
        assert_eq!(result.dead_lettered(), 2);
        assert_eq!(result.retries(), 6);
        assert!(!result.interrupted());
    }

    #[test]
    fn test_check_status_keeps_error_chain() {
        let status = CheckStatus::from_result::<()>(Err(
            anyhow::anyhow!("disk full").context("open state db")
        ));
        assert_eq!(status, CheckStatus::Failed("open state db: disk full".into()));
        assert!(!status.is_ok());
    }
}
