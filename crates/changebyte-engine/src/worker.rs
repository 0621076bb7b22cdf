//! Shard workers: one task per shard, each owning a fixed set of partitions.
//!
//! Partition `p` belongs to shard `p % shards`, so every source id is handled
//! by exactly one worker and its envelopes are processed in queue order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use changebyte_types::record::SkipReason;

use crate::error::PipelineError;
use crate::processor::{DeliveryOutcome, EnvelopeProcessor};
use crate::queue::{Delivery, DurableQueue, QueueConsumer};
use crate::result::ShardStats;
use crate::retry::RetryPolicy;
use crate::shutdown_requested;
use crate::writeback::WritebackOutcome;

const POLL_BATCH: usize = 64;

pub(crate) fn owned_partitions(shard: u32, shards: u32, partitions: u32) -> Vec<u32> {
    (0..partitions).filter(|p| p % shards.max(1) == shard).collect()
}

pub(crate) struct ShardWorker {
    pub(crate) shard: u32,
    pub(crate) partitions: Vec<u32>,
    pub(crate) queue: Arc<dyn DurableQueue>,
    pub(crate) processor: Arc<EnvelopeProcessor>,
    pub(crate) queue_timeout: Duration,
    pub(crate) idle_poll: Duration,
    /// Spacing for the single retry of a failed offset commit.
    pub(crate) retry: RetryPolicy,
    /// Set once the ingest task has published its last envelope.
    pub(crate) ingest_done: Arc<AtomicBool>,
}

impl ShardWorker {
    /// Consume owned partitions until ingest is done and they are drained,
    /// or until shutdown.
    pub(crate) async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ShardStats, PipelineError> {
        let mut stats = ShardStats {
            shard: self.shard,
            ..ShardStats::default()
        };

        let mut consumers = Vec::with_capacity(self.partitions.len());
        for &partition in &self.partitions {
            let consumer = QueueConsumer::open(
                Arc::clone(&self.queue),
                partition,
                POLL_BATCH,
                self.queue_timeout,
            )
            .await?;
            consumers.push(consumer);
        }

        tracing::debug!(
            shard = self.shard,
            partitions = ?self.partitions,
            "Shard worker started"
        );

        loop {
            if *shutdown.borrow() {
                stats.interrupted = true;
                break;
            }
            let ingest_done = self.ingest_done.load(Ordering::Acquire);
            let mut idle = true;
            let mut stalled = false;

            for consumer in &mut consumers {
                if *shutdown.borrow() {
                    break;
                }
                match consumer.next_delivery().await {
                    Ok(Some(delivery)) => {
                        idle = false;
                        self.handle(consumer, delivery, &mut shutdown, &mut stats)
                            .await?;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        stalled = true;
                        tracing::warn!(
                            shard = self.shard,
                            partition = consumer.partition(),
                            error = %e,
                            "Queue poll failed, will retry"
                        );
                    }
                }
            }

            if idle && !stalled && ingest_done {
                break;
            }
            if idle || stalled {
                tokio::select! {
                    () = tokio::time::sleep(self.idle_poll) => {}
                    () = shutdown_requested(&mut shutdown) => {}
                }
            }
        }

        tracing::debug!(
            shard = self.shard,
            delivered = stats.delivered,
            interrupted = stats.interrupted,
            "Shard worker finished"
        );
        Ok(stats)
    }

    async fn handle(
        &self,
        consumer: &mut QueueConsumer,
        delivery: Delivery,
        shutdown: &mut watch::Receiver<bool>,
        stats: &mut ShardStats,
    ) -> Result<(), PipelineError> {
        let offset = delivery.offset;
        stats.delivered += 1;

        let report = self.processor.process(delivery.envelope, shutdown).await?;
        stats.retries += u64::from(report.lifecycle.retries());

        match report.outcome {
            DeliveryOutcome::Applied { result, writeback } => {
                match result.reason {
                    None => stats.applied += 1,
                    Some(SkipReason::Duplicate) => stats.duplicates += 1,
                    Some(SkipReason::StaleSequence) => stats.stale += 1,
                    Some(SkipReason::MissingTarget) => stats.missing_target += 1,
                }
                match writeback {
                    Some(WritebackOutcome::Written) => stats.writebacks += 1,
                    Some(WritebackOutcome::AlreadyRecorded) => stats.writebacks_skipped += 1,
                    None => {}
                }
            }
            DeliveryOutcome::DeadLettered { .. } => stats.dead_lettered += 1,
            DeliveryOutcome::Interrupted => {
                // Left uncommitted for redelivery.
                stats.interrupted = true;
                return Ok(());
            }
        }

        self.commit(consumer, offset, shutdown).await;
        Ok(())
    }

    /// Commit `offset`, retrying once after the first backoff delay. A commit
    /// that still fails is covered by the partition's next commit, or the
    /// envelope is redelivered next run and resolves as a duplicate.
    async fn commit(
        &self,
        consumer: &QueueConsumer,
        offset: u64,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let Err(first) = consumer.commit(offset).await else {
            return;
        };
        let delay = self.retry.delay_for(0);
        tracing::debug!(
            shard = self.shard,
            partition = consumer.partition(),
            offset,
            error = %first,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Offset commit failed, retrying once"
        );
        tokio::select! {
            biased;
            () = shutdown_requested(shutdown) => {}
            () = tokio::time::sleep(delay) => {}
        }
        if let Err(e) = consumer.commit(offset).await {
            tracing::warn!(
                shard = self.shard,
                partition = consumer.partition(),
                offset,
                error = %e,
                "Offset commit failed twice; envelope will be redelivered unless a later commit covers it"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partitions_split_without_overlap() {
        let shards = 3;
        let mut all: Vec<u32> = (0..shards)
            .flat_map(|s| owned_partitions(s, shards, 8))
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..8).collect::<Vec<_>>());
        assert_eq!(owned_partitions(1, 3, 8), vec![1, 4, 7]);
    }
}
