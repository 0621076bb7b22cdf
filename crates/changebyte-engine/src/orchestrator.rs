//! Relay orchestrator: wires the source, queue, shard workers and state
//! backend together for one run, and hosts dry-run, check and dead-letter
//! replay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use changebyte_state::{StateBackend, StateError};
use changebyte_types::envelope::{DeadLetterRecord, Envelope};
use changebyte_types::error::Stage;
use changebyte_types::state::{PipelineId, RunStats, RunStatus, StoredDeadLetter};

use crate::apply::DestinationStore;
use crate::blocking::Stragglers;
use crate::config::types::PipelineConfig;
use crate::connectors::ChangeSource;
use crate::error::PipelineError;
use crate::execution::{DryRunResult, ExecutionOptions, PipelineOutcome};
use crate::ingest::{IngestFilter, Ingested, Ingestor};
use crate::processor::{DeliveryOutcome, EnvelopeProcessor, ProcessorSettings};
use crate::queue::DurableQueue;
use crate::resolve::{
    create_queue, create_state_backend, open_destination, open_source, open_writeback,
};
use crate::result::{CheckResult, CheckStatus, IngestStats, PipelineResult, ReplayOutcome, ShardStats};
use crate::retry::{Disposition, Lifecycle, RetryCoordinator, RetryPolicy};
use crate::transform::Transformer;
use crate::worker::{owned_partitions, ShardWorker};
use crate::writeback::SourceWriteback;
use crate::{dlq, now_timestamp, shutdown_requested};

/// Raw events buffered between the source reader thread and the ingestor.
const READ_AHEAD: usize = 256;

/// Connectors and backends for one run.
pub struct RelayParts {
    pub state: Arc<dyn StateBackend>,
    pub queue: Arc<dyn DurableQueue>,
    pub source: Box<dyn ChangeSource>,
    pub writeback: Arc<dyn SourceWriteback>,
    pub destination: Arc<dyn DestinationStore>,
}

impl RelayParts {
    /// Build every part named by the pipeline config.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if any connector or backend cannot be
    /// opened.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        Ok(Self {
            state: create_state_backend(config)?,
            queue: create_queue(config)?,
            source: open_source(config)?,
            writeback: open_writeback(config)?,
            destination: open_destination(config)?,
        })
    }
}

struct ShardCollection {
    stats: Vec<ShardStats>,
    first_error: Option<PipelineError>,
}

async fn collect_shard_results(
    mut workers: JoinSet<Result<ShardStats, PipelineError>>,
) -> Result<ShardCollection, PipelineError> {
    let mut stats = Vec::new();
    let mut first_error: Option<PipelineError> = None;

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(s)) => stats.push(s),
            Ok(Err(error)) => {
                tracing::error!("Shard worker failed: {}", error);
                if first_error.is_none() {
                    first_error = Some(error);
                    workers.abort_all();
                }
            }
            Err(join_err) if join_err.is_cancelled() && first_error.is_some() => {}
            Err(join_err) => {
                return Err(PipelineError::Infrastructure(anyhow::anyhow!(
                    "Shard worker panicked: {join_err}"
                )));
            }
        }
    }

    stats.sort_by_key(|s| s.shard);
    Ok(ShardCollection { stats, first_error })
}

/// Run a state backend call on the blocking pool.
async fn state_call<T, F>(state: &Arc<dyn StateBackend>, f: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce(&dyn StateBackend) -> Result<T, StateError> + Send + 'static,
{
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || f(state.as_ref()))
        .await
        .map_err(|e| PipelineError::Infrastructure(anyhow::anyhow!("state task panicked: {e}")))?
        .map_err(PipelineError::from)
}

/// Drain `source` on a blocking thread. The reader stops at `limit`, at the
/// end of the stream, after the first read error, or once the receiver is
/// dropped.
fn spawn_reader(
    mut source: Box<dyn ChangeSource>,
    limit: Option<u64>,
) -> mpsc::Receiver<anyhow::Result<Vec<u8>>> {
    let (tx, rx) = mpsc::channel(READ_AHEAD);
    tokio::task::spawn_blocking(move || {
        let mut read = 0u64;
        while limit.map_or(true, |max| read < max) {
            let item = match source.poll() {
                Ok(Some(raw)) => Ok(raw),
                Ok(None) => break,
                Err(e) => Err(e),
            };
            let failed = item.is_err();
            if tx.blocking_send(item).is_err() || failed {
                break;
            }
            read += 1;
        }
    });
    rx
}

/// Next raw event, or `None` at end of stream or on shutdown.
async fn next_raw(
    events: &mut mpsc::Receiver<anyhow::Result<Vec<u8>>>,
    shutdown: &mut watch::Receiver<bool>,
    stats: &mut IngestStats,
) -> Result<Option<Vec<u8>>, PipelineError> {
    let next = tokio::select! {
        biased;
        () = shutdown_requested(shutdown) => {
            stats.interrupted = true;
            return Ok(None);
        }
        next = events.recv() => next,
    };
    match next {
        Some(Ok(raw)) => {
            stats.events_read += 1;
            Ok(Some(raw))
        }
        Some(Err(e)) => Err(PipelineError::Infrastructure(
            e.context("change source read failed"),
        )),
        None => Ok(None),
    }
}

fn ingestor_for(config: &PipelineConfig, partitions: u32) -> Ingestor {
    Ingestor::new(partitions).with_filter(IngestFilter::new(
        &config.source.entity_types,
        &config.source.operations,
    ))
}

/// Publishes accepted envelopes, retrying transient broker failures.
struct Publisher {
    pipeline: PipelineId,
    run_id: i64,
    queue: Arc<dyn DurableQueue>,
    state: Arc<dyn StateBackend>,
    coordinator: RetryCoordinator,
    timeout: Duration,
}

impl Publisher {
    async fn publish(
        &self,
        mut envelope: Envelope,
        stats: &mut IngestStats,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        let mut lifecycle = Lifecycle::default();
        // A timed-out publish may still append; wait for it so a later event
        // of the same source id cannot overtake it.
        let mut stragglers = Stragglers::default();
        loop {
            stragglers.settle().await;
            lifecycle.begin(&envelope);
            let queue = Arc::clone(&self.queue);
            // Consumers start their own attempt count from zero.
            let mut outgoing = envelope.clone();
            outgoing.attempt_count = 0;
            let error = match stragglers
                .call(Stage::Queue, self.timeout, move || queue.publish(&outgoing))
                .await
            {
                Ok(offset) => {
                    stragglers.settle().await;
                    lifecycle.succeed(&envelope);
                    stats.published += 1;
                    tracing::trace!(
                        source_id = envelope.source_id(),
                        sequence = envelope.sequence(),
                        partition = envelope.partition,
                        offset,
                        "Envelope published"
                    );
                    return Ok(());
                }
                Err(error) => error,
            };

            match self
                .coordinator
                .on_failure(&mut lifecycle, &mut envelope, &error)
            {
                Disposition::RetryAfter(delay) => {
                    stats.publish_retries += 1;
                    #[allow(clippy::cast_possible_truncation)]
                    let delay_ms = delay.as_millis() as u64;
                    tracing::warn!(
                        pipeline = self.pipeline.as_str(),
                        source_id = envelope.source_id(),
                        sequence = envelope.sequence(),
                        partition = envelope.partition,
                        attempt = envelope.attempt_count,
                        delay_ms,
                        code = error.code.as_str(),
                        "Publish failed, will retry: {}",
                        error.message
                    );
                    tokio::select! {
                        biased;
                        () = shutdown_requested(shutdown) => {
                            stragglers.settle().await;
                            stats.interrupted = true;
                            tracing::warn!(
                                source_id = envelope.source_id(),
                                sequence = envelope.sequence(),
                                "Shutdown during publish backoff; event left for the next run"
                            );
                            return Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Disposition::DeadLetter => {
                    stragglers.settle().await;
                    let record = DeadLetterRecord::new(&envelope, &error, now_timestamp());
                    dlq::persist_dead_letter(
                        self.state.as_ref(),
                        &self.pipeline,
                        self.run_id,
                        &record,
                    )?;
                    stats.dead_lettered += 1;
                    return Ok(());
                }
            }
        }
    }
}

async fn run_ingest(
    ingestor: Ingestor,
    publisher: Publisher,
    source: Box<dyn ChangeSource>,
    limit: Option<u64>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<IngestStats, PipelineError> {
    let mut stats = IngestStats::default();
    let mut events = spawn_reader(source, limit);

    while let Some(raw) = next_raw(&mut events, &mut shutdown, &mut stats).await? {
        match ingestor.ingest_bytes(&raw) {
            Ok(Ingested::Accepted(envelope)) => {
                publisher.publish(envelope, &mut stats, &mut shutdown).await?;
                if stats.interrupted {
                    break;
                }
            }
            Ok(Ingested::Filtered(envelope)) => {
                stats.filtered += 1;
                tracing::debug!(
                    source_id = envelope.source_id(),
                    entity_type = envelope.event.entity_type.as_str(),
                    operation = %envelope.event.operation,
                    "Event filtered out"
                );
            }
            Err(e) => {
                stats.malformed += 1;
                tracing::warn!(
                    pipeline = publisher.pipeline.as_str(),
                    event = stats.events_read,
                    "Dropping malformed event: {}",
                    e
                );
            }
        }
    }

    tracing::info!(
        pipeline = publisher.pipeline.as_str(),
        events_read = stats.events_read,
        published = stats.published,
        malformed = stats.malformed,
        filtered = stats.filtered,
        "Ingest finished"
    );
    Ok(stats)
}

/// Run a relay pipeline built from its config.
///
/// # Errors
///
/// Returns a `PipelineError` if a connector cannot be opened, a shard worker
/// fails, or the state backend is unavailable.
pub async fn run_pipeline(
    config: &PipelineConfig,
    options: &ExecutionOptions,
    shutdown: watch::Receiver<bool>,
) -> Result<PipelineOutcome, PipelineError> {
    if options.dry_run {
        let source = open_source(config)?;
        let result = dry_run(config, source, options, shutdown).await?;
        return Ok(PipelineOutcome::DryRun(result));
    }
    let parts = RelayParts::from_config(config)?;
    let result = run_with_parts(config, parts, options, shutdown).await?;
    Ok(PipelineOutcome::Run(result))
}

/// Run a relay pipeline over caller-supplied connectors.
///
/// Ingest and the shard workers run concurrently. Workers drain their
/// partitions after ingest finishes, then the run is recorded.
///
/// # Errors
///
/// Returns a `PipelineError` if mappings fail to compile, ingest or a shard
/// worker hits an infrastructure failure, or run history cannot be written.
pub async fn run_with_parts(
    config: &PipelineConfig,
    parts: RelayParts,
    options: &ExecutionOptions,
    shutdown: watch::Receiver<bool>,
) -> Result<PipelineResult, PipelineError> {
    let start = Instant::now();
    let pipeline = PipelineId::new(&config.pipeline);
    let RelayParts {
        state,
        queue,
        source,
        writeback,
        destination,
    } = parts;

    let transformer = Arc::new(Transformer::compile(&config.transform)?);

    let pid = pipeline.clone();
    let pending = state_call(&state, move |s| s.pending_applies(&pid)).await?;
    if !pending.is_empty() {
        tracing::warn!(
            pipeline = pipeline.as_str(),
            count = pending.len(),
            "Apply journal holds entries from an interrupted run; redelivered events will be reconciled by dedup"
        );
    }

    let pid = pipeline.clone();
    let run_id = state_call(&state, move |s| s.start_run(&pid)).await?;
    tracing::info!(
        pipeline = pipeline.as_str(),
        run_id,
        partitions = queue.partitions(),
        shards = config.workers.shards,
        "Relay run started"
    );

    let retry = RetryPolicy::from_config(&config.retry);
    let processor = Arc::new(EnvelopeProcessor::new(
        ProcessorSettings {
            pipeline: pipeline.clone(),
            run_id,
            retry,
            timeouts: config.timeouts.clone(),
        },
        Arc::clone(&state),
        transformer,
        destination,
        writeback,
    ));

    let partitions = queue.partitions();
    let shards = config.workers.shards.clamp(1, partitions.max(1));
    let ingest_done = Arc::new(AtomicBool::new(false));
    let mut workers: JoinSet<Result<ShardStats, PipelineError>> = JoinSet::new();
    for shard in 0..shards {
        let worker = ShardWorker {
            shard,
            partitions: owned_partitions(shard, shards, partitions),
            queue: Arc::clone(&queue),
            processor: Arc::clone(&processor),
            queue_timeout: config.timeouts.queue(),
            idle_poll: Duration::from_millis(config.workers.idle_poll_ms),
            retry,
            ingest_done: Arc::clone(&ingest_done),
        };
        workers.spawn(worker.run(shutdown.clone()));
    }

    let publisher = Publisher {
        pipeline: pipeline.clone(),
        run_id,
        queue: Arc::clone(&queue),
        state: Arc::clone(&state),
        coordinator: RetryCoordinator::new(retry),
        timeout: config.timeouts.queue(),
    };
    let ingest = run_ingest(
        ingestor_for(config, partitions),
        publisher,
        source,
        options.limit,
        shutdown,
    )
    .await;
    // Workers drain what was published even when ingest failed.
    ingest_done.store(true, Ordering::Release);

    let collection = collect_shard_results(workers).await?;
    let (ingest, first_error) = match (ingest, collection.first_error) {
        (Ok(stats), None) => (stats, None),
        (Ok(stats), Some(e)) => (stats, Some(e)),
        (Err(e), _) => (IngestStats::default(), Some(e)),
    };

    let result = PipelineResult {
        run_id,
        ingest,
        shards: collection.stats,
        duration_secs: start.elapsed().as_secs_f64(),
    };
    let mut stats = RunStats {
        events_read: result.ingest.events_read,
        events_applied: result.applied(),
        events_skipped: result.skipped(),
        dead_lettered: result.dead_lettered(),
        retries: result.retries(),
        error_message: None,
    };

    if let Some(err) = first_error {
        stats.error_message = Some(err.to_string());
        tracing::error!(pipeline = pipeline.as_str(), run_id, "Relay run failed: {}", err);
        state_call(&state, move |s| s.complete_run(run_id, RunStatus::Failed, &stats)).await?;
        return Err(err);
    }

    let status = if result.interrupted() {
        RunStatus::Interrupted
    } else {
        RunStatus::Completed
    };
    tracing::info!(
        pipeline = pipeline.as_str(),
        run_id,
        status = %status,
        applied = stats.events_applied,
        skipped = stats.events_skipped,
        dead_lettered = stats.dead_lettered,
        retries = stats.retries,
        duration_secs = result.duration_secs,
        "Relay run finished"
    );
    state_call(&state, move |s| s.complete_run(run_id, status, &stats)).await?;
    Ok(result)
}

/// Ingest and transform without touching the queue, state or destination.
///
/// # Errors
///
/// Returns an error if mappings fail to compile or the source cannot be read.
pub async fn dry_run(
    config: &PipelineConfig,
    source: Box<dyn ChangeSource>,
    options: &ExecutionOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<DryRunResult, PipelineError> {
    let start = Instant::now();
    let transformer = Transformer::compile(&config.transform)?;
    let ingestor = ingestor_for(config, config.broker.partitions);
    let mut stats = IngestStats::default();
    let mut records = Vec::new();
    let mut mapping_errors = Vec::new();
    let mut events = spawn_reader(source, options.limit);

    while let Some(raw) = next_raw(&mut events, &mut shutdown, &mut stats).await? {
        match ingestor.ingest_bytes(&raw) {
            Ok(Ingested::Accepted(envelope)) => match transformer.transform(&envelope) {
                Ok(record) => records.push(record),
                Err(e) => mapping_errors.push((
                    envelope.source_id().to_string(),
                    envelope.sequence(),
                    e,
                )),
            },
            Ok(Ingested::Filtered(_)) => stats.filtered += 1,
            Err(e) => {
                stats.malformed += 1;
                tracing::warn!(event = stats.events_read, "Dropping malformed event: {}", e);
            }
        }
    }

    Ok(DryRunResult {
        events_read: stats.events_read,
        malformed: stats.malformed,
        filtered: stats.filtered,
        records,
        mapping_errors,
        duration_secs: start.elapsed().as_secs_f64(),
    })
}

fn log_check(component: &str, status: &CheckStatus) {
    match status {
        CheckStatus::Ok => tracing::info!(component, "Check passed"),
        CheckStatus::Failed(message) => tracing::error!(component, "Check failed: {}", message),
    }
}

/// Validate that every part of the pipeline can be built.
///
/// # Errors
///
/// Returns an error only if a check task panics. Component failures are
/// reported in the returned [`CheckResult`].
pub async fn check_pipeline(config: &PipelineConfig) -> Result<CheckResult> {
    tracing::info!(pipeline = config.pipeline, "Checking pipeline configuration");

    let cfg = config.clone();
    let (state, source, writeback, destination) = tokio::task::spawn_blocking(move || {
        (
            CheckStatus::from_result(create_state_backend(&cfg)),
            CheckStatus::from_result(open_source(&cfg)),
            CheckStatus::from_result(open_writeback(&cfg)),
            CheckStatus::from_result(open_destination(&cfg)),
        )
    })
    .await
    .map_err(|e| anyhow::anyhow!("Check task panicked: {e}"))?;

    let result = CheckResult {
        mappings: CheckStatus::from_result(Transformer::compile(&config.transform)),
        state,
        broker: CheckStatus::from_result(create_queue(config)),
        source,
        writeback,
        destination,
    };
    for (component, status) in [
        ("mappings", &result.mappings),
        ("state", &result.state),
        ("broker", &result.broker),
        ("source", &result.source),
        ("writeback", &result.writeback),
        ("destination", &result.destination),
    ] {
        log_check(component, status);
    }
    Ok(result)
}

/// Dead letters recorded for the pipeline, oldest first.
///
/// # Errors
///
/// Returns an infrastructure error if the state backend is unavailable.
pub async fn list_dead_letters(
    config: &PipelineConfig,
    include_replayed: bool,
) -> Result<Vec<StoredDeadLetter>, PipelineError> {
    let state = create_state_backend(config)?;
    let pipeline = PipelineId::new(&config.pipeline);
    state_call(&state, move |s| s.list_dead_letters(&pipeline, include_replayed)).await
}

/// One dead letter by id, if it belongs to the pipeline.
///
/// # Errors
///
/// Returns an infrastructure error if the state backend is unavailable.
pub async fn get_dead_letter(
    config: &PipelineConfig,
    dead_letter_id: i64,
) -> Result<Option<StoredDeadLetter>, PipelineError> {
    let state = create_state_backend(config)?;
    let pipeline = PipelineId::new(&config.pipeline);
    state_call(&state, move |s| s.get_dead_letter(&pipeline, dead_letter_id)).await
}

/// Replay one dead letter built from the pipeline's own connectors.
///
/// # Errors
///
/// See [`replay_with_parts`].
pub async fn replay_dead_letter(
    config: &PipelineConfig,
    dead_letter_id: i64,
    shutdown: watch::Receiver<bool>,
) -> Result<ReplayOutcome, PipelineError> {
    let parts = RelayParts {
        state: create_state_backend(config)?,
        queue: create_queue(config)?,
        source: Box::new(crate::connectors::memory::MemorySource::default()),
        writeback: open_writeback(config)?,
        destination: open_destination(config)?,
    };
    replay_with_parts(config, &parts, dead_letter_id, shutdown).await
}

/// Re-run a dead-lettered envelope through transform, apply and writeback
/// with a fresh attempt budget. The original is marked replayed whether the
/// replay lands or is dead-lettered again.
///
/// # Errors
///
/// Returns an infrastructure error if the dead letter does not exist, was
/// already replayed, the replay is interrupted, or state is unavailable.
pub async fn replay_with_parts(
    config: &PipelineConfig,
    parts: &RelayParts,
    dead_letter_id: i64,
    mut shutdown: watch::Receiver<bool>,
) -> Result<ReplayOutcome, PipelineError> {
    let pipeline = PipelineId::new(&config.pipeline);
    let pid = pipeline.clone();
    let stored = state_call(&parts.state, move |s| s.get_dead_letter(&pid, dead_letter_id))
        .await?
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Dead letter {dead_letter_id} not found for pipeline '{}'",
                pipeline
            )
        })?;
    if let Some(at) = &stored.replayed_at {
        return Err(anyhow::anyhow!("Dead letter {dead_letter_id} was already replayed at {at}").into());
    }

    let transformer = Arc::new(Transformer::compile(&config.transform)?);
    let pid = pipeline.clone();
    let run_id = state_call(&parts.state, move |s| s.start_run(&pid)).await?;
    let processor = EnvelopeProcessor::new(
        ProcessorSettings {
            pipeline: pipeline.clone(),
            run_id,
            retry: RetryPolicy::from_config(&config.retry),
            timeouts: config.timeouts.clone(),
        },
        Arc::clone(&parts.state),
        transformer,
        Arc::clone(&parts.destination),
        Arc::clone(&parts.writeback),
    );

    let mut envelope = stored.record.envelope;
    envelope.attempt_count = 0;
    envelope.dead_letter = false;
    tracing::info!(
        pipeline = pipeline.as_str(),
        dead_letter_id,
        source_id = envelope.source_id(),
        sequence = envelope.sequence(),
        "Replaying dead letter"
    );
    let report = processor.process(envelope, &mut shutdown).await?;

    let mut stats = RunStats {
        events_read: 1,
        retries: u64::from(report.lifecycle.retries()),
        ..RunStats::default()
    };
    let outcome = match report.outcome {
        DeliveryOutcome::Applied { result, .. } => {
            if result.applied {
                stats.events_applied = 1;
            } else {
                stats.events_skipped = 1;
            }
            ReplayOutcome::Applied {
                dead_letter_id,
                result,
            }
        }
        DeliveryOutcome::DeadLettered {
            dead_letter_id: replacement_id,
            ..
        } => {
            stats.dead_lettered = 1;
            ReplayOutcome::DeadLetteredAgain {
                dead_letter_id,
                replacement_id,
            }
        }
        DeliveryOutcome::Interrupted => {
            state_call(&parts.state, move |s| {
                s.complete_run(run_id, RunStatus::Interrupted, &stats)
            })
            .await?;
            return Err(anyhow::anyhow!(
                "Replay of dead letter {dead_letter_id} interrupted; it stays in the channel"
            )
            .into());
        }
    };

    let pid = pipeline.clone();
    state_call(&parts.state, move |s| {
        s.mark_dead_letter_replayed(&pid, dead_letter_id)?;
        s.complete_run(run_id, RunStatus::Completed, &stats)
    })
    .await?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_collect_shard_results_fails_fast_and_cancels_siblings() {
        let mut join_set: JoinSet<Result<ShardStats, PipelineError>> = JoinSet::new();
        join_set.spawn(async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            Ok(ShardStats::default())
        });
        join_set.spawn(async {
            tokio::time::sleep(Duration::from_millis(25)).await;
            Err(PipelineError::Infrastructure(anyhow::anyhow!(
                "expected failure"
            )))
        });

        let start = Instant::now();
        let collected = collect_shard_results(join_set)
            .await
            .expect("collector should return first error, not infra panic");

        assert!(collected.first_error.is_some());
        assert!(collected.stats.is_empty());
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_collect_shard_results_orders_by_shard() {
        let mut join_set: JoinSet<Result<ShardStats, PipelineError>> = JoinSet::new();
        for shard in [2u32, 0, 1] {
            join_set.spawn(async move {
                Ok(ShardStats {
                    shard,
                    ..ShardStats::default()
                })
            });
        }
        let collected = collect_shard_results(join_set).await.unwrap();
        let order: Vec<u32> = collected.stats.iter().map(|s| s.shard).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_reader_honours_limit() {
        let source = crate::connectors::memory::MemorySource::new(
            (0..10).map(|i| serde_json::json!({ "n": i })),
        );
        let mut rx = spawn_reader(Box::new(source), Some(3));
        let mut seen = 0;
        while let Some(item) = rx.recv().await {
            item.unwrap();
            seen += 1;
        }
        assert_eq!(seen, 3);
    }
}
