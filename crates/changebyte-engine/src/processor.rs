//! Per-envelope delivery: transform, apply, write back, retry.
//!
//! One call to [`EnvelopeProcessor::process`] owns an envelope until it is
//! applied, dead-lettered, or interrupted by shutdown. Retries happen in
//! place, so the next envelope of the same partition is not looked at until
//! this one is done.

use std::sync::Arc;

use tokio::sync::watch;

use changebyte_state::StateBackend;
use changebyte_types::envelope::{DeadLetterRecord, Envelope};
use changebyte_types::error::{RelayError, Stage};
use changebyte_types::event::Operation;
use changebyte_types::record::{ApplyResult, CorrelationRecord, SkipReason};
use changebyte_types::state::PipelineId;

use crate::apply::{DestinationStore, IdempotentApplier};
use crate::blocking::Stragglers;
use crate::config::types::TimeoutConfig;
use crate::error::PipelineError;
use crate::retry::{Disposition, Lifecycle, RetryCoordinator, RetryPolicy};
use crate::transform::Transformer;
use crate::writeback::{CorrelationWriter, SourceWriteback, WritebackOutcome};
use crate::{dlq, now_timestamp, shutdown_requested};

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Applied {
        result: ApplyResult,
        writeback: Option<WritebackOutcome>,
    },
    DeadLettered {
        dead_letter_id: i64,
        error: RelayError,
    },
    /// Shutdown arrived during a backoff sleep. The envelope was not
    /// finished and must be redelivered.
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct DeliveryReport {
    /// The envelope as it ended, with its final `attempt_count`.
    pub envelope: Envelope,
    pub lifecycle: Lifecycle,
    pub outcome: DeliveryOutcome,
}

/// Everything a processor needs besides its connectors.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub pipeline: PipelineId,
    pub run_id: i64,
    pub retry: RetryPolicy,
    pub timeouts: TimeoutConfig,
}

pub struct EnvelopeProcessor {
    settings: ProcessorSettings,
    state: Arc<dyn StateBackend>,
    transformer: Arc<Transformer>,
    applier: Arc<IdempotentApplier>,
    writer: Arc<CorrelationWriter>,
    coordinator: RetryCoordinator,
}

/// Only results that point at a live destination record are written back.
fn needs_writeback(result: &ApplyResult, operation: Operation) -> Option<&str> {
    if operation == Operation::Delete {
        return None;
    }
    match result.reason {
        None | Some(SkipReason::Duplicate) => result.destination_id.as_deref(),
        Some(SkipReason::StaleSequence | SkipReason::MissingTarget) => None,
    }
}

impl EnvelopeProcessor {
    #[must_use]
    pub fn new(
        settings: ProcessorSettings,
        state: Arc<dyn StateBackend>,
        transformer: Arc<Transformer>,
        destination: Arc<dyn DestinationStore>,
        writeback: Arc<dyn SourceWriteback>,
    ) -> Self {
        let applier = Arc::new(IdempotentApplier::new(
            settings.pipeline.clone(),
            Arc::clone(&state),
            destination,
        ));
        let writer = Arc::new(CorrelationWriter::new(
            settings.pipeline.clone(),
            Arc::clone(&state),
            writeback,
        ));
        Self {
            coordinator: RetryCoordinator::new(settings.retry),
            settings,
            state,
            transformer,
            applier,
            writer,
        }
    }

    async fn attempt(
        &self,
        envelope: &Envelope,
        stragglers: &mut Stragglers,
    ) -> Result<(ApplyResult, Option<WritebackOutcome>), RelayError> {
        let record = self.transformer.transform(envelope)?;
        let operation = record.operation;
        let source_id = record.source_id.clone();
        let sequence = record.sequence;

        let applier = Arc::clone(&self.applier);
        let result = stragglers
            .call(Stage::Apply, self.settings.timeouts.destination(), move || {
                applier.apply(&record)
            })
            .await?;

        let Some(destination_id) = needs_writeback(&result, operation) else {
            return Ok((result, None));
        };
        let correlation = CorrelationRecord {
            source_id,
            destination_id: destination_id.to_string(),
            applied_sequence: sequence,
        };
        let writer = Arc::clone(&self.writer);
        let outcome = stragglers
            .call(
                Stage::Writeback,
                self.settings.timeouts.writeback(),
                move || writer.writeback(&correlation),
            )
            .await?;
        Ok((result, Some(outcome)))
    }

    /// Drive `envelope` to a terminal state, or until shutdown interrupts a
    /// backoff sleep.
    ///
    /// Calls that timed out are waited out before the next attempt and
    /// before returning, so no write for this source id is still running
    /// once the next envelope of the partition starts.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if a dead letter cannot be persisted.
    pub async fn process(
        &self,
        mut envelope: Envelope,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<DeliveryReport, PipelineError> {
        let mut lifecycle = Lifecycle::default();
        let mut stragglers = Stragglers::default();
        loop {
            stragglers.settle().await;
            lifecycle.begin(&envelope);
            let error = match self.attempt(&envelope, &mut stragglers).await {
                Ok((result, writeback)) => {
                    stragglers.settle().await;
                    lifecycle.succeed(&envelope);
                    return Ok(DeliveryReport {
                        envelope,
                        lifecycle,
                        outcome: DeliveryOutcome::Applied { result, writeback },
                    });
                }
                Err(error) => error,
            };

            match self
                .coordinator
                .on_failure(&mut lifecycle, &mut envelope, &error)
            {
                Disposition::RetryAfter(delay) => {
                    #[allow(clippy::cast_possible_truncation)]
                    let delay_ms = delay.as_millis() as u64;
                    tracing::warn!(
                        pipeline = self.settings.pipeline.as_str(),
                        source_id = envelope.source_id(),
                        sequence = envelope.sequence(),
                        trace_id = envelope.trace_id.as_str(),
                        attempt = envelope.attempt_count,
                        max_attempts = self.coordinator.policy().max_attempts,
                        delay_ms,
                        stage = %error.stage,
                        error_kind = %error.kind,
                        code = error.code.as_str(),
                        "Retryable failure, will retry: {}",
                        error.message
                    );
                    tokio::select! {
                        biased;
                        () = shutdown_requested(shutdown) => {
                            stragglers.settle().await;
                            return Ok(DeliveryReport {
                                envelope,
                                lifecycle,
                                outcome: DeliveryOutcome::Interrupted,
                            });
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Disposition::DeadLetter => {
                    stragglers.settle().await;
                    let record = DeadLetterRecord::new(&envelope, &error, now_timestamp());
                    let dead_letter_id = dlq::persist_dead_letter(
                        self.state.as_ref(),
                        &self.settings.pipeline,
                        self.settings.run_id,
                        &record,
                    )?;
                    return Ok(DeliveryReport {
                        envelope,
                        lifecycle,
                        outcome: DeliveryOutcome::DeadLettered {
                            dead_letter_id,
                            error,
                        },
                    });
                }
            }
        }
    }
}
