//! Retry policy and per-envelope lifecycle state machine.
//!
//! ```text
//! RECEIVED → PROCESSING → APPLIED
//!                ↓   ↑
//!          RETRY_SCHEDULED → DEAD_LETTERED
//!                ↓
//!          DEAD_LETTERED (non-retryable)
//! ```
//!
//! Every retryable failure records one `RETRY_SCHEDULED` transition. Once
//! `attempt_count` exceeds `max_attempts` the scheduled retry is abandoned
//! and the envelope moves to `DEAD_LETTERED` without sleeping.

use std::time::Duration;

use changebyte_types::envelope::{Envelope, ProcessingState};
use changebyte_types::error::RelayError;

use crate::config::types::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms),
            cap: Duration::from_millis(config.cap_ms),
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before the retry following `attempt_count` prior failures:
    /// `min(base * 2^attempt_count, cap)`.
    #[must_use]
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt_count).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ProcessingState,
    pub to: ProcessingState,
    pub attempt_count: u32,
    pub delay: Option<Duration>,
}

/// State and transition history of one envelope while a worker owns it.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: ProcessingState,
    history: Vec<Transition>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: ProcessingState::Received,
            history: Vec::new(),
        }
    }
}

impl Lifecycle {
    #[must_use]
    pub fn state(&self) -> ProcessingState {
        self.state
    }

    #[must_use]
    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Number of `RETRY_SCHEDULED` transitions recorded.
    #[must_use]
    pub fn retries(&self) -> u32 {
        let n = self
            .history
            .iter()
            .filter(|t| t.to == ProcessingState::RetryScheduled)
            .count();
        u32::try_from(n).unwrap_or(u32::MAX)
    }

    fn transition(&mut self, to: ProcessingState, attempt_count: u32, delay: Option<Duration>) {
        debug_assert!(!self.state.is_terminal(), "transition out of terminal state");
        self.history.push(Transition {
            from: self.state,
            to,
            attempt_count,
            delay,
        });
        self.state = to;
    }

    pub fn begin(&mut self, envelope: &Envelope) {
        self.transition(ProcessingState::Processing, envelope.attempt_count, None);
    }

    pub fn succeed(&mut self, envelope: &Envelope) {
        self.transition(ProcessingState::Applied, envelope.attempt_count, None);
    }
}

/// What the worker does with a failed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    RetryAfter(Duration),
    DeadLetter,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
}

impl RetryCoordinator {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failure and decide the envelope's fate.
    pub fn on_failure(
        &self,
        lifecycle: &mut Lifecycle,
        envelope: &mut Envelope,
        error: &RelayError,
    ) -> Disposition {
        if !error.is_retryable() {
            envelope.dead_letter = true;
            lifecycle.transition(ProcessingState::DeadLettered, envelope.attempt_count, None);
            return Disposition::DeadLetter;
        }

        let delay = self.policy.delay_for(envelope.attempt_count);
        envelope.attempt_count = envelope.attempt_count.saturating_add(1);
        lifecycle.transition(
            ProcessingState::RetryScheduled,
            envelope.attempt_count,
            Some(delay),
        );

        if envelope.attempt_count > self.policy.max_attempts {
            envelope.dead_letter = true;
            lifecycle.transition(ProcessingState::DeadLettered, envelope.attempt_count, None);
            return Disposition::DeadLetter;
        }
        Disposition::RetryAfter(delay)
    }
}
