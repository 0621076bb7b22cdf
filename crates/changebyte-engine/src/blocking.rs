//! Deadline-bounded execution of blocking connector calls.

use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};

use changebyte_types::error::{RelayError, Stage};

fn joined<T>(
    stage: Stage,
    outcome: Result<Result<T, RelayError>, JoinError>,
) -> Result<T, RelayError> {
    match outcome {
        Ok(result) => result,
        Err(join_err) => Err(RelayError::transient(
            stage,
            "TASK_FAILED",
            format!("{stage} call did not complete: {join_err}"),
        )),
    }
}

/// Run a blocking call on the blocking pool and wait at most `deadline`.
///
/// Elapsed deadlines and panicked calls both surface as retryable
/// [`RelayError`]s of the stage's transient kind. A call that times out keeps
/// running on the pool; its result is discarded.
pub(crate) async fn call<T, F>(stage: Stage, deadline: Duration, f: F) -> Result<T, RelayError>
where
    F: FnOnce() -> Result<T, RelayError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(deadline, tokio::task::spawn_blocking(f)).await {
        Ok(result) => joined(stage, result),
        Err(_) => Err(RelayError::timeout(stage, deadline)),
    }
}

/// Calls that missed their deadline but are still running on the pool.
///
/// A timed-out destination or broker call can still land. Callers that must
/// not overlap two writes for the same source id run through
/// [`Stragglers::call`] and [`settle`](Stragglers::settle) before the next
/// write.
#[derive(Debug, Default)]
pub(crate) struct Stragglers {
    pending: Vec<(Stage, JoinHandle<Result<(), JoinError>>)>,
}

impl Stragglers {
    /// Same as [`call`], except a timed-out call is kept so it can be
    /// awaited later.
    pub(crate) async fn call<T, F>(
        &mut self,
        stage: Stage,
        deadline: Duration,
        f: F,
    ) -> Result<T, RelayError>
    where
        F: FnOnce() -> Result<T, RelayError> + Send + 'static,
        T: Send + 'static,
    {
        let mut handle = tokio::task::spawn_blocking(f);
        match tokio::time::timeout(deadline, &mut handle).await {
            Ok(result) => joined(stage, result),
            Err(_) => {
                let abandoned = tokio::spawn(async move { handle.await.map(drop) });
                self.pending.push((stage, abandoned));
                Err(RelayError::timeout(stage, deadline))
            }
        }
    }

    /// Wait until every abandoned call has finished.
    pub(crate) async fn settle(&mut self) {
        for (stage, handle) in self.pending.drain(..) {
            tracing::debug!(%stage, "Waiting for timed-out call to finish");
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) | Err(e) => {
                    tracing::warn!(%stage, error = %e, "Timed-out call did not complete");
                }
            }
        }
    }
}
