//! Change-data-capture relay engine.
//!
//! Events flow source → [`ingest`] → [`queue`] → shard workers, which run
//! [`transform`], [`apply`] and [`writeback`] per envelope under the
//! [`retry`] coordinator. Anything that cannot be delivered ends up in the
//! dead-letter channel of the state backend.

pub mod apply;
pub(crate) mod blocking;
pub mod config;
pub mod connectors;
pub(crate) mod dlq;
pub mod error;
pub mod execution;
pub mod ingest;
pub mod orchestrator;
pub mod processor;
pub mod queue;
pub(crate) mod resolve;
pub mod result;
pub mod retry;
pub mod transform;
pub(crate) mod worker;
pub mod writeback;

pub use error::PipelineError;
pub use execution::{ExecutionOptions, PipelineOutcome};
pub use orchestrator::{
    check_pipeline, dry_run, get_dead_letter, list_dead_letters, replay_dead_letter,
    replay_with_parts, run_pipeline, run_with_parts, RelayParts,
};
pub use result::{CheckResult, PipelineResult, ReplayOutcome};

use changebyte_types::envelope::Timestamp;
use chrono::{SecondsFormat, Utc};
use tokio::sync::watch;

pub(crate) fn now_timestamp() -> Timestamp {
    Timestamp::new(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Resolves once shutdown is signalled. Never resolves if the sender is gone
/// without signalling.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
