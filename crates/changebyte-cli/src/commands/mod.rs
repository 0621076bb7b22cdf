pub mod check;
pub mod dlq;
pub mod run;

use std::path::Path;

use anyhow::{Context, Result};
use tokio::sync::watch;

use changebyte_engine::config::{parse_pipeline, validate_pipeline, PipelineConfig};

/// Parse and validate a pipeline file.
pub(crate) fn load_pipeline(pipeline_path: &Path) -> Result<PipelineConfig> {
    let config = parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;
    validate_pipeline(&config)?;
    Ok(config)
}

/// Shutdown signal flipped by the first Ctrl-C.
pub(crate) fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight envelopes");
            let _ = tx.send(true);
        }
    });
    rx
}
