use std::path::Path;

use anyhow::Result;

use changebyte_engine::{get_dead_letter, list_dead_letters, replay_dead_letter, ReplayOutcome};

use super::{load_pipeline, shutdown_on_ctrl_c};

/// `dlq list`: one line per dead letter.
pub async fn list(pipeline_path: &Path, include_replayed: bool) -> Result<()> {
    let config = load_pipeline(pipeline_path)?;
    let letters = list_dead_letters(&config, include_replayed).await?;
    if letters.is_empty() {
        println!("No dead letters for '{}'.", config.pipeline);
        return Ok(());
    }

    println!(
        "{:>6}  {:<20} {:>8}  {:<16} {:<24} {:>8}  {:<24} REPLAYED",
        "ID", "SOURCE ID", "SEQ", "KIND", "CODE", "ATTEMPTS", "FAILED AT"
    );
    for letter in &letters {
        let record = &letter.record;
        println!(
            "{:>6}  {:<20} {:>8}  {:<16} {:<24} {:>8}  {:<24} {}",
            letter.id,
            record.envelope.source_id(),
            record.envelope.sequence(),
            record.error_kind.as_str(),
            record.error_code,
            record.attempt_count,
            record.failed_at.as_str(),
            letter
                .replayed_at
                .as_ref()
                .map_or("-", |at| at.as_str()),
        );
    }
    Ok(())
}

/// `dlq show`: the full dead letter as pretty JSON.
pub async fn show(pipeline_path: &Path, id: i64) -> Result<()> {
    let config = load_pipeline(pipeline_path)?;
    let Some(letter) = get_dead_letter(&config, id).await? else {
        anyhow::bail!("Dead letter {id} not found for pipeline '{}'", config.pipeline);
    };
    println!("{}", serde_json::to_string_pretty(&letter)?);
    Ok(())
}

/// `dlq replay`: re-run one dead letter.
pub async fn replay(pipeline_path: &Path, id: i64) -> Result<()> {
    let config = load_pipeline(pipeline_path)?;
    match replay_dead_letter(&config, id, shutdown_on_ctrl_c()).await? {
        ReplayOutcome::Applied { result, .. } => {
            let what = match result.reason {
                None => "applied".to_string(),
                Some(reason) => format!("skipped ({reason})"),
            };
            println!(
                "Dead letter {id} replayed: {what}, destination {}.",
                result.destination_id.as_deref().unwrap_or("-")
            );
        }
        ReplayOutcome::DeadLetteredAgain { replacement_id, .. } => {
            println!("Dead letter {id} failed again; see dead letter {replacement_id}.");
        }
    }
    Ok(())
}
