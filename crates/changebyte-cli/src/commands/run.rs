use std::path::Path;

use anyhow::Result;

use changebyte_engine::execution::DryRunResult;
use changebyte_engine::{run_pipeline, ExecutionOptions, PipelineOutcome, PipelineResult};

use super::{load_pipeline, shutdown_on_ctrl_c};

/// Execute the `run` command: parse, validate, and relay a pipeline.
pub async fn execute(pipeline_path: &Path, dry_run: bool, limit: Option<u64>) -> Result<()> {
    let config = load_pipeline(pipeline_path)?;

    tracing::info!(
        pipeline = config.pipeline,
        source = config.source.use_ref,
        destination = config.destination.use_ref,
        mappings = config.transform.mappings.len(),
        "Pipeline validated"
    );

    let options = ExecutionOptions { dry_run, limit };
    match run_pipeline(&config, &options, shutdown_on_ctrl_c()).await? {
        PipelineOutcome::Run(result) => print_run(&config.pipeline, &result),
        PipelineOutcome::DryRun(result) => print_dry_run(&config.pipeline, &result)?,
    }
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn print_run(pipeline: &str, result: &PipelineResult) {
    if result.interrupted() {
        println!("Pipeline '{pipeline}' interrupted; unfinished envelopes will be redelivered.");
    } else {
        println!("Pipeline '{pipeline}' completed successfully.");
    }
    let ingest = &result.ingest;
    println!("  Run id:          {}", result.run_id);
    println!("  Events read:     {}", ingest.events_read);
    println!("  Malformed:       {}", ingest.malformed);
    println!("  Filtered:        {}", ingest.filtered);
    println!("  Published:       {}", ingest.published);
    println!("  Applied:         {}", result.applied());
    println!(
        "  Skipped:         {} (duplicate {}, stale {})",
        result.skipped(),
        result.duplicates(),
        result.stale()
    );
    println!("  Written back:    {}", result.writebacks());
    println!("  Retries:         {}", result.retries());
    println!("  Dead-lettered:   {}", result.dead_lettered());
    println!("  Duration:        {:.2}s", result.duration_secs);
    if result.duration_secs > 0.0 {
        println!(
            "  Throughput:      {:.0} events/sec",
            ingest.events_read as f64 / result.duration_secs
        );
    }
    for shard in &result.shards {
        println!(
            "    Shard {}: delivered {}, applied {}, dead-lettered {}",
            shard.shard, shard.delivered, shard.applied, shard.dead_lettered
        );
    }

    // Machine-readable JSON for benchmarking tools
    let json = serde_json::json!({
        "run_id": result.run_id,
        "events_read": ingest.events_read,
        "malformed": ingest.malformed,
        "filtered": ingest.filtered,
        "published": ingest.published,
        "publish_retries": ingest.publish_retries,
        "applied": result.applied(),
        "skipped": result.skipped(),
        "duplicates": result.duplicates(),
        "stale": result.stale(),
        "writebacks": result.writebacks(),
        "retries": result.retries(),
        "dead_lettered": result.dead_lettered(),
        "interrupted": result.interrupted(),
        "duration_secs": result.duration_secs,
    });
    println!("@@BENCH_JSON@@{json}");
}

fn print_dry_run(pipeline: &str, result: &DryRunResult) -> Result<()> {
    println!("Dry run of '{pipeline}': nothing was applied.");
    for record in &result.records {
        println!("{}", serde_json::to_string(record)?);
    }
    for (source_id, sequence, error) in &result.mapping_errors {
        println!("  would dead-letter {source_id}@{sequence}: {error}");
    }
    println!(
        "  Events read: {}, records: {}, mapping errors: {}, malformed: {}, filtered: {} ({:.2}s)",
        result.events_read,
        result.records.len(),
        result.mapping_errors.len(),
        result.malformed,
        result.filtered,
        result.duration_secs
    );
    Ok(())
}
