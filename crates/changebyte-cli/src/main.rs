mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "changebyte",
    version,
    about = "Reliable change-data-capture relay"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay change events from source to destination
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Preview mode: ingest and transform, print records, apply nothing
        #[arg(long)]
        dry_run: bool,
        /// Maximum raw events to read from the source
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Validate pipeline configuration, mappings and connectivity
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// Inspect and replay dead-lettered envelopes
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List dead letters
    List {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Include dead letters that were already replayed
        #[arg(long)]
        all: bool,
    },
    /// Print one dead letter with its payload and final error
    Show {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Dead letter id
        id: i64,
    },
    /// Re-run one dead letter with a fresh retry budget
    Replay {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Dead letter id
        id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run {
            pipeline,
            dry_run,
            limit,
        } => commands::run::execute(&pipeline, dry_run, limit).await,
        Commands::Check { pipeline } => commands::check::execute(&pipeline).await,
        Commands::Dlq { command } => match command {
            DlqCommands::List { pipeline, all } => commands::dlq::list(&pipeline, all).await,
            DlqCommands::Show { pipeline, id } => commands::dlq::show(&pipeline, id).await,
            DlqCommands::Replay { pipeline, id } => commands::dlq::replay(&pipeline, id).await,
        },
    }
}
