use std::path::Path;

use anyhow::Result;

use changebyte_engine::check_pipeline;
use changebyte_engine::result::CheckStatus;

use super::load_pipeline;

/// Execute the `check` command: validate config, mappings and connectivity.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    let config = load_pipeline(pipeline_path)?;
    println!("Pipeline structure: OK");

    let result = check_pipeline(&config).await?;

    print_status("Mappings", &result.mappings);
    print_status("State backend", &result.state);
    print_status("Broker", &result.broker);
    print_status("Source", &result.source);
    print_status("Writeback", &result.writeback);
    print_status("Destination", &result.destination);

    if result.all_ok() {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}

fn print_status(label: &str, status: &CheckStatus) {
    match status {
        CheckStatus::Ok => println!("{:19} OK", format!("{label}:")),
        CheckStatus::Failed(message) => {
            println!("{:19} FAILED", format!("{label}:"));
            println!("  {message}");
        }
    }
}
