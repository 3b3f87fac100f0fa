//! Status command: summarize a job log without touching the network.

use std::path::Path;

use anyhow::{Context, Result};
use bulkdl_core::JobLog;

/// Prints aggregate counters and failed items from a job log.
///
/// Exit code 0 when the log exists, 1 when it does not.
pub async fn run_status_command(joblog: &Path) -> Result<i32> {
    if !joblog.exists() {
        eprintln!("error: job log not found: {}", joblog.display());
        return Ok(1);
    }

    let job_log = JobLog::open(joblog)
        .await
        .with_context(|| format!("cannot read job log {}", joblog.display()))?;
    let status = job_log.status();

    println!("completed: {}", status.completed);
    println!("failed:    {}", status.failed);
    println!("skipped:   {}", status.skipped);
    println!("bytes:     {}", status.total_bytes);

    if !status.failed_items.is_empty() {
        println!();
        println!("Failed items:");
        for (identifier, error) in &status.failed_items {
            println!("  {identifier}: {error}");
        }
    }

    Ok(0)
}
