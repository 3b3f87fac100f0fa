//! Verify command: check completed items for missing files on disk.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bulkdl_core::{
    ArchiveSession, DownloadOptions, DownloadWorker, JobLog, SessionConfig, Worker,
};

use crate::cli::Args;

/// Re-checks every completed item in the job log against the disk.
///
/// Nothing is re-downloaded; each expected file is only probed for
/// presence. Exit code 1 when any item is incomplete.
pub async fn run_verify_command(args: &Args) -> Result<i32> {
    let Some(joblog) = &args.joblog else {
        bail!("--verify requires --joblog");
    };
    if !joblog.exists() {
        eprintln!("error: job log not found: {}", joblog.display());
        return Ok(1);
    }

    let job_log = JobLog::open(joblog)
        .await
        .with_context(|| format!("cannot read job log {}", joblog.display()))?;
    let completed = job_log.completed_identifiers();
    if completed.is_empty() {
        println!("No completed items to verify.");
        return Ok(0);
    }

    let config = SessionConfig::from_env();
    let worker = DownloadWorker::new(
        Arc::new(move || ArchiveSession::new(config.clone())),
        DownloadOptions {
            glob: args.glob.clone(),
            formats: args.formats.clone(),
            dry_run: false,
        },
    );
    let destdir = args.destdir.clone().unwrap_or_else(|| PathBuf::from("."));

    let mut ok_count = 0usize;
    let mut bad_count = 0usize;

    for identifier in &completed {
        let result = worker.verify(identifier, &destdir).await;
        if result.complete {
            ok_count += 1;
        } else {
            bad_count += 1;
            let missing: Vec<&str> = result
                .files_missing
                .iter()
                .take(5)
                .map(String::as_str)
                .collect();
            println!(
                "{identifier}: INCOMPLETE ({}/{}) missing: {}",
                result.files_found,
                result.files_expected,
                missing.join(", "),
            );
        }
    }

    println!();
    println!("Verification: {ok_count} OK, {bad_count} incomplete");

    Ok(i32::from(bad_count > 0))
}
