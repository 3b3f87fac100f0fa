//! Bulk download command: identifier gathering, engine assembly, summary.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use bulkdl_core::{
    ArchiveSession, BulkEngine, DiskPool, DownloadOptions, DownloadWorker, EventHandler, JobLog,
    PlainUi, SessionConfig, parse_size,
};
use tracing::{debug, info, warn};

use super::EXIT_INTERRUPTED;
use crate::cli::Args;

/// Runs the bulk download and returns the process exit code.
pub async fn run_download_command(args: &Args) -> Result<i32> {
    let session_config = SessionConfig::from_env();

    let identifiers = gather_identifiers(args, &session_config).await?;
    if identifiers.is_empty() {
        bail!("no identifiers provided; pass identifiers, --itemlist, --search, or \"-\" for stdin");
    }
    debug!(count = identifiers.len(), "identifier list built");

    let destdirs = resolve_destdirs(args);
    let margin = parse_size(&args.disk_margin).context("invalid --disk-margin")?;
    let disk_pool = Arc::new(DiskPool::new(destdirs, margin, args.no_disk_check));

    let joblog_path = args.joblog.clone().unwrap_or_else(default_joblog_path);
    let job_log = Arc::new(
        JobLog::open(&joblog_path)
            .await
            .with_context(|| format!("cannot open job log {}", joblog_path.display()))?,
    );

    let factory_config = session_config.clone();
    let worker = Arc::new(DownloadWorker::new(
        Arc::new(move || ArchiveSession::new(factory_config.clone())),
        DownloadOptions {
            glob: args.glob.clone(),
            formats: args.formats.clone(),
            dry_run: args.dry_run,
        },
    ));

    let ui = (!args.quiet).then(|| Arc::new(PlainUi::stderr(Some(identifiers.len()))));

    let mut builder = BulkEngine::builder(worker, Arc::clone(&job_log), disk_pool)
        .num_workers(usize::from(args.workers))
        .job_retries(u32::from(args.retries));
    if let Some(ui) = &ui {
        builder = builder.ui_handler(Arc::clone(ui) as Arc<dyn EventHandler>);
    }
    let engine = builder.build();

    // First Ctrl-C stops submission of new items; in-flight work drains.
    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_signal = Arc::clone(&interrupted);
    let engine_signal = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; draining in-flight items");
            interrupted_signal.store(true, Ordering::SeqCst);
            engine_signal.request_stop();
        }
    });

    let start = Instant::now();
    let summary = engine.run(&identifiers).await?;
    let elapsed = start.elapsed();

    let total_bytes = job_log.status().total_bytes;
    if let Some(ui) = &ui {
        ui.print_summary(
            summary.completed,
            summary.failed,
            summary.skipped,
            total_bytes,
            elapsed,
        );
    }
    info!(
        completed = summary.completed,
        failed = summary.failed,
        skipped = summary.skipped,
        total_bytes,
        "bulk download finished"
    );

    if interrupted.load(Ordering::SeqCst) {
        return Ok(EXIT_INTERRUPTED);
    }
    Ok(i32::from(summary.failed > 0))
}

/// Builds the identifier list from CLI args: `--itemlist`, `--search`, or
/// the positional list (with `-` pulling newline-delimited identifiers
/// from stdin).
async fn gather_identifiers(args: &Args, config: &SessionConfig) -> Result<Vec<String>> {
    if let Some(itemlist) = &args.itemlist {
        let contents = tokio::fs::read_to_string(itemlist)
            .await
            .with_context(|| format!("cannot read itemlist {}", itemlist.display()))?;
        return Ok(non_empty_lines(&contents));
    }

    if let Some(query) = &args.search {
        let session = ArchiveSession::new(config.clone());
        let identifiers = session
            .search_identifiers(query)
            .await
            .with_context(|| format!("search failed for query {query:?}"))?;
        if identifiers.is_empty() {
            bail!("the query {query:?} returned no results");
        }
        return Ok(identifiers);
    }

    if args.identifiers.iter().any(|i| i == "-") {
        let mut identifiers: Vec<String> = args
            .identifiers
            .iter()
            .filter(|i| i.as_str() != "-")
            .cloned()
            .collect();
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("cannot read identifiers from stdin")?;
        identifiers.extend(non_empty_lines(&buffer));
        return Ok(identifiers);
    }

    Ok(args.identifiers.clone())
}

fn non_empty_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/// `--destdirs` wins; `--destdir` is the single-directory shorthand; the
/// current directory is the fallback.
fn resolve_destdirs(args: &Args) -> Vec<PathBuf> {
    if !args.destdirs.is_empty() {
        return args.destdirs.clone();
    }
    if let Some(destdir) = &args.destdir {
        return vec![destdir.clone()];
    }
    vec![PathBuf::from(".")]
}

/// A throwaway job log path for runs without `--joblog`, so resume state
/// machinery works uniformly.
fn default_joblog_path() -> PathBuf {
    std::env::temp_dir().join(format!("bulkdl_{}.jsonl", std::process::id()))
}
