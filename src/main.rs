//! CLI entry point for the bulkdl tool.

use anyhow::Result;
use clap::Parser;
use tracing::debug;

mod cli;
mod commands;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (warn,
    // because the plain UI already narrates per-item progress on stderr)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let code = if args.status {
        let Some(joblog) = args.joblog.as_deref() else {
            anyhow::bail!("--status requires --joblog");
        };
        commands::run_status_command(joblog).await?
    } else if args.verify {
        commands::run_verify_command(&args).await?
    } else {
        commands::run_download_command(&args).await?
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
