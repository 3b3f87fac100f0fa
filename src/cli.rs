//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Bulk download engine for item archives.
///
/// Takes a list of item identifiers (arguments, a file, a search query, or
/// stdin) and downloads each item's files in parallel across one or more
/// destination directories, with crash-safe resume via an append-only job
/// log.
#[derive(Parser, Debug)]
#[command(name = "bulkdl")]
#[command(author, version, about)]
pub struct Args {
    /// Item identifiers; pass "-" to read newline-delimited identifiers
    /// from stdin
    pub identifiers: Vec<String>,

    /// Read identifiers from a file, one per line
    #[arg(long, value_name = "FILE")]
    pub itemlist: Option<PathBuf>,

    /// Expand a search query into the identifier list
    #[arg(long, value_name = "QUERY")]
    pub search: Option<String>,

    /// Number of concurrent workers (1-64)
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub workers: u8,

    /// Maximum retries per failed item (0-10)
    #[arg(short, long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub retries: u8,

    /// Job log path; the progress record and resume oracle
    #[arg(long, value_name = "PATH")]
    pub joblog: Option<PathBuf>,

    /// Destination directories, tried in configured order
    #[arg(long = "destdirs", value_name = "DIR", num_args = 1..)]
    pub destdirs: Vec<PathBuf>,

    /// Single destination directory (also used by --verify)
    #[arg(long, value_name = "DIR")]
    pub destdir: Option<PathBuf>,

    /// Per-disk free-space margin, e.g. "500M" or "2G"
    #[arg(long, default_value = "1G", value_name = "SIZE")]
    pub disk_margin: String,

    /// Disable free-space checks and always use the first destination
    #[arg(long)]
    pub no_disk_check: bool,

    /// Only download files whose name matches this glob
    #[arg(long, value_name = "PATTERN")]
    pub glob: Option<String>,

    /// Only download files with one of these format labels (repeatable)
    #[arg(long = "format", value_name = "FORMAT")]
    pub formats: Vec<String>,

    /// Resolve file selections without writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Print a job log summary and exit
    #[arg(long, conflicts_with = "verify")]
    pub status: bool,

    /// Check completed items for missing files on disk and exit
    #[arg(long)]
    pub verify: bool,

    /// Suppress per-item progress lines
    #[arg(short, long)]
    pub quiet: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
