//! CLI command handlers.
//!
//! Each handler maps parsed [`Args`](crate::cli::Args) onto the library's
//! collaborators, runs, and returns the process exit code.

mod download;
mod status;
mod verify;

pub use download::run_download_command;
pub use status::run_status_command;
pub use verify::run_verify_command;

/// Exit code for a signal-induced shutdown (`128 + SIGINT`).
pub const EXIT_INTERRUPTED: i32 = 130;
