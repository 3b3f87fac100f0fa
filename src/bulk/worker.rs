//! Worker contract and result types for bulk operations.
//!
//! The engine drives implementations of [`Worker`] without knowing which
//! operation is being performed. Concrete workers (download today, upload
//! tomorrow) are siblings implementing the same three operations, never
//! layered on each other.

use std::path::Path;

use async_trait::async_trait;

/// Result of a single bulk operation on one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerResult {
    /// Whether the operation completed without errors. The worker is the
    /// authority: `success` with `files_failed > 0` still counts as
    /// completed.
    pub success: bool,
    /// The item identifier the result belongs to.
    pub identifier: String,
    /// Total bytes transferred during the operation.
    pub bytes_transferred: u64,
    /// Number of files successfully processed.
    pub files_ok: u64,
    /// Number of files skipped (e.g. already present).
    pub files_skipped: u64,
    /// Number of files that failed to process.
    pub files_failed: u64,
    /// Error message when `success` is false.
    pub error: Option<String>,
}

impl WorkerResult {
    /// A failure result carrying only an error message.
    #[must_use]
    pub fn failure(identifier: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            identifier: identifier.into(),
            bytes_transferred: 0,
            files_ok: 0,
            files_skipped: 0,
            files_failed: 0,
            error: Some(error.into()),
        }
    }
}

/// Result of verifying a completed operation for one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VerifyResult {
    /// The item identifier the result belongs to.
    pub identifier: String,
    /// Whether all expected files are present.
    pub complete: bool,
    /// Total number of files expected.
    pub files_expected: u64,
    /// Number of files actually found on disk.
    pub files_found: u64,
    /// Names of files missing from disk.
    pub files_missing: Vec<String>,
    /// Names of files that failed content verification.
    pub files_corrupted: Vec<String>,
}

/// Contract between the engine and a concrete bulk operation.
///
/// All three operations may be called concurrently on distinct identifiers
/// from distinct tasks; implementations cache per-thread sessions behind
/// the contract where needed.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Estimates the total size in bytes of the operation for `identifier`.
    ///
    /// A pure query (it may do I/O). Never errors: any failure to estimate
    /// returns `None`, and the caller substitutes a conservative default.
    async fn estimate_size(&self, identifier: &str) -> Option<u64>;

    /// Executes the operation for one identifier into `destdir`.
    ///
    /// Never panics across the contract boundary; internal errors are
    /// captured into a [`WorkerResult`] with `success == false` and a
    /// populated `error`.
    async fn execute(&self, identifier: &str, destdir: &Path) -> WorkerResult;

    /// Checks that the operation's effects for `identifier` are present
    /// under `destdir`. Does not re-transfer anything.
    async fn verify(&self, identifier: &str, destdir: &Path) -> VerifyResult;
}
