//! Append-only JSONL job log with resume semantics.
//!
//! Every item-level state transition is written as one self-contained JSON
//! line, so a partial trailing write from a crash can be discarded and the
//! rest of the file replayed. Replay rebuilds the in-memory maps that answer
//! [`JobLog::should_skip`] on a resumed run.
//!
//! Record fields common to every line: `ts` (ISO-8601 UTC), `id`, `op`,
//! `event`; the remaining fields depend on the event kind. `completed` is
//! sticky: once an identifier has completed, later events never displace it.
//!
//! Durability: every append is flushed; state-transition events (`started`,
//! `completed`, `failed`, `skipped`) are additionally fsynced before the
//! append returns. `rerouted` is advisory and only flushed, so the crash
//! window for those lines is the OS buffer cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Error type for job log operations.
#[derive(Debug, Error)]
pub enum JobLogError {
    /// The log file could not be read, written, or synced.
    #[error("job log I/O error on {path}: {source}")]
    Io {
        /// The log file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A record could not be serialized to JSON.
    #[error("job log serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Reason an item was skipped.
///
/// `exists`, `dark`, and `empty` are permanent: the item is skipped again on
/// every later run. `no_disk_space` is transient and retried on a later run
/// because disk may have freed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The item's files are already present on disk.
    Exists,
    /// The item is dark (withdrawn from public access) upstream.
    Dark,
    /// The item has no files to transfer.
    Empty,
    /// No destination directory had enough free space.
    NoDiskSpace,
}

impl SkipReason {
    /// Whether this reason survives across runs.
    #[must_use]
    pub fn is_permanent(self) -> bool {
        !matches!(self, Self::NoDiskSpace)
    }

    /// The snake_case wire name of the reason.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exists => "exists",
            Self::Dark => "dark",
            Self::Empty => "empty",
            Self::NoDiskSpace => "no_disk_space",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event-specific payload of one log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// Work started on an identifier.
    Started {
        /// Destination directory the item was routed to.
        destdir: PathBuf,
        /// Size estimate used for the disk reservation (0 when unknown).
        est_bytes: u64,
        /// Worker slot index that picked the item up.
        worker: usize,
        /// Zero-based retry attempt this start belongs to.
        retry: u32,
    },
    /// The operation finished successfully.
    Completed {
        /// Destination directory the item landed in.
        destdir: PathBuf,
        /// Total bytes written for the item.
        bytes_transferred: u64,
        /// Files transferred successfully.
        files_ok: u64,
        /// Files skipped (e.g. already present).
        files_skipped: u64,
        /// Files that failed to transfer.
        files_failed: u64,
        /// Wall-clock seconds the operation took.
        elapsed: f64,
    },
    /// The operation failed.
    Failed {
        /// The failure message.
        error: String,
        /// Retries remaining after this failure.
        retries_left: u32,
    },
    /// The item was skipped without executing.
    Skipped {
        /// Why the item was skipped.
        reason: SkipReason,
    },
    /// Advisory: the item moved to a different destination. Does not
    /// change resume state.
    Rerouted {
        /// Previous destination directory.
        from_destdir: PathBuf,
        /// New destination directory.
        to_destdir: PathBuf,
        /// Why the item was rerouted.
        reason: String,
    },
}

/// One self-contained log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// ISO-8601 UTC timestamp of the write.
    pub ts: String,
    /// The item identifier.
    pub id: String,
    /// Operation name (e.g. `"download"`).
    pub op: String,
    /// Event kind and payload.
    #[serde(flatten)]
    pub event: JobEvent,
}

/// Aggregate counters folded from the in-memory state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobStatus {
    /// Items whose effective state is completed.
    pub completed: usize,
    /// Items whose effective state is failed.
    pub failed: usize,
    /// Items whose effective state is skipped.
    pub skipped: usize,
    /// Sum of `bytes_transferred` across completed items.
    pub total_bytes: u64,
    /// Sum of `files_ok` across completed items.
    pub total_files_ok: u64,
    /// `(identifier, error)` pairs for failed items.
    pub failed_items: Vec<(String, String)>,
}

/// Effective per-identifier state derived from replay.
#[derive(Debug, Clone, PartialEq)]
enum ItemState {
    Started,
    Completed,
    Failed(String),
    Skipped(SkipReason),
}

#[derive(Debug, Default)]
struct LogState {
    items: HashMap<String, ItemState>,
    completed_bytes: HashMap<String, u64>,
    completed_files_ok: HashMap<String, u64>,
}

impl LogState {
    /// Updates state from one parsed record, honoring completion stickiness.
    fn apply(&mut self, record: &JobRecord) {
        let completed_already =
            matches!(self.items.get(&record.id), Some(ItemState::Completed));

        match &record.event {
            JobEvent::Completed {
                bytes_transferred,
                files_ok,
                ..
            } => {
                self.items.insert(record.id.clone(), ItemState::Completed);
                self.completed_bytes
                    .insert(record.id.clone(), *bytes_transferred);
                self.completed_files_ok.insert(record.id.clone(), *files_ok);
            }
            JobEvent::Started { .. } if !completed_already => {
                self.items.insert(record.id.clone(), ItemState::Started);
            }
            JobEvent::Failed { error, .. } if !completed_already => {
                self.items
                    .insert(record.id.clone(), ItemState::Failed(error.clone()));
            }
            JobEvent::Skipped { reason } if !completed_already => {
                self.items
                    .insert(record.id.clone(), ItemState::Skipped(*reason));
            }
            // Rerouted events (and anything after completion) leave
            // resume state untouched.
            _ => {}
        }
    }
}

/// Append-only JSONL job log.
///
/// Appends are serialized through an async mutex around the file handle;
/// the in-memory resume maps live behind their own lock so `should_skip`
/// and `status` never touch the file.
#[derive(Debug)]
pub struct JobLog {
    path: PathBuf,
    file: Mutex<File>,
    state: StdMutex<LogState>,
}

impl JobLog {
    /// Opens (or creates) the log at `path`, replaying existing records.
    ///
    /// Replay is a single pass; a malformed trailing line (the footprint of
    /// a crash mid-write) is silently skipped and appending simply continues
    /// after it.
    ///
    /// # Errors
    ///
    /// Returns [`JobLogError::Io`] if the file cannot be read or opened for
    /// append.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, JobLogError> {
        let path = path.as_ref().to_path_buf();
        let mut state = LogState::default();
        let mut needs_newline = false;

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                // A file not ending in a newline carries a partial trailing
                // write; terminate it so the next append starts a fresh line.
                needs_newline = !contents.is_empty() && !contents.ends_with('\n');
                let lines: Vec<&str> = contents.lines().collect();
                for (idx, line) in lines.iter().enumerate() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JobRecord>(line) {
                        Ok(record) => state.apply(&record),
                        Err(e) if idx == lines.len() - 1 => {
                            debug!(error = %e, "discarding partial trailing log line");
                        }
                        Err(e) => {
                            warn!(line_number = idx + 1, error = %e, "skipping malformed log line");
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(JobLogError::Io { path, source: e }),
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| JobLogError::Io {
                path: path.clone(),
                source: e,
            })?;

        if needs_newline {
            file.write_all(b"\n").await.map_err(|e| JobLogError::Io {
                path: path.clone(),
                source: e,
            })?;
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
            state: StdMutex::new(state),
        })
    }

    /// The path of the underlying log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logs that work has started on an identifier.
    ///
    /// # Errors
    ///
    /// Returns [`JobLogError`] if the record cannot be appended durably.
    pub async fn log_started(
        &self,
        identifier: &str,
        op: &str,
        destdir: &Path,
        est_bytes: u64,
        worker: usize,
        retry: u32,
    ) -> Result<(), JobLogError> {
        self.append(
            identifier,
            op,
            JobEvent::Started {
                destdir: destdir.to_path_buf(),
                est_bytes,
                worker,
                retry,
            },
            true,
        )
        .await
    }

    /// Logs that an identifier completed successfully.
    ///
    /// # Errors
    ///
    /// Returns [`JobLogError`] if the record cannot be appended durably.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_completed(
        &self,
        identifier: &str,
        op: &str,
        destdir: &Path,
        bytes_transferred: u64,
        files_ok: u64,
        files_skipped: u64,
        files_failed: u64,
        elapsed: f64,
    ) -> Result<(), JobLogError> {
        self.append(
            identifier,
            op,
            JobEvent::Completed {
                destdir: destdir.to_path_buf(),
                bytes_transferred,
                files_ok,
                files_skipped,
                files_failed,
                elapsed,
            },
            true,
        )
        .await
    }

    /// Logs that an identifier failed.
    ///
    /// # Errors
    ///
    /// Returns [`JobLogError`] if the record cannot be appended durably.
    pub async fn log_failed(
        &self,
        identifier: &str,
        op: &str,
        error: &str,
        retries_left: u32,
    ) -> Result<(), JobLogError> {
        self.append(
            identifier,
            op,
            JobEvent::Failed {
                error: error.to_string(),
                retries_left,
            },
            true,
        )
        .await
    }

    /// Logs that an identifier was skipped.
    ///
    /// # Errors
    ///
    /// Returns [`JobLogError`] if the record cannot be appended durably.
    pub async fn log_skipped(
        &self,
        identifier: &str,
        op: &str,
        reason: SkipReason,
    ) -> Result<(), JobLogError> {
        self.append(identifier, op, JobEvent::Skipped { reason }, true)
            .await
    }

    /// Logs that an identifier moved to a different destination directory.
    ///
    /// Advisory only: the record never changes resume state and is not
    /// fsynced.
    ///
    /// # Errors
    ///
    /// Returns [`JobLogError`] if the record cannot be appended.
    pub async fn log_rerouted(
        &self,
        identifier: &str,
        op: &str,
        from_destdir: &Path,
        to_destdir: &Path,
        reason: &str,
    ) -> Result<(), JobLogError> {
        self.append(
            identifier,
            op,
            JobEvent::Rerouted {
                from_destdir: from_destdir.to_path_buf(),
                to_destdir: to_destdir.to_path_buf(),
                reason: reason.to_string(),
            },
            false,
        )
        .await
    }

    /// Whether `identifier` should be skipped on this run.
    ///
    /// True iff the effective state is `completed`, or `skipped` with a
    /// permanent reason. Failed, started-but-never-finished (crash), and
    /// unknown identifiers are all eligible for processing.
    #[must_use]
    pub fn should_skip(&self, identifier: &str) -> bool {
        match self.lock_state().items.get(identifier) {
            Some(ItemState::Completed) => true,
            Some(ItemState::Skipped(reason)) => reason.is_permanent(),
            _ => false,
        }
    }

    /// Folds the in-memory maps into aggregate counters.
    ///
    /// Never re-reads the file.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        let state = self.lock_state();

        let mut status = JobStatus::default();
        for (identifier, item) in &state.items {
            match item {
                ItemState::Completed => status.completed += 1,
                ItemState::Failed(error) => {
                    status.failed += 1;
                    status
                        .failed_items
                        .push((identifier.clone(), error.clone()));
                }
                ItemState::Skipped(_) => status.skipped += 1,
                ItemState::Started => {}
            }
        }
        status.total_bytes = state.completed_bytes.values().sum();
        status.total_files_ok = state.completed_files_ok.values().sum();
        status.failed_items.sort();
        status
    }

    /// Identifiers whose effective state is `completed`, for post-hoc
    /// verification.
    #[must_use]
    pub fn completed_identifiers(&self) -> Vec<String> {
        let state = self.lock_state();
        let mut ids: Vec<String> = state
            .items
            .iter()
            .filter(|(_, item)| matches!(item, ItemState::Completed))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    async fn append(
        &self,
        identifier: &str,
        op: &str,
        event: JobEvent,
        fsync: bool,
    ) -> Result<(), JobLogError> {
        let record = JobRecord {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            id: identifier.to_string(),
            op: op.to_string(),
            event,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        {
            let mut file = self.file.lock().await;
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| self.io_error(e))?;
            file.flush().await.map_err(|e| self.io_error(e))?;
            if fsync {
                file.sync_data().await.map_err(|e| self.io_error(e))?;
            }
            // Update resume state while still holding the file lock so
            // record order and state order cannot diverge.
            self.lock_state().apply(&record);
        }
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> JobLogError {
        JobLogError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LogState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
