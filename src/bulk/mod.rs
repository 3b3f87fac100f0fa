//! Concurrent bulk operation engine.
//!
//! This module implements the machinery for running one operation (download
//! being the reference implementation) across thousands of archive items in
//! parallel, with crash-safe resume:
//!
//! - [`DiskPool`] routes each item to a destination directory with enough
//!   free space and prevents concurrent over-commit through reservations
//! - [`JobLog`] is the append-only event stream that records progress and
//!   answers "has this item already been done?" on a later run
//! - [`Worker`] is the contract concrete operations implement
//! - [`BulkEngine`] drives the whole thing over a bounded pool of worker
//!   slots, retrying failures pass by pass
//! - [`UiEvent`] / [`EventHandler`] publish state transitions to a display
//!   backend without the engine knowing how they are rendered
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bulkdl_core::bulk::{BulkEngine, DiskPool, JobLog, DEFAULT_DISK_MARGIN};
//! use bulkdl_core::workers::DownloadWorker;
//! use bulkdl_core::archive::{ArchiveSession, SessionConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let job_log = Arc::new(JobLog::open("job.jsonl").await?);
//! let disk_pool = Arc::new(DiskPool::new(
//!     vec!["/data/a".into(), "/data/b".into()],
//!     DEFAULT_DISK_MARGIN,
//!     false,
//! ));
//! let config = SessionConfig::default();
//! let worker = Arc::new(DownloadWorker::new(
//!     Arc::new(move || ArchiveSession::new(config.clone())),
//!     Default::default(),
//! ));
//! let engine = BulkEngine::builder(worker, job_log, disk_pool)
//!     .num_workers(4)
//!     .job_retries(1)
//!     .build();
//! let summary = engine.run(&["item-one".into(), "item-two".into()]).await?;
//! println!("{} completed", summary.completed);
//! # Ok(())
//! # }
//! ```

mod disk;
mod engine;
mod joblog;
mod size;
mod ui;
mod worker;

pub use disk::{DiskPool, Reservation, is_no_space_error};
pub use engine::{BulkEngine, BulkEngineBuilder, DEFAULT_NUM_WORKERS, EngineError, RunSummary};
pub use joblog::{JobEvent, JobLog, JobLogError, JobRecord, JobStatus, SkipReason};
pub use size::{DEFAULT_DISK_MARGIN, SizeParseError, format_bytes, parse_size};
pub use ui::{EventHandler, PlainUi, UiEvent, UiEventKind};
pub use worker::{VerifyResult, Worker, WorkerResult};
