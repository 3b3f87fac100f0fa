//! Bulkdl Core Library
//!
//! This library provides the core functionality for the bulkdl tool, a
//! concurrent bulk download engine for item archives. A list of item
//! identifiers goes in; the engine routes each item to a destination
//! directory with free disk space, downloads its files in parallel, and
//! records progress in an append-only job log that doubles as the resume
//! oracle after a crash.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`archive`] - HTTP client for the archive's metadata/download/search APIs
//! - [`bulk`] - The concurrent engine: disk pool, job log, worker contract, UI bus
//! - [`workers`] - Concrete worker implementations (download)

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod archive;
pub mod bulk;
pub mod workers;

// Re-export commonly used types
pub use archive::{ArchiveError, ArchiveSession, ItemFile, ItemMetadata, SessionConfig};
pub use bulk::{
    BulkEngine, DEFAULT_DISK_MARGIN, DEFAULT_NUM_WORKERS, DiskPool, EngineError, EventHandler,
    JobEvent, JobLog, JobLogError, JobStatus, PlainUi, Reservation, RunSummary, SizeParseError,
    SkipReason, UiEvent, UiEventKind, VerifyResult, Worker, WorkerResult, format_bytes, parse_size,
};
pub use workers::{DownloadOptions, DownloadWorker};
