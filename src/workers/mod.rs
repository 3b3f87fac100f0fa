//! Concrete bulk-operation workers.
//!
//! Workers implement the [`Worker`](crate::bulk::Worker) contract for one
//! operation each. [`DownloadWorker`] is the reference implementation; an
//! upload worker would live here beside it as a sibling.

mod download;

pub use download::{DownloadOptions, DownloadWorker, SessionFactory};
