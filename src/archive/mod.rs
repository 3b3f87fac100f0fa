//! HTTP client for the item archive.
//!
//! This module is the single-item collaborator the bulk engine's download
//! worker consumes: item metadata lookup, streaming file downloads, and the
//! search endpoint used to expand a query into an identifier list. The
//! bulk machinery itself lives in [`crate::bulk`] and only ever sees this
//! surface through the worker contract.
//!
//! The archive is expected to expose three endpoints relative to a
//! configurable base URL:
//!
//! - `GET /metadata/{identifier}` - JSON item metadata (file list,
//!   `item_size`, `is_dark`)
//! - `GET /download/{identifier}/{filename}` - file content
//! - `GET /services/search/v1/scrape?q=...` - paginated identifier search

mod client;
mod error;

pub use client::{ArchiveSession, DownloadOutcome, ItemFile, ItemMetadata, SessionConfig};
pub use error::ArchiveError;
