//! Archive session: metadata lookup, streaming file downloads, search.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};
use url::Url;

use super::error::ArchiveError;

/// Default archive endpoint.
const DEFAULT_BASE_URL: &str = "https://archive.org";

/// Default connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default read timeout in seconds. Applies between chunks, not to the
/// whole transfer, so large files are unaffected.
const READ_TIMEOUT_SECS: u64 = 60;

/// Page size for the search scrape endpoint.
const SEARCH_PAGE_SIZE: usize = 10_000;

/// Configuration for an [`ArchiveSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the archive (no trailing slash required).
    pub base_url: String,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Per-read timeout on response bodies.
    pub read_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
        }
    }
}

impl SessionConfig {
    /// Default configuration with the base URL taken from the
    /// `BULKDL_BASE_URL` environment variable when set.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(base_url) = std::env::var("BULKDL_BASE_URL") {
            if !base_url.trim().is_empty() {
                config.base_url = base_url;
            }
        }
        config
    }
}

/// One file entry in an item's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ItemFile {
    /// File name, relative to the item directory. May contain `/` for
    /// files nested below the item root.
    pub name: String,
    /// Size in bytes, when the archive reports one.
    #[serde(default)]
    pub size: Option<u64>,
    /// Archive-assigned format label (e.g. `"JPEG"`, `"Text"`).
    #[serde(default)]
    pub format: Option<String>,
}

/// Item metadata as returned by `GET /metadata/{identifier}`.
///
/// An unknown identifier yields an empty object, which deserializes to a
/// metadata value with no files.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemMetadata {
    /// The item's file list.
    #[serde(default)]
    pub files: Vec<ItemFile>,
    /// Total item size in bytes, when reported.
    #[serde(default)]
    pub item_size: Option<u64>,
    /// Whether the item is dark (withdrawn from public access).
    #[serde(default)]
    pub is_dark: bool,
}

/// Outcome of downloading one item's selected files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Names of files that failed to download.
    pub failed: Vec<String>,
    /// Files skipped because they were already present with the right size.
    pub files_skipped: u64,
}

#[derive(Debug, Deserialize)]
struct ScrapeItem {
    identifier: String,
}

#[derive(Debug, Deserialize)]
struct ScrapeResponse {
    #[serde(default)]
    items: Vec<ScrapeItem>,
    #[serde(default)]
    cursor: Option<String>,
}

/// HTTP session against one archive endpoint.
///
/// Cheap to clone; the underlying connection pool is shared between
/// clones. Bulk workers instead create one session per worker thread via
/// their session factory, so independent threads never contend on a pool.
#[derive(Debug, Clone)]
pub struct ArchiveSession {
    http: Client,
    base_url: String,
}

impl ArchiveSession {
    /// Creates a session from `config`.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "HTTP client builder failed; falling back to defaults");
                Client::new()
            });
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    /// The configured base URL, without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetches metadata for `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError`] on network failures or non-success HTTP
    /// status codes.
    pub async fn get_item(&self, identifier: &str) -> Result<ItemMetadata, ArchiveError> {
        let url = format!(
            "{}/metadata/{}",
            self.base_url,
            encode_path_segments(identifier)
        );
        debug!(identifier, %url, "fetching item metadata");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ArchiveError::request(&url, e))?;
        if !response.status().is_success() {
            return Err(ArchiveError::http_status(&url, response.status().as_u16()));
        }
        response
            .json::<ItemMetadata>()
            .await
            .map_err(|e| ArchiveError::request(&url, e))
    }

    /// Downloads `files` of `identifier` into `destdir/identifier/`.
    ///
    /// Files already present on disk with a size matching the metadata are
    /// skipped. Per-file errors are collected rather than propagated, so a
    /// single bad file never aborts the rest of the item.
    pub async fn download_item(
        &self,
        identifier: &str,
        files: &[ItemFile],
        destdir: &Path,
    ) -> DownloadOutcome {
        let item_dir = destdir.join(identifier);
        let mut outcome = DownloadOutcome::default();

        for file in files {
            let target = item_dir.join(&file.name);
            if let (Some(expected), Ok(meta)) = (file.size, std::fs::metadata(&target)) {
                if meta.len() == expected {
                    debug!(identifier, file = %file.name, "file already present, skipping");
                    outcome.files_skipped += 1;
                    continue;
                }
            }
            if let Err(e) = self.download_file(identifier, file, &item_dir).await {
                warn!(identifier, file = %file.name, error = %e, "file download failed");
                outcome.failed.push(file.name.clone());
            }
        }
        outcome
    }

    /// Streams one file to `item_dir/{file.name}`, returning bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError`] on network, HTTP status, or filesystem
    /// failures.
    pub async fn download_file(
        &self,
        identifier: &str,
        file: &ItemFile,
        item_dir: &Path,
    ) -> Result<u64, ArchiveError> {
        let url = format!(
            "{}/download/{}/{}",
            self.base_url,
            encode_path_segments(identifier),
            encode_path_segments(&file.name)
        );
        debug!(identifier, file = %file.name, %url, "downloading file");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ArchiveError::request(&url, e))?;
        if !response.status().is_success() {
            return Err(ArchiveError::http_status(&url, response.status().as_u16()));
        }

        let file_path = item_dir.join(&file.name);
        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ArchiveError::io(parent.to_path_buf(), e))?;
        }

        let out = File::create(&file_path)
            .await
            .map_err(|e| ArchiveError::io(file_path.clone(), e))?;
        let mut writer = BufWriter::new(out);
        let mut stream = response.bytes_stream();
        let mut bytes_written: u64 = 0;

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| ArchiveError::request(&url, e))?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| ArchiveError::io(file_path.clone(), e))?;
            bytes_written += chunk.len() as u64;
        }

        writer
            .flush()
            .await
            .map_err(|e| ArchiveError::io(file_path.clone(), e))?;

        Ok(bytes_written)
    }

    /// Expands a search query into the matching identifier list.
    ///
    /// Pages through the scrape endpoint until the cursor runs out.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError`] on network failures, bad status codes, or
    /// an invalid base URL.
    pub async fn search_identifiers(&self, query: &str) -> Result<Vec<String>, ArchiveError> {
        let endpoint = format!("{}/services/search/v1/scrape", self.base_url);
        let mut identifiers = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut url = Url::parse(&endpoint).map_err(|_| ArchiveError::InvalidBaseUrl {
                url: endpoint.clone(),
            })?;
            url.query_pairs_mut()
                .append_pair("q", query)
                .append_pair("count", &SEARCH_PAGE_SIZE.to_string())
                .append_pair("fields", "identifier");
            if let Some(cursor) = &cursor {
                url.query_pairs_mut().append_pair("cursor", cursor);
            }

            let response = self
                .http
                .get(url.clone())
                .send()
                .await
                .map_err(|e| ArchiveError::request(url.as_str(), e))?;
            if !response.status().is_success() {
                return Err(ArchiveError::http_status(
                    url.as_str(),
                    response.status().as_u16(),
                ));
            }
            let page: ScrapeResponse = response
                .json()
                .await
                .map_err(|e| ArchiveError::request(url.as_str(), e))?;

            identifiers.extend(page.items.into_iter().map(|i| i.identifier));
            cursor = page.cursor;
            if cursor.is_none() {
                break;
            }
        }

        debug!(query, count = identifiers.len(), "search expanded");
        Ok(identifiers)
    }
}

/// Percent-encodes a file path for use in a URL, keeping `/` separators so
/// files nested below the item root keep their structure.
fn encode_path_segments(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
