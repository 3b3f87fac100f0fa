//! Download worker for bulk operations.

use std::path::Path;
use std::sync::Arc;
use std::sync::LazyLock;
use std::thread::{self, ThreadId};

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use tracing::{debug, warn};

use crate::archive::{ArchiveSession, ItemFile, ItemMetadata};
use crate::bulk::{VerifyResult, Worker, WorkerResult};

/// Creates a fresh [`ArchiveSession`]; invoked once per worker thread.
pub type SessionFactory = dyn Fn() -> ArchiveSession + Send + Sync;

#[allow(clippy::unwrap_used)] // pattern is a compile-time constant
static GLOB_METACHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.+^$(){}\[\]|\\]").unwrap());

/// File-selection options passed through from the CLI.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Only transfer files whose name matches this glob (`*` and `?`).
    pub glob: Option<String>,
    /// Only transfer files whose format label is one of these.
    pub formats: Vec<String>,
    /// Resolve and count files without writing anything.
    pub dry_run: bool,
}

/// Downloads an item's files through the archive client.
///
/// Each worker thread gets its own [`ArchiveSession`] via the session
/// factory, cached by thread identity, so sessions are created exactly once
/// per thread and never shared across threads.
pub struct DownloadWorker {
    session_factory: Arc<SessionFactory>,
    options: DownloadOptions,
    glob: Option<Regex>,
    sessions: DashMap<ThreadId, ArchiveSession>,
}

impl DownloadWorker {
    /// Creates a worker over `session_factory` with the given file filters.
    #[must_use]
    pub fn new(session_factory: Arc<SessionFactory>, options: DownloadOptions) -> Self {
        let glob = options.glob.as_deref().and_then(|pattern| {
            let translated = glob_to_regex(pattern);
            match Regex::new(&translated) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!(pattern, error = %e, "ignoring unusable glob pattern");
                    None
                }
            }
        });
        Self {
            session_factory,
            options,
            glob,
            sessions: DashMap::new(),
        }
    }

    /// Returns the session for the current thread, creating it on first
    /// use.
    fn session(&self) -> ArchiveSession {
        let tid = thread::current().id();
        self.sessions
            .entry(tid)
            .or_insert_with(|| (self.session_factory)())
            .clone()
    }

    /// Applies the glob and format filters to an item's file list.
    fn select_files(&self, item: &ItemMetadata) -> Vec<ItemFile> {
        item.files
            .iter()
            .filter(|file| {
                if let Some(glob) = &self.glob {
                    if !glob.is_match(&file.name) {
                        return false;
                    }
                }
                if !self.options.formats.is_empty() {
                    let format = file.format.as_deref().unwrap_or("");
                    if !self.options.formats.iter().any(|f| f == format) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Worker for DownloadWorker {
    async fn estimate_size(&self, identifier: &str) -> Option<u64> {
        let session = self.session();
        match session.get_item(identifier).await {
            Ok(item) => item.item_size,
            Err(e) => {
                warn!(identifier, error = %e, "could not retrieve item for size estimate");
                None
            }
        }
    }

    async fn execute(&self, identifier: &str, destdir: &Path) -> WorkerResult {
        let session = self.session();
        let item = match session.get_item(identifier).await {
            Ok(item) => item,
            Err(e) => return WorkerResult::failure(identifier, e.to_string()),
        };

        if item.is_dark {
            return WorkerResult::failure(identifier, format!("item {identifier} is dark"));
        }

        let selected = self.select_files(&item);
        debug!(
            identifier,
            total = item.files.len(),
            selected = selected.len(),
            "resolved file selection"
        );

        if self.options.dry_run {
            return WorkerResult {
                success: true,
                identifier: identifier.to_string(),
                bytes_transferred: 0,
                files_ok: selected.len() as u64,
                files_skipped: 0,
                files_failed: 0,
                error: None,
            };
        }

        let outcome = session.download_item(identifier, &selected, destdir).await;
        let files_failed = outcome.failed.len() as u64;
        let files_ok = selected.len() as u64 - files_failed - outcome.files_skipped;

        // The archive does not report transfer totals; sum what actually
        // landed on disk.
        let item_dir = destdir.join(identifier);
        let bytes_transferred = tokio::task::spawn_blocking(move || count_bytes(&item_dir))
            .await
            .unwrap_or(0);

        WorkerResult {
            success: files_failed == 0,
            identifier: identifier.to_string(),
            bytes_transferred,
            files_ok,
            files_skipped: outcome.files_skipped,
            files_failed,
            error: (files_failed > 0).then(|| format!("{files_failed} file(s) failed")),
        }
    }

    async fn verify(&self, identifier: &str, destdir: &Path) -> VerifyResult {
        let session = self.session();
        let item = match session.get_item(identifier).await {
            Ok(item) => item,
            Err(e) => {
                warn!(identifier, error = %e, "could not retrieve item for verification");
                return VerifyResult {
                    identifier: identifier.to_string(),
                    ..VerifyResult::default()
                };
            }
        };

        let expected = self.select_files(&item);
        let item_dir = destdir.join(identifier);
        let mut files_found = 0u64;
        let mut files_missing = Vec::new();

        for file in &expected {
            if item_dir.join(&file.name).exists() {
                files_found += 1;
            } else {
                files_missing.push(file.name.clone());
            }
        }

        VerifyResult {
            identifier: identifier.to_string(),
            complete: files_found == expected.len() as u64,
            files_expected: expected.len() as u64,
            files_found,
            files_missing,
            files_corrupted: Vec::new(),
        }
    }
}

/// Translates a shell glob (`*`, `?`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> String {
    let escaped = GLOB_METACHARS.replace_all(pattern, r"\$0");
    let translated = escaped.replace('*', ".*").replace('?', ".");
    format!("^{translated}$")
}

/// Walks `directory` and sums file sizes.
fn count_bytes(directory: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(directory) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            total += count_bytes(&path);
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    total
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::archive::SessionConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn factory_for(server: &MockServer) -> Arc<SessionFactory> {
        let config = SessionConfig {
            base_url: server.uri(),
            ..SessionConfig::default()
        };
        Arc::new(move || ArchiveSession::new(config.clone()))
    }

    fn worker_for(server: &MockServer, options: DownloadOptions) -> DownloadWorker {
        DownloadWorker::new(factory_for(server), options)
    }

    async fn mount_metadata(server: &MockServer, identifier: &str, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path(format!("/metadata/{identifier}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    async fn mount_file(server: &MockServer, identifier: &str, name: &str, body: &[u8]) {
        Mock::given(method("GET"))
            .and(path(format!("/download/{identifier}/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_estimate_size_reads_item_size_field() {
        let server = MockServer::start().await;
        mount_metadata(
            &server,
            "sized",
            serde_json::json!({"files": [], "item_size": 4096}),
        )
        .await;
        mount_metadata(&server, "unsized", serde_json::json!({"files": []})).await;

        let worker = worker_for(&server, DownloadOptions::default());
        assert_eq!(worker.estimate_size("sized").await, Some(4096));
        assert_eq!(worker.estimate_size("unsized").await, None);
    }

    #[tokio::test]
    async fn test_estimate_size_never_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metadata/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let worker = worker_for(&server, DownloadOptions::default());
        assert_eq!(worker.estimate_size("broken").await, None);
    }

    #[tokio::test]
    async fn test_execute_downloads_and_counts_bytes_from_disk() {
        let server = MockServer::start().await;
        mount_metadata(
            &server,
            "item-a",
            serde_json::json!({"files": [
                {"name": "one.txt", "size": 3},
                {"name": "two.txt", "size": 6},
            ]}),
        )
        .await;
        mount_file(&server, "item-a", "one.txt", b"abc").await;
        mount_file(&server, "item-a", "two.txt", b"defghi").await;

        let destdir = TempDir::new().unwrap();
        let worker = worker_for(&server, DownloadOptions::default());
        let result = worker.execute("item-a", destdir.path()).await;

        assert!(result.success);
        assert_eq!(result.files_ok, 2);
        assert_eq!(result.files_failed, 0);
        assert_eq!(result.bytes_transferred, 9);
        assert!(destdir.path().join("item-a/one.txt").exists());
    }

    #[tokio::test]
    async fn test_execute_dark_item_fails_without_io() {
        let server = MockServer::start().await;
        mount_metadata(
            &server,
            "hidden",
            serde_json::json!({"files": [{"name": "secret.txt"}], "is_dark": true}),
        )
        .await;

        let destdir = TempDir::new().unwrap();
        let worker = worker_for(&server, DownloadOptions::default());
        let result = worker.execute("hidden", destdir.path()).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("dark"));
        assert!(!destdir.path().join("hidden").exists());
    }

    #[tokio::test]
    async fn test_execute_metadata_error_becomes_failure_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metadata/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let destdir = TempDir::new().unwrap();
        let worker = worker_for(&server, DownloadOptions::default());
        let result = worker.execute("gone", destdir.path()).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("404"));
    }

    #[tokio::test]
    async fn test_execute_reports_failed_files() {
        let server = MockServer::start().await;
        mount_metadata(
            &server,
            "item-a",
            serde_json::json!({"files": [
                {"name": "ok.txt", "size": 2},
                {"name": "missing.txt", "size": 2},
            ]}),
        )
        .await;
        mount_file(&server, "item-a", "ok.txt", b"ok").await;
        Mock::given(method("GET"))
            .and(path("/download/item-a/missing.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let destdir = TempDir::new().unwrap();
        let worker = worker_for(&server, DownloadOptions::default());
        let result = worker.execute("item-a", destdir.path()).await;

        assert!(!result.success);
        assert_eq!(result.files_ok, 1);
        assert_eq!(result.files_failed, 1);
        assert_eq!(result.error.as_deref(), Some("1 file(s) failed"));
    }

    #[tokio::test]
    async fn test_glob_filter_selects_matching_files() {
        let server = MockServer::start().await;
        mount_metadata(
            &server,
            "item-a",
            serde_json::json!({"files": [
                {"name": "track01.flac", "size": 4},
                {"name": "track01.mp3", "size": 4},
                {"name": "cover.jpg", "size": 4},
            ]}),
        )
        .await;
        mount_file(&server, "item-a", "track01.flac", b"flac").await;

        let destdir = TempDir::new().unwrap();
        let worker = worker_for(
            &server,
            DownloadOptions {
                glob: Some("*.flac".to_string()),
                ..DownloadOptions::default()
            },
        );
        let result = worker.execute("item-a", destdir.path()).await;

        assert!(result.success);
        assert_eq!(result.files_ok, 1);
        assert!(destdir.path().join("item-a/track01.flac").exists());
        assert!(!destdir.path().join("item-a/track01.mp3").exists());
    }

    #[tokio::test]
    async fn test_format_filter_selects_matching_files() {
        let server = MockServer::start().await;
        mount_metadata(
            &server,
            "item-a",
            serde_json::json!({"files": [
                {"name": "a.txt", "size": 1, "format": "Text"},
                {"name": "b.jpg", "size": 1, "format": "JPEG"},
            ]}),
        )
        .await;
        mount_file(&server, "item-a", "a.txt", b"x").await;

        let destdir = TempDir::new().unwrap();
        let worker = worker_for(
            &server,
            DownloadOptions {
                formats: vec!["Text".to_string()],
                ..DownloadOptions::default()
            },
        );
        let result = worker.execute("item-a", destdir.path()).await;

        assert!(result.success);
        assert_eq!(result.files_ok, 1);
        assert!(!destdir.path().join("item-a/b.jpg").exists());
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let server = MockServer::start().await;
        mount_metadata(
            &server,
            "item-a",
            serde_json::json!({"files": [{"name": "one.txt", "size": 3}]}),
        )
        .await;

        let destdir = TempDir::new().unwrap();
        let worker = worker_for(
            &server,
            DownloadOptions {
                dry_run: true,
                ..DownloadOptions::default()
            },
        );
        let result = worker.execute("item-a", destdir.path()).await;

        assert!(result.success);
        assert_eq!(result.files_ok, 1);
        assert_eq!(result.bytes_transferred, 0);
        assert!(!destdir.path().join("item-a").exists());
    }

    #[tokio::test]
    async fn test_verify_reports_missing_files() {
        let server = MockServer::start().await;
        mount_metadata(
            &server,
            "item-a",
            serde_json::json!({"files": [
                {"name": "have.txt", "size": 4},
                {"name": "lost.txt", "size": 4},
            ]}),
        )
        .await;

        let destdir = TempDir::new().unwrap();
        let item_dir = destdir.path().join("item-a");
        std::fs::create_dir_all(&item_dir).unwrap();
        std::fs::write(item_dir.join("have.txt"), b"data").unwrap();

        let worker = worker_for(&server, DownloadOptions::default());
        let result = worker.verify("item-a", destdir.path()).await;

        assert!(!result.complete);
        assert_eq!(result.files_expected, 2);
        assert_eq!(result.files_found, 1);
        assert_eq!(result.files_missing, vec!["lost.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_verify_complete_item() {
        let server = MockServer::start().await;
        mount_metadata(
            &server,
            "item-a",
            serde_json::json!({"files": [{"name": "have.txt", "size": 4}]}),
        )
        .await;

        let destdir = TempDir::new().unwrap();
        let item_dir = destdir.path().join("item-a");
        std::fs::create_dir_all(&item_dir).unwrap();
        std::fs::write(item_dir.join("have.txt"), b"data").unwrap();

        let worker = worker_for(&server, DownloadOptions::default());
        let result = worker.verify("item-a", destdir.path()).await;

        assert!(result.complete);
        assert!(result.files_missing.is_empty());
    }

    #[tokio::test]
    async fn test_session_factory_runs_once_per_thread() {
        let server = MockServer::start().await;
        mount_metadata(&server, "item-a", serde_json::json!({"files": []})).await;

        let config = SessionConfig {
            base_url: server.uri(),
            ..SessionConfig::default()
        };
        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invocations);
        let factory: Arc<SessionFactory> = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            ArchiveSession::new(config.clone())
        });

        let worker = DownloadWorker::new(factory, DownloadOptions::default());
        // The current-thread runtime keeps everything on one thread, so
        // repeated calls must reuse one cached session.
        worker.estimate_size("item-a").await;
        worker.estimate_size("item-a").await;
        worker.estimate_size("item-a").await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_glob_translation() {
        assert_eq!(glob_to_regex("*.flac"), r"^.*\.flac$");
        assert_eq!(glob_to_regex("disc?.iso"), r"^disc.\.iso$");

        let regex = Regex::new(&glob_to_regex("track*.mp3")).unwrap();
        assert!(regex.is_match("track01.mp3"));
        assert!(!regex.is_match("track01.mp3.bak"));
        assert!(!regex.is_match("xtrack01.mp3x"));
    }

    #[test]
    fn test_count_bytes_walks_nested_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.bin"), vec![0u8; 10]).unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.bin"), vec![0u8; 5]).unwrap();

        assert_eq!(count_bytes(dir.path()), 15);
        assert_eq!(count_bytes(&dir.path().join("missing")), 0);
    }
}
