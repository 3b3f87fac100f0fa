//! UI event bus for bulk operations.
//!
//! The engine publishes a [`UiEvent`] for every state transition through an
//! [`EventHandler`]; the engine itself never renders anything. The one
//! backend shipped here is [`PlainUi`], which writes timestamped lines to a
//! text stream. A richer terminal UI would wrap the same trait and is free
//! to queue events internally to marshal them onto its own thread.

use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use super::size::format_bytes;

/// The closed set of event kinds the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiEventKind {
    /// Work started on an item.
    ItemStarted,
    /// An item finished successfully.
    ItemCompleted,
    /// An item failed (may still be retried).
    ItemFailed,
    /// An item was skipped without executing.
    ItemSkipped,
    /// Progress within a single file transfer.
    FileProgress,
    /// Disk pool state changed.
    DiskUpdate,
}

/// An event emitted by the bulk engine for UI consumption.
#[derive(Debug, Clone)]
pub struct UiEvent {
    /// What happened.
    pub kind: UiEventKind,
    /// The item identifier this event relates to.
    pub identifier: String,
    /// The worker slot index that produced the event.
    pub worker: usize,
    /// 1-based position of the item in the overall input.
    pub item_index: Option<usize>,
    /// The file this event relates to, if any.
    pub filename: Option<String>,
    /// Bytes completed so far for this file or item.
    pub bytes_done: Option<u64>,
    /// Total expected bytes for this file or item.
    pub bytes_total: Option<u64>,
    /// Elapsed wall-clock time of the operation.
    pub elapsed: Option<Duration>,
    /// Files successfully processed so far.
    pub files_ok: Option<u64>,
    /// Error message, for failure events.
    pub error: Option<String>,
}

impl UiEvent {
    /// A minimal event of `kind` for `identifier`; optional fields unset.
    #[must_use]
    pub fn new(kind: UiEventKind, identifier: impl Into<String>, worker: usize) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            worker,
            item_index: None,
            filename: None,
            bytes_done: None,
            bytes_total: None,
            elapsed: None,
            files_ok: None,
            error: None,
        }
    }
}

/// Consumes engine events for display.
///
/// Handlers are called synchronously from the producing task and must not
/// block the engine; a handler that panics is swallowed (with a debug log)
/// and never reaches the user.
pub trait EventHandler: Send + Sync {
    /// Handles one event.
    fn handle_event(&self, event: &UiEvent);
}

/// Plain-text UI that writes timestamped status lines to a stream.
///
/// Output format:
///
/// ```text
/// [HH:MM:SS] [idx/total] identifier: message
/// ```
pub struct PlainUi {
    stream: Mutex<Box<dyn Write + Send>>,
    total_items: Option<usize>,
}

impl PlainUi {
    /// A plain UI writing to stderr.
    #[must_use]
    pub fn stderr(total_items: Option<usize>) -> Self {
        Self::new(Box::new(std::io::stderr()), total_items)
    }

    /// A plain UI writing to an arbitrary stream (tests use a buffer).
    #[must_use]
    pub fn new(stream: Box<dyn Write + Send>, total_items: Option<usize>) -> Self {
        Self {
            stream: Mutex::new(stream),
            total_items,
        }
    }

    /// Writes the final summary line after all items have been processed.
    pub fn print_summary(
        &self,
        completed: usize,
        failed: usize,
        skipped: usize,
        total_bytes: u64,
        elapsed: Duration,
    ) {
        let summary = format!(
            "Summary: {completed} completed, {failed} failed, {skipped} skipped, {} in {:.1}s",
            format_bytes(total_bytes),
            elapsed.as_secs_f64(),
        );
        self.write_line(&format!("[{}] {summary}", timestamp()));
    }

    fn message_for(event: &UiEvent) -> Option<String> {
        match event.kind {
            UiEventKind::ItemStarted => Some("download started".to_string()),
            UiEventKind::ItemCompleted => {
                let mut parts = vec!["completed".to_string()];
                if let Some(files_ok) = event.files_ok {
                    parts.push(format!("{files_ok} files"));
                }
                if let Some(bytes_done) = event.bytes_done {
                    parts.push(format_bytes(bytes_done));
                }
                if let Some(elapsed) = event.elapsed {
                    parts.push(format!("{:.1}s", elapsed.as_secs_f64()));
                }
                Some(parts.join(", "))
            }
            UiEventKind::ItemFailed => Some(match &event.error {
                Some(error) => format!("FAILED: {error}"),
                None => "FAILED".to_string(),
            }),
            UiEventKind::ItemSkipped => Some(match event.error.as_deref() {
                Some("no_disk_space") => "skipped (no disk space)".to_string(),
                _ => "skipped (already complete)".to_string(),
            }),
            UiEventKind::FileProgress => {
                let mut parts = Vec::new();
                if let Some(filename) = &event.filename {
                    parts.push(filename.clone());
                }
                if let (Some(done), Some(total)) = (event.bytes_done, event.bytes_total) {
                    if total > 0 {
                        #[allow(clippy::cast_precision_loss)]
                        let pct = done as f64 / total as f64 * 100.0;
                        parts.push(format!(
                            "{}/{} ({pct:.0}%)",
                            format_bytes(done),
                            format_bytes(total),
                        ));
                    }
                }
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join(" "))
                }
            }
            UiEventKind::DiskUpdate => None,
        }
    }

    fn progress_tag(&self, event: &UiEvent) -> String {
        match (event.item_index, self.total_items) {
            (Some(idx), Some(total)) => format!("[{idx}/{total}] "),
            (Some(idx), None) => format!("[{idx}] "),
            _ => String::new(),
        }
    }

    fn write_line(&self, line: &str) {
        if let Ok(mut stream) = self.stream.lock() {
            let _ = writeln!(stream, "{line}");
            let _ = stream.flush();
        }
    }
}

impl EventHandler for PlainUi {
    fn handle_event(&self, event: &UiEvent) {
        let Some(message) = Self::message_for(event) else {
            return;
        };
        let line = format!(
            "[{}] {}{}: {message}",
            timestamp(),
            self.progress_tag(event),
            event.identifier,
        );
        self.write_line(&line);
    }
}

/// Current wall-clock time as `HH:MM:SS` (UTC).
fn timestamp() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// A stream the test can read back after handing it to the UI.
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn ui_with_buffer(total: Option<usize>) -> (PlainUi, SharedBuffer) {
        let buffer = SharedBuffer::default();
        let ui = PlainUi::new(Box::new(buffer.clone()), total);
        (ui, buffer)
    }

    #[test]
    fn test_started_line_has_timestamp_and_progress_tag() {
        let (ui, buffer) = ui_with_buffer(Some(10));
        let mut event = UiEvent::new(UiEventKind::ItemStarted, "item-a", 0);
        event.item_index = Some(3);
        ui.handle_event(&event);

        let line = buffer.contents();
        assert!(line.contains("[3/10] item-a: download started"), "{line}");
        // [HH:MM:SS] prefix.
        assert_eq!(line.as_bytes()[0], b'[');
        assert_eq!(line.as_bytes()[9], b']');
    }

    #[test]
    fn test_completed_line_lists_files_bytes_elapsed() {
        let (ui, buffer) = ui_with_buffer(None);
        let mut event = UiEvent::new(UiEventKind::ItemCompleted, "item-a", 1);
        event.files_ok = Some(4);
        event.bytes_done = Some(2048);
        event.elapsed = Some(Duration::from_millis(1500));
        ui.handle_event(&event);

        let line = buffer.contents();
        assert!(line.contains("item-a: completed, 4 files, 2.0 KB, 1.5s"), "{line}");
    }

    #[test]
    fn test_failed_line_includes_error() {
        let (ui, buffer) = ui_with_buffer(None);
        let mut event = UiEvent::new(UiEventKind::ItemFailed, "item-a", 0);
        event.error = Some("HTTP 503".to_string());
        ui.handle_event(&event);

        assert!(buffer.contents().contains("item-a: FAILED: HTTP 503"));
    }

    #[test]
    fn test_skipped_line_distinguishes_disk_space() {
        let (ui, buffer) = ui_with_buffer(None);
        ui.handle_event(&UiEvent::new(UiEventKind::ItemSkipped, "done-before", 0));
        let mut event = UiEvent::new(UiEventKind::ItemSkipped, "too-big", 0);
        event.error = Some("no_disk_space".to_string());
        ui.handle_event(&event);

        let contents = buffer.contents();
        assert!(contents.contains("done-before: skipped (already complete)"));
        assert!(contents.contains("too-big: skipped (no disk space)"));
    }

    #[test]
    fn test_file_progress_shows_percentage() {
        let (ui, buffer) = ui_with_buffer(None);
        let mut event = UiEvent::new(UiEventKind::FileProgress, "item-a", 0);
        event.filename = Some("disc1.iso".to_string());
        event.bytes_done = Some(512);
        event.bytes_total = Some(1024);
        ui.handle_event(&event);

        let line = buffer.contents();
        assert!(line.contains("disc1.iso 512 B/1.0 KB (50%)"), "{line}");
    }

    #[test]
    fn test_summary_line() {
        let (ui, buffer) = ui_with_buffer(None);
        ui.print_summary(3, 1, 2, 1024 * 1024, Duration::from_secs_f64(12.34));

        let line = buffer.contents();
        assert!(
            line.contains("Summary: 3 completed, 1 failed, 2 skipped, 1.0 MB in 12.3s"),
            "{line}"
        );
    }
}
