//! Concurrent bulk operation engine.
//!
//! The [`BulkEngine`] distributes item identifiers over a bounded pool of
//! worker slots and drives the retry loop. Each item is routed through the
//! [`DiskPool`] to a destination directory, executed by the [`Worker`],
//! recorded in the [`JobLog`], and published on the UI event bus.
//!
//! # Concurrency Model
//!
//! - Each item runs in its own Tokio task
//! - A semaphore permit bounds in-flight work to the worker-pool size
//! - Permits are released automatically when items finish (RAII)
//! - Every concurrently-running item holds a distinct worker index `0..N-1`,
//!   taken from a free-index pool for the duration of one attempt
//!
//! # Retry Behavior
//!
//! Failures are retried without backoff: retries collect in a side queue
//! and are promoted only after every in-flight item of the current pass has
//! finished. Transient resource exhaustion (a full disk, upstream slowness)
//! is better handled by the next pass after the current work drains than by
//! per-item sleeping.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

use super::disk::{DiskPool, is_no_space_error};
use super::joblog::{JobLog, JobLogError, SkipReason};
use super::ui::{EventHandler, UiEvent, UiEventKind};
use super::worker::Worker;

/// Default worker-pool size if not specified.
pub const DEFAULT_NUM_WORKERS: usize = 1;

/// Error type for engine runs.
///
/// Per-item failures never surface here; they are reported through the
/// returned [`RunSummary`], the job log, and UI events. Only conditions the
/// engine cannot proceed past (durable progress lost, pool machinery gone)
/// escape `run`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The job log could not record progress durably.
    #[error("job log error: {0}")]
    JobLog(#[from] JobLogError),

    /// The worker-slot semaphore was closed unexpectedly.
    #[error("worker slot semaphore closed unexpectedly")]
    SemaphoreClosed,
}

/// Aggregate outcome of one engine run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Items that completed successfully.
    pub completed: usize,
    /// Items that exhausted their retry budget.
    pub failed: usize,
    /// Items skipped (resume, permanent reasons, or no disk space).
    pub skipped: usize,
}

/// One unit of queued work: identifier, retry attempt, 1-based input index.
type QueueEntry = (String, u32, usize);

/// Run counters, updated from concurrent item tasks.
#[derive(Debug, Default)]
struct Counters {
    completed: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    total_bytes: AtomicU64,
}

/// Builder for [`BulkEngine`].
pub struct BulkEngineBuilder {
    worker: Arc<dyn Worker>,
    job_log: Arc<JobLog>,
    disk_pool: Arc<DiskPool>,
    num_workers: usize,
    job_retries: u32,
    op: String,
    ui_handler: Option<Arc<dyn EventHandler>>,
}

impl BulkEngineBuilder {
    /// Sets the worker-pool size (number of concurrent item slots).
    #[must_use]
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }

    /// Sets the per-item retry cap.
    #[must_use]
    pub fn job_retries(mut self, job_retries: u32) -> Self {
        self.job_retries = job_retries;
        self
    }

    /// Sets the operation name written to log records.
    #[must_use]
    pub fn op(mut self, op: impl Into<String>) -> Self {
        self.op = op.into();
        self
    }

    /// Sets the UI event handler.
    #[must_use]
    pub fn ui_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.ui_handler = Some(handler);
        self
    }

    /// Builds the engine.
    #[must_use]
    pub fn build(self) -> BulkEngine {
        let (pause_tx, _) = watch::channel(false);
        // Free worker indices, highest first so `pop` hands out the lowest.
        let worker_indices = (0..self.num_workers).rev().collect();
        BulkEngine {
            inner: Arc::new(EngineInner {
                worker: self.worker,
                job_log: self.job_log,
                disk_pool: self.disk_pool,
                num_workers: self.num_workers,
                job_retries: self.job_retries,
                op: self.op,
                ui_handler: self.ui_handler,
                counters: Counters::default(),
                slots: Arc::new(Semaphore::new(self.num_workers)),
                worker_indices: Mutex::new(worker_indices),
                stop_requested: AtomicBool::new(false),
                pause: pause_tx,
            }),
        }
    }
}

/// Orchestrates concurrent bulk operations over archive items.
///
/// The engine owns the worker slots, the per-slot index map, the retry
/// queue, and the counters; it holds shared references to the job log, the
/// disk pool, the worker, and the UI handler.
#[derive(Clone)]
pub struct BulkEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    worker: Arc<dyn Worker>,
    job_log: Arc<JobLog>,
    disk_pool: Arc<DiskPool>,
    num_workers: usize,
    job_retries: u32,
    op: String,
    ui_handler: Option<Arc<dyn EventHandler>>,
    counters: Counters,
    slots: Arc<Semaphore>,
    worker_indices: Mutex<Vec<usize>>,
    stop_requested: AtomicBool,
    pause: watch::Sender<bool>,
}

impl BulkEngine {
    /// Starts building an engine over the given collaborators.
    #[must_use]
    pub fn builder(
        worker: Arc<dyn Worker>,
        job_log: Arc<JobLog>,
        disk_pool: Arc<DiskPool>,
    ) -> BulkEngineBuilder {
        BulkEngineBuilder {
            worker,
            job_log,
            disk_pool,
            num_workers: DEFAULT_NUM_WORKERS,
            job_retries: 0,
            op: "download".to_string(),
            ui_handler: None,
        }
    }

    /// Executes the bulk operation for all `identifiers`.
    ///
    /// Items already completed (or permanently skipped) per the job log are
    /// skipped up front. Failures are retried up to the configured cap,
    /// pass by pass. Duplicate identifiers in the input are processed
    /// twice within this run; log stickiness turns the duplicate into a
    /// skip only on a later run.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::JobLog`] when progress can no longer be
    /// recorded durably. Individual item failures do NOT error; they are
    /// reported in the returned [`RunSummary`].
    pub async fn run(&self, identifiers: &[String]) -> Result<RunSummary, EngineError> {
        let inner = &self.inner;
        let total = identifiers.len();

        // Pre-pass: drop everything the log says is already done.
        let mut queue: Vec<QueueEntry> = Vec::new();
        for (idx, identifier) in identifiers.iter().enumerate() {
            let item_index = idx + 1;
            if inner.job_log.should_skip(identifier) {
                let mut event = UiEvent::new(UiEventKind::ItemSkipped, identifier.clone(), 0);
                event.item_index = Some(item_index);
                inner.emit(event);
                inner.counters.skipped.fetch_add(1, Ordering::SeqCst);
            } else {
                queue.push((identifier.clone(), 0, item_index));
            }
        }

        info!(
            total,
            queued = queue.len(),
            num_workers = inner.num_workers,
            job_retries = inner.job_retries,
            "starting bulk run"
        );

        let retry_queue: Arc<Mutex<Vec<QueueEntry>>> = Arc::new(Mutex::new(Vec::new()));
        let mut fatal: Option<EngineError> = None;

        // Pass loop: all in-flight work of a pass finishes before retries
        // are promoted into the next pass.
        while !queue.is_empty() && fatal.is_none() {
            if inner.stop_requested() {
                break;
            }

            let mut handles = Vec::new();
            for (identifier, retry, item_index) in queue.drain(..) {
                if inner.stop_requested() {
                    break;
                }
                inner.wait_if_paused().await;

                let permit = Arc::clone(&inner.slots)
                    .acquire_owned()
                    .await
                    .map_err(|_| EngineError::SemaphoreClosed)?;
                if inner.stop_requested() {
                    break;
                }

                let task_inner = Arc::clone(inner);
                let task_retries = Arc::clone(&retry_queue);
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    task_inner
                        .run_item(&identifier, retry, item_index, &task_retries)
                        .await
                }));
            }

            for handle in handles {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        // Durable progress is gone; stop submitting and
                        // surface the first error once the pass drains.
                        warn!(error = %e, "fatal engine error, stopping run");
                        inner.stop_requested.store(true, Ordering::SeqCst);
                        fatal.get_or_insert(e);
                    }
                    Err(e) => {
                        // A panicking worker breaks the contract; contain
                        // it to the one item.
                        warn!(error = %e, "item task panicked");
                    }
                }
            }

            queue = {
                let mut retries = lock_queue(&retry_queue);
                std::mem::take(&mut *retries)
            };
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        let summary = self.summary();
        info!(
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            "bulk run finished"
        );
        Ok(summary)
    }

    /// Signals the engine to stop submitting new items. In-flight items
    /// run to completion; `run` then returns partial counts.
    pub fn request_stop(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Pauses submission of new items (in-flight work continues).
    pub fn pause(&self) {
        let _ = self.inner.pause.send(true);
    }

    /// Resumes item submission after a pause.
    pub fn resume(&self) {
        let _ = self.inner.pause.send(false);
    }

    /// Current counter snapshot.
    #[must_use]
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            completed: self.inner.counters.completed.load(Ordering::SeqCst),
            failed: self.inner.counters.failed.load(Ordering::SeqCst),
            skipped: self.inner.counters.skipped.load(Ordering::SeqCst),
        }
    }

    /// Total bytes transferred by completed items so far.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.inner.counters.total_bytes.load(Ordering::SeqCst)
    }
}

impl EngineInner {
    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    async fn wait_if_paused(&self) {
        let mut rx = self.pause.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Takes the lowest free worker index for the duration of one attempt.
    fn take_worker_index(&self) -> usize {
        // The semaphore bounds concurrency to `num_workers`, so an index
        // is always free here.
        lock_indices(&self.worker_indices).pop().unwrap_or(0)
    }

    fn return_worker_index(&self, index: usize) {
        let mut free = lock_indices(&self.worker_indices);
        free.push(index);
        free.sort_unstable_by(|a, b| b.cmp(a));
    }

    /// Executes one queued entry inside a worker task.
    ///
    /// Handles size estimation, disk routing, execution, retry scheduling,
    /// and reservation cleanup on every exit path.
    async fn run_item(
        &self,
        identifier: &str,
        retry: u32,
        item_index: usize,
        retry_queue: &Mutex<Vec<QueueEntry>>,
    ) -> Result<(), EngineError> {
        let worker_index = self.take_worker_index();
        let result = self
            .route_and_execute(identifier, retry, item_index, worker_index, retry_queue)
            .await;
        self.return_worker_index(worker_index);
        result
    }

    async fn route_and_execute(
        &self,
        identifier: &str,
        retry: u32,
        item_index: usize,
        worker_index: usize,
        retry_queue: &Mutex<Vec<QueueEntry>>,
    ) -> Result<(), EngineError> {
        let est = self.worker.estimate_size(identifier).await;

        let Some(reservation) = self.disk_pool.route(est) else {
            self.job_log
                .log_skipped(identifier, &self.op, SkipReason::NoDiskSpace)
                .await?;
            let mut event = UiEvent::new(UiEventKind::ItemSkipped, identifier, worker_index);
            event.item_index = Some(item_index);
            event.error = Some(SkipReason::NoDiskSpace.to_string());
            self.emit(event);
            self.counters.skipped.fetch_add(1, Ordering::SeqCst);
            debug!(identifier, "no destination directory has space");
            return Ok(());
        };

        let destdir = reservation.destdir().to_path_buf();
        let outcome = self
            .execute_one(identifier, &destdir, est, retry, item_index, worker_index)
            .await;
        // Release on every exit path; the reservation carries the exact
        // byte count that route() reserved.
        self.disk_pool.release(reservation);

        let succeeded = outcome?;
        if !succeeded {
            let retries_left = i64::from(self.job_retries) - i64::from(retry) - 1;
            if retries_left >= 0 {
                lock_queue(retry_queue).push((identifier.to_string(), retry + 1, item_index));
            }
        }
        Ok(())
    }

    /// Logs, executes, and accounts one attempt. Returns whether the
    /// attempt succeeded.
    async fn execute_one(
        &self,
        identifier: &str,
        destdir: &Path,
        est: Option<u64>,
        retry: u32,
        item_index: usize,
        worker_index: usize,
    ) -> Result<bool, EngineError> {
        self.job_log
            .log_started(
                identifier,
                &self.op,
                destdir,
                est.unwrap_or(0),
                worker_index,
                retry,
            )
            .await?;
        let mut event = UiEvent::new(UiEventKind::ItemStarted, identifier, worker_index);
        event.item_index = Some(item_index);
        event.bytes_total = est;
        self.emit(event);

        let start = Instant::now();
        let result = self.worker.execute(identifier, destdir).await;
        let elapsed = start.elapsed();

        if result.success {
            self.job_log
                .log_completed(
                    identifier,
                    &self.op,
                    destdir,
                    result.bytes_transferred,
                    result.files_ok,
                    result.files_skipped,
                    result.files_failed,
                    elapsed.as_secs_f64(),
                )
                .await?;
            let mut event = UiEvent::new(UiEventKind::ItemCompleted, identifier, worker_index);
            event.item_index = Some(item_index);
            event.bytes_done = Some(result.bytes_transferred);
            event.bytes_total = est;
            event.files_ok = Some(result.files_ok);
            event.elapsed = Some(elapsed);
            self.emit(event);

            self.counters.completed.fetch_add(1, Ordering::SeqCst);
            self.counters
                .total_bytes
                .fetch_add(result.bytes_transferred, Ordering::SeqCst);
            Ok(true)
        } else {
            let error = result
                .error
                .unwrap_or_else(|| "unknown error".to_string());
            if is_no_space_error(&error) {
                self.disk_pool.mark_full(destdir);
            }

            let retries_left = i64::from(self.job_retries) - i64::from(retry) - 1;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            self.job_log
                .log_failed(identifier, &self.op, &error, retries_left.max(0) as u32)
                .await?;
            let mut event = UiEvent::new(UiEventKind::ItemFailed, identifier, worker_index);
            event.item_index = Some(item_index);
            event.error = Some(error.clone());
            event.elapsed = Some(elapsed);
            self.emit(event);

            if retries_left < 0 {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
            }
            warn!(identifier, retry, %error, "item attempt failed");
            Ok(false)
        }
    }

    /// Sends an event to the registered handler, if any. A panicking
    /// handler is contained and logged; it never reaches the user.
    fn emit(&self, event: UiEvent) {
        if let Some(handler) = &self.ui_handler {
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    handler.handle_event(&event);
                }));
            if outcome.is_err() {
                debug!(identifier = %event.identifier, "UI handler panicked");
            }
        }
    }
}

fn lock_queue(queue: &Mutex<Vec<QueueEntry>>) -> std::sync::MutexGuard<'_, Vec<QueueEntry>> {
    match queue.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_indices(indices: &Mutex<Vec<usize>>) -> std::sync::MutexGuard<'_, Vec<usize>> {
    match indices.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
