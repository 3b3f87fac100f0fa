//! Disk space monitoring and routing for bulk operations.
//!
//! The [`DiskPool`] watches free space across an ordered list of destination
//! directories and routes each item to the first directory that can hold it.
//! Routing *reserves* the estimated bytes so concurrent workers cannot
//! over-commit a disk; the reservation is returned as a [`Reservation`] and
//! must be handed back via [`DiskPool::release`] once the item finishes,
//! whatever the outcome.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

/// A reservation of estimated bytes against one destination directory.
///
/// Returned by [`DiskPool::route`] and consumed by [`DiskPool::release`],
/// which guarantees the released byte count always equals the reserved one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    destdir: PathBuf,
    bytes: u64,
}

impl Reservation {
    /// The directory this reservation was routed to.
    #[must_use]
    pub fn destdir(&self) -> &Path {
        &self.destdir
    }

    /// The byte count held by this reservation.
    ///
    /// When the size estimate was unknown this is the conservative
    /// substitute (two disk margins), not zero.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// Mutable pool state, all guarded by one lock.
#[derive(Debug, Default)]
struct PoolState {
    /// Total reserved bytes per directory.
    reserved: HashMap<PathBuf, u64>,
    /// Number of in-flight items per directory.
    in_flight: HashMap<PathBuf, usize>,
    /// Directories marked full (removed from routing).
    full: HashSet<PathBuf>,
}

/// Routes work to destination directories with sufficient free space.
///
/// Directories are tried in configured order and the first one whose
/// available space covers the estimate wins; the choice is deterministic.
/// Available space is the OS-reported free space minus the safety margin
/// and any outstanding reservations.
#[derive(Debug)]
pub struct DiskPool {
    destdirs: Vec<PathBuf>,
    margin: u64,
    disabled: bool,
    state: Mutex<PoolState>,
}

impl DiskPool {
    /// Creates a pool over `destdirs` with a per-disk safety `margin`.
    ///
    /// When `disabled` is true all space checks are bypassed and
    /// [`route`](Self::route) always returns the first directory.
    #[must_use]
    pub fn new(destdirs: Vec<PathBuf>, margin: u64, disabled: bool) -> Self {
        Self {
            destdirs,
            margin,
            disabled,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// The configured per-disk safety margin in bytes.
    #[must_use]
    pub fn margin(&self) -> u64 {
        self.margin
    }

    /// Finds a directory with enough space and reserves the estimate.
    ///
    /// If `est_bytes` is `None`, `2 * margin` is reserved as a conservative
    /// substitute. Returns `None` when no directory qualifies; directories
    /// previously marked full are skipped.
    pub fn route(&self, est_bytes: Option<u64>) -> Option<Reservation> {
        if self.disabled {
            return self.destdirs.first().map(|d| Reservation {
                destdir: d.clone(),
                bytes: 0,
            });
        }

        let size = est_bytes.unwrap_or(2 * self.margin);

        let mut state = self.lock_state();
        for dir in &self.destdirs {
            if state.full.contains(dir) {
                continue;
            }
            if self.available_locked(&state, dir) >= size {
                *state.reserved.entry(dir.clone()).or_insert(0) += size;
                *state.in_flight.entry(dir.clone()).or_insert(0) += 1;
                debug!(
                    destdir = %dir.display(),
                    est_bytes = size,
                    reserved = state.reserved[dir],
                    "routed item"
                );
                return Some(Reservation {
                    destdir: dir.clone(),
                    bytes: size,
                });
            }
        }
        None
    }

    /// Returns usable free bytes on `destdir`.
    ///
    /// This is the filesystem free space minus the safety margin and any
    /// outstanding reservations, clamped at zero.
    pub fn available(&self, destdir: &Path) -> u64 {
        let state = self.lock_state();
        self.available_locked(&state, destdir)
    }

    /// Releases a reservation after a worker completes.
    pub fn release(&self, reservation: Reservation) {
        let mut state = self.lock_state();
        let reserved = state.reserved.entry(reservation.destdir.clone()).or_insert(0);
        *reserved = reserved.saturating_sub(reservation.bytes);
        let in_flight = state.in_flight.entry(reservation.destdir).or_insert(0);
        *in_flight = in_flight.saturating_sub(1);
    }

    /// Removes `destdir` from future routing (e.g. after `ENOSPC`).
    pub fn mark_full(&self, destdir: &Path) {
        warn!(destdir = %destdir.display(), "marking destination directory full");
        self.lock_state().full.insert(destdir.to_path_buf());
    }

    /// Returns the number of items currently in-flight to `destdir`.
    pub fn in_flight_count(&self, destdir: &Path) -> usize {
        self.lock_state()
            .in_flight
            .get(destdir)
            .copied()
            .unwrap_or(0)
    }

    fn available_locked(&self, state: &PoolState, destdir: &Path) -> u64 {
        let free = match fs2::available_space(destdir) {
            Ok(free) => free,
            Err(e) => {
                warn!(destdir = %destdir.display(), error = %e, "free-space query failed");
                return 0;
            }
        };
        let reserved = state.reserved.get(destdir).copied().unwrap_or(0);
        free.saturating_sub(self.margin).saturating_sub(reserved)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        // A poisoned lock means a panic while holding it; the accounting
        // state is still structurally valid, so keep going.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Returns true when a worker error message indicates an out-of-space
/// write failure, in which case the destination should be marked full.
#[must_use]
pub fn is_no_space_error(error: &str) -> bool {
    error.contains("No space left on device") || error.contains("os error 28")
}
