//! Process-wide synchronization state.
//!
//! One [`HandlerState`] exists per node. The `synchronized` flag is derived
//! from a quorum over peer states on every idle tick; `been_synchronized` is
//! its sticky companion and gates our willingness to serve chain data.
//! Progress counters only ever grow.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

pub struct HandlerState {
    /// Current synchronized-with-network verdict; may fall again
    synchronized: AtomicBool,
    /// Sticky: set once we have ever been synchronized (or forced online)
    been_synchronized: AtomicBool,
    /// Highest chain length any peer ever claimed
    max_height_seen: AtomicU64,
    /// Local chain length when the first synchronization began (set once)
    core_initial_height: AtomicU64,
    /// Local chain length as of the last ingested block
    core_current_height: AtomicU64,
    /// Peers currently in the synchronizing state, cached per idle tick
    synchronizing_connections: AtomicUsize,
    /// Handler shutdown flag, polled inside long ingest loops
    want_stop: AtomicBool,
}

impl HandlerState {
    pub fn new() -> Self {
        Self {
            synchronized: AtomicBool::new(false),
            been_synchronized: AtomicBool::new(false),
            max_height_seen: AtomicU64::new(0),
            core_initial_height: AtomicU64::new(0),
            core_current_height: AtomicU64::new(0),
            synchronizing_connections: AtomicUsize::new(0),
            want_stop: AtomicBool::new(false),
        }
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::Acquire)
    }

    /// Flip `synchronized` low→high; true only for the winning caller
    pub fn raise_synchronized(&self) -> bool {
        self.synchronized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Flip `synchronized` high→low; true only for the winning caller
    pub fn lower_synchronized(&self) -> bool {
        self.synchronized
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn been_synchronized(&self) -> bool {
        self.been_synchronized.load(Ordering::Acquire)
    }

    pub fn mark_been_synchronized(&self) {
        self.been_synchronized.store(true, Ordering::Release);
    }

    pub fn observe_remote_height(&self, height: u64) {
        self.max_height_seen.fetch_max(height, Ordering::AcqRel);
    }

    pub fn max_height_seen(&self) -> u64 {
        self.max_height_seen.load(Ordering::Acquire)
    }

    /// Record the local chain length at the moment synchronization first
    /// starts. Only the first call takes effect.
    pub fn init_core_heights(&self, height: u64) {
        if self
            .core_initial_height
            .compare_exchange(0, height, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.core_current_height.fetch_max(height, Ordering::AcqRel);
        }
    }

    pub fn core_initial_height(&self) -> u64 {
        self.core_initial_height.load(Ordering::Acquire)
    }

    pub fn set_core_current_height(&self, height: u64) {
        self.core_current_height.fetch_max(height, Ordering::AcqRel);
    }

    pub fn core_current_height(&self) -> u64 {
        self.core_current_height.load(Ordering::Acquire)
    }

    pub fn set_synchronizing_connections(&self, count: usize) {
        self.synchronizing_connections
            .store(count, Ordering::Release);
    }

    pub fn synchronizing_connections(&self) -> usize {
        self.synchronizing_connections.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.want_stop.store(true, Ordering::Release);
    }

    pub fn want_stop(&self) -> bool {
        self.want_stop.load(Ordering::Acquire)
    }
}

impl Default for HandlerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Quorum rule for the `synchronized` flag.
///
/// Raises when a strict majority of peers is synced, lowers only when the
/// synced share falls under a third (or no peers remain). The gap between
/// the two thresholds keeps the flag from flapping.
pub fn quorum_verdict(synced: usize, total: usize, currently: bool) -> Option<bool> {
    if !currently && total > 0 && synced > 0 && synced * 2 > total {
        Some(true)
    } else if currently && (total == 0 || synced * 3 < total) {
        Some(false)
    } else {
        None
    }
}
