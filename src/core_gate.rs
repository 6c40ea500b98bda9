//! Admission gate for blockchain store calls.
//!
//! The store periodically runs long exclusive batch operations (sync ingest,
//! reorg commits, pruning). Protocol handlers must never block behind one of
//! those, so every store call first asks the gate for admission:
//! `try_enter` hands out a guard while no exclusive batch is active and
//! returns `None` otherwise, letting the caller fall back to its per-site
//! stall policy. The gate is advisory only; serializability of store
//! mutations comes from the store's internal locks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

pub struct CoreGate {
    /// Raised for the duration of an exclusive batch
    exclusive: AtomicBool,
    /// Gated calls currently in flight (stats only)
    active_calls: AtomicUsize,
    /// Serializes exclusive batches against each other
    batch: Arc<Mutex<()>>,
    /// Guard of the currently open batch, parked here between begin and finish
    held: parking_lot::Mutex<Option<OwnedMutexGuard<()>>>,
}

impl CoreGate {
    pub fn new() -> Self {
        Self {
            exclusive: AtomicBool::new(false),
            active_calls: AtomicUsize::new(0),
            batch: Arc::new(Mutex::new(())),
            held: parking_lot::Mutex::new(None),
        }
    }

    /// Request admission for one gated store call.
    ///
    /// Returns `None` while an exclusive batch is in progress; the caller
    /// must then yield instead of waiting.
    pub fn try_enter(self: &Arc<Self>) -> Option<GateGuard> {
        if self.exclusive.load(Ordering::Acquire) {
            return None;
        }
        self.active_calls.fetch_add(1, Ordering::Relaxed);
        Some(GateGuard {
            gate: Arc::clone(self),
        })
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive.load(Ordering::Acquire)
    }

    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::Relaxed)
    }

    /// Open an exclusive batch. Waits for a previously opened batch to
    /// finish; gated calls admitted before the flag flips are not waited on.
    pub async fn begin_exclusive(&self) {
        let guard = Arc::clone(&self.batch).lock_owned().await;
        *self.held.lock() = Some(guard);
        self.exclusive.store(true, Ordering::Release);
    }

    /// Close the exclusive batch opened by `begin_exclusive`.
    pub fn finish_exclusive(&self) {
        let released = self.held.lock().take();
        if released.is_none() {
            warn!("finish_exclusive called with no open batch");
        }
        self.exclusive.store(false, Ordering::Release);
    }
}

impl Default for CoreGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Admission token for one gated store call
pub struct GateGuard {
    gate: Arc<CoreGate>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.gate.active_calls.fetch_sub(1, Ordering::Relaxed);
    }
}
