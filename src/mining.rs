//! Mining pause/resume coordination.
//!
//! Block ingest and gossip application pause local block production so a
//! template is never built against a tip that is about to move. Pauses nest:
//! production resumes only when every pause has been matched by a resume.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

pub struct Miner {
    pause_depth: AtomicUsize,
}

impl Miner {
    pub fn new() -> Self {
        Self {
            pause_depth: AtomicUsize::new(0),
        }
    }

    pub fn pause(&self) {
        let depth = self.pause_depth.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("mining paused (depth {})", depth);
    }

    pub fn resume(&self) {
        let previous = self.pause_depth.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            warn!("resume without matching pause");
            self.pause_depth.store(0, Ordering::Release);
        } else if previous == 1 {
            debug!("mining resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause_depth.load(Ordering::Acquire) > 0
    }
}

impl Default for Miner {
    fn default() -> Self {
        Self::new()
    }
}
