//! Transaction mempool management
//!
//! Pending transactions live here between arrival from the network and
//! confirmation by a block. During multi-block ingest the pool is held
//! locked so no concurrent admission interleaves with confirmation.

#![allow(dead_code)]

use crate::types::{Transaction, TxHash, TxVerdict};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Pending transactions older than this are evicted on maintenance ticks
const POOL_ENTRY_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
struct PoolEntry {
    blob: Vec<u8>,
    added_at: Instant,
}

pub struct TransactionPool {
    /// Pending transactions keyed by txid (lock-free concurrent access)
    pending: DashMap<TxHash, PoolEntry>,
    /// Serializes block ingest against transaction admission
    ingest_gate: Arc<Mutex<()>>,
    /// Guard parked between lock() and unlock()
    held: parking_lot::Mutex<Option<OwnedMutexGuard<()>>>,
}

impl TransactionPool {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            ingest_gate: Arc::new(Mutex::new(())),
            held: parking_lot::Mutex::new(None),
        }
    }

    /// Validate one raw transaction blob and admit it to the pool.
    ///
    /// With `keep_in_mempool` false the transaction is only validated and
    /// classified for relay, not stored (used for gossip we merely forward).
    pub fn handle_incoming(&self, blob: &[u8], keep_in_mempool: bool) -> TxVerdict {
        let tx = match Transaction::from_blob(blob) {
            Ok(tx) => tx,
            Err(e) => {
                debug!("rejecting undecodable transaction: {}", e);
                return TxVerdict {
                    verification_failed: true,
                    ..Default::default()
                };
            }
        };

        if tx.outputs.is_empty() {
            debug!("rejecting transaction without outputs");
            return TxVerdict {
                verification_failed: true,
                ..Default::default()
            };
        }

        let txid = tx.txid();
        if self.pending.contains_key(&txid) {
            // Known already: valid, but not worth announcing again
            return TxVerdict::default();
        }

        let added = if keep_in_mempool {
            self.pending
                .insert(
                    txid,
                    PoolEntry {
                        blob: blob.to_vec(),
                        added_at: Instant::now(),
                    },
                )
                .is_none()
        } else {
            false
        };

        TxVerdict {
            verification_failed: false,
            should_be_relayed: true,
            added_to_pool: added,
        }
    }

    pub fn contains(&self, txid: &TxHash) -> bool {
        self.pending.contains_key(txid)
    }

    pub fn get_blob(&self, txid: &TxHash) -> Option<Vec<u8>> {
        self.pending.get(txid).map(|e| e.blob.clone())
    }

    /// Remove a confirmed transaction, returning its blob
    pub fn remove(&self, txid: &TxHash) -> Option<Vec<u8>> {
        self.pending.remove(txid).map(|(_, e)| e.blob)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Hold the pool for the duration of a block ingest
    pub async fn lock(&self) {
        let guard = Arc::clone(&self.ingest_gate).lock_owned().await;
        *self.held.lock() = Some(guard);
    }

    /// Release the ingest hold taken by [`lock`](Self::lock)
    pub fn unlock(&self) {
        if self.held.lock().take().is_none() {
            debug!("unlock called with no ingest hold");
        }
    }

    /// Evict stale entries; driven by the core maintenance tick
    pub fn evict_expired(&self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, e| e.added_at.elapsed() < POOL_ENTRY_TTL);
        before - self.pending.len()
    }
}

impl Default for TransactionPool {
    fn default() -> Self {
        Self::new()
    }
}
