//! Node core: the capability surface the protocol handler drives.
//!
//! The handler never names a concrete store; it is constructed over
//! `Arc<dyn ChainCore>` and tests inject mocks. [`NodeCore`] is the
//! production implementation bundling the blockchain store, the transaction
//! pool and the miner.

use crate::block::types::Block;
use crate::blockchain::{Blockchain, ChainEntry, ObjectsBundle};
use crate::core_gate::CoreGate;
use crate::mining::Miner;
use crate::transaction_pool::TransactionPool;
use crate::types::{short_hash, BlockHash, BlockVerdict, CoreStats, TxHash, TxVerdict};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[async_trait]
pub trait ChainCore: Send + Sync {
    /// Admission gate for store calls; see [`CoreGate`]
    fn gate(&self) -> Arc<CoreGate>;

    fn genesis_id(&self) -> BlockHash;
    fn have_block(&self, id: &BlockHash) -> bool;
    /// (top height index, top block id)
    fn blockchain_top(&self) -> (u64, BlockHash);
    /// Chain length (top index + 1)
    fn blockchain_height(&self) -> u64;
    fn short_chain_history(&self) -> Vec<BlockHash>;
    fn find_blockchain_supplement(&self, request_ids: &[BlockHash]) -> Option<ChainEntry>;
    fn get_objects(&self, block_ids: &[BlockHash], tx_ids: &[TxHash]) -> ObjectsBundle;

    fn handle_incoming_tx(&self, blob: &[u8], keep_in_mempool: bool) -> TxVerdict;
    fn handle_incoming_block(&self, blob: &[u8]) -> BlockVerdict;

    fn pause_mine(&self);
    fn resume_mine(&self);
    async fn lock_tx_pool(&self);
    fn unlock_tx_pool(&self);
    async fn start_batch(&self);
    fn finish_batch(&self, commit: bool);

    fn top_checkpoint_height(&self) -> u64;

    /// Periodic maintenance tick forwarded by the handler
    fn on_idle(&self);
    /// One-shot notification that the node reached the network tip
    fn on_synchronized(&self);
    fn stat_info(&self) -> CoreStats;
}

pub struct NodeCore {
    chain: Arc<Blockchain>,
    pool: Arc<TransactionPool>,
    miner: Arc<Miner>,
}

impl NodeCore {
    pub fn new(chain: Arc<Blockchain>, pool: Arc<TransactionPool>, miner: Arc<Miner>) -> Self {
        Self { chain, pool, miner }
    }

    pub fn chain(&self) -> &Arc<Blockchain> {
        &self.chain
    }

    pub fn pool(&self) -> &Arc<TransactionPool> {
        &self.pool
    }
}

#[async_trait]
impl ChainCore for NodeCore {
    fn gate(&self) -> Arc<CoreGate> {
        self.chain.gate()
    }

    fn genesis_id(&self) -> BlockHash {
        self.chain.genesis_id()
    }

    fn have_block(&self, id: &BlockHash) -> bool {
        self.chain.have_block(id)
    }

    fn blockchain_top(&self) -> (u64, BlockHash) {
        self.chain.top()
    }

    fn blockchain_height(&self) -> u64 {
        self.chain.height()
    }

    fn short_chain_history(&self) -> Vec<BlockHash> {
        self.chain.short_chain_history()
    }

    fn find_blockchain_supplement(&self, request_ids: &[BlockHash]) -> Option<ChainEntry> {
        self.chain.find_blockchain_supplement(request_ids)
    }

    fn get_objects(&self, block_ids: &[BlockHash], tx_ids: &[TxHash]) -> ObjectsBundle {
        self.chain.get_objects(block_ids, tx_ids)
    }

    fn handle_incoming_tx(&self, blob: &[u8], keep_in_mempool: bool) -> TxVerdict {
        self.pool.handle_incoming(blob, keep_in_mempool)
    }

    /// Parse the block body, pull the blobs of its transactions out of the
    /// pool and hand everything to the store. Confirmed transactions leave
    /// the pool only once the store accepted the block.
    fn handle_incoming_block(&self, blob: &[u8]) -> BlockVerdict {
        let block = match Block::from_blob(blob) {
            Ok(block) => block,
            Err(e) => {
                warn!("undecodable block body: {}", e);
                return BlockVerdict {
                    verification_failed: true,
                    ..Default::default()
                };
            }
        };

        let id = block.hash();
        let mut tx_blobs = Vec::with_capacity(block.tx_hashes.len());
        for tx_id in &block.tx_hashes {
            match self.pool.get_blob(tx_id) {
                Some(tx_blob) => tx_blobs.push((*tx_id, tx_blob)),
                None => {
                    // Every confirmed tx must have passed through the pool
                    warn!(
                        "block {} references unknown tx {}",
                        short_hash(&id),
                        short_hash(tx_id)
                    );
                    return BlockVerdict {
                        verification_failed: true,
                        ..Default::default()
                    };
                }
            }
        }

        let verdict = self.chain.submit_block(block.clone(), tx_blobs);
        if verdict.added_to_main_chain {
            for tx_id in &block.tx_hashes {
                self.pool.remove(tx_id);
            }
            debug!(
                "block {} extends main chain, height {}",
                short_hash(&id),
                verdict.height
            );
        }
        verdict
    }

    fn pause_mine(&self) {
        self.miner.pause();
    }

    fn resume_mine(&self) {
        self.miner.resume();
    }

    async fn lock_tx_pool(&self) {
        self.pool.lock().await;
    }

    fn unlock_tx_pool(&self) {
        self.pool.unlock();
    }

    async fn start_batch(&self) {
        self.chain.start_batch().await;
    }

    fn finish_batch(&self, commit: bool) {
        self.chain.finish_batch(commit);
    }

    fn top_checkpoint_height(&self) -> u64 {
        self.chain.top_checkpoint_height()
    }

    fn on_idle(&self) {
        self.chain.on_idle();
        let evicted = self.pool.evict_expired();
        if evicted > 0 {
            debug!("evicted {} expired pool transaction(s)", evicted);
        }
    }

    fn on_synchronized(&self) {
        info!("core notified: node is synchronized with the network");
    }

    fn stat_info(&self) -> CoreStats {
        CoreStats {
            blockchain_height: self.chain.height(),
            tx_pool_size: self.pool.len(),
            orphans_seen: self.chain.orphans_seen(),
        }
    }
}
