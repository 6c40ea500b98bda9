//! In-memory blockchain store.
//!
//! Holds the main chain as an ordered list of block ids plus the block and
//! confirmed-transaction bodies behind them. All mutations go through the
//! internal lock; long multi-block ingests additionally open an exclusive
//! batch on the [`CoreGate`](crate::core_gate::CoreGate) so protocol handlers
//! on other connections yield instead of piling up behind the store.
//!
//! Blocks ingested while a batch is open are staged and unwound again if the
//! batch finishes without commit.

use crate::block::genesis::genesis_block;
use crate::block::types::Block;
use crate::constants::chain::SHORT_HISTORY_DENSE_TAIL;
use crate::constants::protocol::MAX_CHAIN_ENTRY_IDS;
use crate::core_gate::CoreGate;
use crate::network::message::BlockEntry;
use crate::network_type::NetworkType;
use crate::types::{short_hash, BlockHash, BlockVerdict, TxHash};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Contiguous run of main-chain ids answering a chain request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEntry {
    pub block_ids: Vec<BlockHash>,
    pub start_height: u64,
    pub total_height: u64,
}

/// Result of a bulk object lookup
#[derive(Debug, Clone, Default)]
pub struct ObjectsBundle {
    pub blocks: Vec<BlockEntry>,
    pub txs: Vec<Vec<u8>>,
    pub missed_ids: Vec<BlockHash>,
    pub current_blockchain_height: u64,
}

struct StagedBlock {
    id: BlockHash,
    tx_hashes: Vec<TxHash>,
}

#[derive(Default)]
struct ChainInner {
    /// Main chain, height index -> block id
    chain: Vec<BlockHash>,
    /// Every known block body, main chain and side chains
    blocks: HashMap<BlockHash, Block>,
    /// Main-chain height index per block id
    heights: HashMap<BlockHash, u64>,
    /// Blobs of transactions confirmed by main-chain blocks
    confirmed_txs: HashMap<TxHash, Vec<u8>>,
    /// Checkpoint heights, ascending
    checkpoints: Vec<(u64, BlockHash)>,
    /// Blocks appended since the open batch began, unwound on abort
    staged: Option<Vec<StagedBlock>>,
}

pub struct Blockchain {
    inner: RwLock<ChainInner>,
    gate: Arc<CoreGate>,
    genesis: BlockHash,
    orphans_seen: AtomicU64,
}

impl Blockchain {
    pub fn new(network: NetworkType) -> Self {
        let genesis = genesis_block(network);
        let genesis_id = genesis.hash();

        let mut inner = ChainInner::default();
        inner.chain.push(genesis_id);
        inner.heights.insert(genesis_id, 0);
        inner.blocks.insert(genesis_id, genesis);

        info!("⛓️ Blockchain initialized, genesis {}", short_hash(&genesis_id));

        Self {
            inner: RwLock::new(inner),
            gate: Arc::new(CoreGate::new()),
            genesis: genesis_id,
            orphans_seen: AtomicU64::new(0),
        }
    }

    pub fn gate(&self) -> Arc<CoreGate> {
        Arc::clone(&self.gate)
    }

    pub fn genesis_id(&self) -> BlockHash {
        self.genesis
    }

    pub fn have_block(&self, id: &BlockHash) -> bool {
        self.inner.read().blocks.contains_key(id)
    }

    /// Chain length (top index + 1)
    pub fn height(&self) -> u64 {
        self.inner.read().chain.len() as u64
    }

    /// Top of the main chain as (height index, block id)
    pub fn top(&self) -> (u64, BlockHash) {
        let inner = self.inner.read();
        let top_index = inner.chain.len() as u64 - 1;
        (top_index, *inner.chain.last().expect("chain holds genesis"))
    }

    pub fn confirmed_tx_count(&self) -> usize {
        self.inner.read().confirmed_txs.len()
    }

    pub fn orphans_seen(&self) -> u64 {
        self.orphans_seen.load(Ordering::Relaxed)
    }

    /// Short chain history: recent ids dense, then exponentially spaced,
    /// genesis always last.
    pub fn short_chain_history(&self) -> Vec<BlockHash> {
        let inner = self.inner.read();
        let mut ids = Vec::new();
        let top_index = inner.chain.len() - 1;

        let mut offset = 0usize;
        let mut step = 1usize;
        loop {
            let index = top_index.saturating_sub(offset);
            ids.push(inner.chain[index]);
            if index == 0 {
                break;
            }
            offset += step;
            if ids.len() >= SHORT_HISTORY_DENSE_TAIL {
                step *= 2;
            }
        }
        // `saturating_sub` collapses the last strides onto index 0, so the
        // genesis id is always the final element exactly once
        ids
    }

    /// Locate the newest id from `request_ids` that lies on our main chain
    /// and return the contiguous run of ids from there towards the tip.
    ///
    /// `request_ids` arrive densest-near-tip, so the first match is the
    /// latest common block. Returns None when no id is known, which a
    /// well-formed request cannot produce (histories end with genesis).
    pub fn find_blockchain_supplement(&self, request_ids: &[BlockHash]) -> Option<ChainEntry> {
        let inner = self.inner.read();
        let start = request_ids
            .iter()
            .find_map(|id| inner.heights.get(id).copied())?;

        let end = (start as usize + MAX_CHAIN_ENTRY_IDS).min(inner.chain.len());
        Some(ChainEntry {
            block_ids: inner.chain[start as usize..end].to_vec(),
            start_height: start,
            total_height: inner.chain.len() as u64,
        })
    }

    /// Gather requested block and transaction blobs. Ids we cannot serve in
    /// full are reported in `missed_ids` rather than silently dropped.
    pub fn get_objects(&self, block_ids: &[BlockHash], tx_ids: &[TxHash]) -> ObjectsBundle {
        let inner = self.inner.read();
        let mut bundle = ObjectsBundle {
            current_blockchain_height: inner.chain.len() as u64,
            ..Default::default()
        };

        'blocks: for id in block_ids {
            let Some(block) = inner.blocks.get(id) else {
                bundle.missed_ids.push(*id);
                continue;
            };
            let mut tx_blobs = Vec::with_capacity(block.tx_hashes.len());
            for tx_id in &block.tx_hashes {
                match inner.confirmed_txs.get(tx_id) {
                    Some(blob) => tx_blobs.push(blob.clone()),
                    None => {
                        // A block without all of its tx bodies is unservable
                        bundle.missed_ids.push(*id);
                        continue 'blocks;
                    }
                }
            }
            bundle.blocks.push(BlockEntry {
                block: block.to_blob(),
                txs: tx_blobs,
            });
        }

        for tx_id in tx_ids {
            match inner.confirmed_txs.get(tx_id) {
                Some(blob) => bundle.txs.push(blob.clone()),
                None => bundle.missed_ids.push(*tx_id),
            }
        }

        bundle
    }

    /// Submit one block body together with the blobs of its transactions.
    ///
    /// Extends the main chain when the parent is our tip; a block with a
    /// known non-tip parent is stored as a side-chain body; an unknown
    /// parent yields the orphan verdict.
    pub fn submit_block(&self, block: Block, tx_blobs: Vec<(TxHash, Vec<u8>)>) -> BlockVerdict {
        if !block.is_well_formed() {
            return BlockVerdict {
                verification_failed: true,
                ..Default::default()
            };
        }

        let id = block.hash();
        let mut inner = self.inner.write();

        if inner.blocks.contains_key(&id) {
            debug!("block {} already known", short_hash(&id));
            return BlockVerdict {
                already_have: true,
                height: inner.chain.len() as u64,
                ..Default::default()
            };
        }

        let top_id = *inner.chain.last().expect("chain holds genesis");

        if block.header.prev_id == top_id {
            let height_index = inner.chain.len() as u64;
            inner.chain.push(id);
            inner.heights.insert(id, height_index);
            for (tx_id, blob) in tx_blobs {
                inner.confirmed_txs.insert(tx_id, blob);
            }
            let tx_hashes = block.tx_hashes.clone();
            inner.blocks.insert(id, block);
            if let Some(staged) = inner.staged.as_mut() {
                staged.push(StagedBlock { id, tx_hashes });
            }
            return BlockVerdict {
                added_to_main_chain: true,
                height: inner.chain.len() as u64,
                ..Default::default()
            };
        }

        if inner.blocks.contains_key(&block.header.prev_id) {
            // Side chain body: remember it, no reorg handling here
            debug!(
                "side-chain block {} on parent {}",
                short_hash(&id),
                short_hash(&block.header.prev_id)
            );
            inner.blocks.insert(id, block);
            return BlockVerdict {
                height: inner.chain.len() as u64,
                ..Default::default()
            };
        }

        self.orphans_seen.fetch_add(1, Ordering::Relaxed);
        BlockVerdict {
            marked_as_orphaned: true,
            height: inner.chain.len() as u64,
            ..Default::default()
        }
    }

    /// Open an exclusive ingest batch: the gate starts refusing admission
    /// and appended blocks are staged for possible unwind.
    pub async fn start_batch(&self) {
        self.gate.begin_exclusive().await;
        let mut inner = self.inner.write();
        if inner.staged.is_some() {
            warn!("batch already staged, keeping existing staging list");
        } else {
            inner.staged = Some(Vec::new());
        }
    }

    /// Close the batch. Without commit every staged block is unwound in
    /// reverse order and its transactions are dropped from the store.
    pub fn finish_batch(&self, commit: bool) {
        {
            let mut inner = self.inner.write();
            match inner.staged.take() {
                Some(staged) if !commit => {
                    for entry in staged.iter().rev() {
                        inner.chain.pop();
                        inner.heights.remove(&entry.id);
                        inner.blocks.remove(&entry.id);
                        for tx_id in &entry.tx_hashes {
                            inner.confirmed_txs.remove(tx_id);
                        }
                    }
                    warn!("batch aborted, {} block(s) unwound", staged.len());
                }
                Some(staged) => {
                    debug!("batch committed, {} block(s) kept", staged.len());
                }
                None => warn!("finish_batch called with no open batch"),
            }
        }
        self.gate.finish_exclusive();
    }

    pub fn add_checkpoint(&self, height: u64, id: BlockHash) {
        let mut inner = self.inner.write();
        inner.checkpoints.push((height, id));
        inner.checkpoints.sort_by_key(|(h, _)| *h);
    }

    /// Height of our newest checkpoint, 0 when none are configured
    pub fn top_checkpoint_height(&self) -> u64 {
        self.inner
            .read()
            .checkpoints
            .last()
            .map(|(h, _)| *h)
            .unwrap_or(0)
    }

    /// Periodic maintenance hook driven by the handler's idle tick
    pub fn on_idle(&self) {
        let inner = self.inner.read();
        debug!(
            "chain maintenance: height {}, {} confirmed txs",
            inner.chain.len(),
            inner.confirmed_txs.len()
        );
    }
}
