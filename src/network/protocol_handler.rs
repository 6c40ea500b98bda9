//! Block-propagation and chain-synchronization protocol handler.
//!
//! One handler exists per node. The transport hands it every inbound
//! protocol event together with that peer's [`ConnectionContext`]; the
//! handler walks each connection through handshake → synchronizing →
//! idle/normal, requests missing blocks in bounded batches, ingests them
//! through the core, and gossips fresh blocks and transactions onward.
//!
//! Every store access runs behind the core gate: when the store is inside an
//! exclusive batch the handler yields (genesis stub replies or parking the
//! peer in the idle state) instead of blocking. All failures are local to
//! the offending connection: an `Err` from any handler means "drop this
//! peer", never "abort the process".

use crate::constants::chain::TARGET_BLOCK_SPACING_SECS;
use crate::constants::protocol::{
    BLOCKS_SYNC_BATCH_COUNT, MAX_BLOCKS_REQUEST_COUNT, MAX_TXS_REQUEST_COUNT,
};
use crate::core::ChainCore;
use crate::network::connection_context::{ConnectionContext, SyncState};
use crate::network::handshake::SyncData;
use crate::network::message::{BlockEntry, ProtocolMessage};
use crate::network::sync_state::{quorum_verdict, HandlerState};
use crate::network::transport::{NullEndpoint, P2pEndpoint};
use crate::types::{short_hash, BlockHash, CoreStats, TxHash};
use crate::block::types::Block;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Why a connection must be dropped. Returned to the transport, which owns
/// the actual close; the handler has already recorded any IP failure.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("protocol violation: {0}")]
    Violation(String),

    #[error(
        "remote checkpoint zone reaches height {remote} but ours ends at {local}: \
         this software is outdated, please update it"
    )]
    OutdatedSoftware { remote: u64, local: u64 },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("shutting down")]
    Shutdown,
}

/// Scoped resources held for the duration of a multi-block ingest: mining
/// paused, tx pool locked, store batch open. Released on every exit path;
/// the batch commits only if [`commit`](Self::commit) was called first.
struct IngestScope<'a> {
    core: &'a Arc<dyn ChainCore>,
    commit: bool,
}

impl<'a> IngestScope<'a> {
    async fn begin(core: &'a Arc<dyn ChainCore>) -> IngestScope<'a> {
        core.pause_mine();
        core.lock_tx_pool().await;
        core.start_batch().await;
        Self {
            core,
            commit: false,
        }
    }

    fn commit(&mut self) {
        self.commit = true;
    }
}

impl Drop for IngestScope<'_> {
    fn drop(&mut self) {
        self.core.resume_mine();
        self.core.finish_batch(self.commit);
        self.core.unlock_tx_pool();
    }
}

pub struct ProtocolHandler {
    core: Arc<dyn ChainCore>,
    p2p: parking_lot::RwLock<Arc<dyn P2pEndpoint>>,
    state: HandlerState,
}

impl ProtocolHandler {
    pub fn new(core: Arc<dyn ChainCore>) -> Self {
        Self {
            core,
            p2p: parking_lot::RwLock::new(Arc::new(NullEndpoint)),
            state: HandlerState::new(),
        }
    }

    /// Attach (or detach, with None) the transport
    pub fn set_p2p_endpoint(&self, endpoint: Option<Arc<dyn P2pEndpoint>>) {
        *self.p2p.write() = endpoint.unwrap_or_else(|| Arc::new(NullEndpoint));
    }

    fn p2p(&self) -> Arc<dyn P2pEndpoint> {
        Arc::clone(&self.p2p.read())
    }

    pub fn state(&self) -> &HandlerState {
        &self.state
    }

    pub fn init(&self, explicit_set_online: bool) {
        if explicit_set_online {
            self.state.mark_been_synchronized();
            info!("node explicitly set online, serving chain requests from the start");
        }
    }

    pub fn deinit(&self) {
        self.state.request_stop();
    }

    fn client_version() -> String {
        format!(
            "{}-{}",
            env!("CARGO_PKG_VERSION"),
            option_env!("GIT_HASH").unwrap_or("unknown")
        )
    }

    fn is_stopping(&self) -> bool {
        self.state.want_stop() || self.p2p().is_stop_signal_sent()
    }

    // ---- dispatch ---------------------------------------------------------

    /// Route one inbound message to its handler. `Err` means the transport
    /// must drop the connection.
    pub async fn handle_message(
        &self,
        msg: ProtocolMessage,
        ctx: &mut ConnectionContext,
    ) -> Result<(), ProtocolError> {
        match msg {
            ProtocolMessage::Handshake { data, .. } => {
                self.process_payload_sync_data(&data, ctx, false)
            }
            ProtocolMessage::NotifyNewBlock { block_entry, hop } => {
                self.handle_notify_new_block(block_entry, hop, ctx)
            }
            ProtocolMessage::NotifyNewTransactions { txs } => {
                self.handle_notify_new_transactions(txs, ctx)
            }
            ProtocolMessage::RequestChain { block_ids } => {
                self.handle_request_chain(&block_ids, ctx)
            }
            ProtocolMessage::ResponseChainEntry {
                block_ids,
                start_height,
                total_height,
            } => self.handle_response_chain_entry(block_ids, start_height, total_height, ctx),
            ProtocolMessage::RequestGetObjects { blocks, txs } => {
                self.handle_request_get_objects(blocks, txs, ctx)
            }
            ProtocolMessage::ResponseGetObjects {
                blocks,
                txs,
                missed_ids,
                current_blockchain_height,
            } => {
                self.handle_response_get_objects(
                    blocks,
                    txs,
                    missed_ids,
                    current_blockchain_height,
                    ctx,
                )
                .await
            }
        }
    }

    // ---- handshake --------------------------------------------------------

    /// Build the sync-data payload describing our tip. While the store is
    /// busy we claim a bare genesis chain so no peer tries to sync from us.
    pub fn get_payload_sync_data(&self) -> SyncData {
        let gate = self.core.gate();
        let last_checkpoint_height = self.core.top_checkpoint_height();

        if let Some(_guard) = gate.try_enter() {
            let (top_index, top_id) = self.core.blockchain_top();
            SyncData {
                client_version: Self::client_version(),
                current_height: top_index + 1,
                top_id,
                last_checkpoint_height,
            }
        } else {
            debug!("store busy during sync-data build, claiming genesis");
            SyncData {
                client_version: Self::client_version(),
                current_height: 1,
                top_id: self.core.genesis_id(),
                last_checkpoint_height,
            }
        }
    }

    /// Process a peer's sync data. `is_initial` marks the exchange performed
    /// right after connect; re-exchanges (idle resync) arrive with false.
    pub fn process_payload_sync_data(
        &self,
        hshd: &SyncData,
        ctx: &mut ConnectionContext,
        is_initial: bool,
    ) -> Result<(), ProtocolError> {
        ctx.remote_version = hshd.client_version.clone();
        ctx.remote_blockchain_height = hshd.current_height;

        if ctx.state == SyncState::BeforeHandshake && !is_initial {
            debug!("[{}] duplicate sync data before handshake, ignored", ctx.peer_id);
            return Ok(());
        }
        if ctx.state == SyncState::Synchronizing {
            debug!("[{}] sync data while synchronizing, ignored", ctx.peer_id);
            return Ok(());
        }

        // While we bootstrap, outbound slots are reserved for peers that can
        // actually feed us blocks
        if !self.state.been_synchronized()
            && !ctx.is_income
            && hshd.current_height == 1
            && is_initial
        {
            info!("[{}] rejecting busy node with an empty chain", ctx.peer_id);
            return Err(ProtocolError::Violation(
                "outbound peer has nothing to serve while we bootstrap".to_string(),
            ));
        }

        let gate = self.core.gate();
        let Some(_guard) = gate.try_enter() else {
            info!(
                "[{}] store busy during sync-data processing, connection parked idle",
                ctx.peer_id
            );
            ctx.state = SyncState::Idle;
            return Ok(());
        };

        if self.core.have_block(&hshd.top_id) {
            debug!(
                "[{}] remote top {} already known, connection normal",
                ctx.peer_id,
                short_hash(&hshd.top_id)
            );
            ctx.state = SyncState::Normal;
            return Ok(());
        }

        let local_height = self.core.blockchain_height();
        let diff = hshd.current_height as i64 - local_height as i64;
        let days = diff.abs() / (24 * 60 * 60 / TARGET_BLOCK_SPACING_SECS);
        info!(
            "[{}] unknown remote top {}: {} -> {} [{} blocks ({} days) {}], synchronization started",
            ctx.peer_id,
            short_hash(&hshd.top_id),
            local_height,
            hshd.current_height,
            diff.abs(),
            days,
            if diff >= 0 { "behind" } else { "ahead" },
        );

        // A peer whose checkpoint zone reaches past everything we know about
        // can only be running newer software
        let local_checkpoint = self.core.top_checkpoint_height();
        if hshd.last_checkpoint_height > 0 && local_checkpoint < hshd.last_checkpoint_height {
            if local_height < hshd.last_checkpoint_height {
                error!(
                    "[{}] remote checkpoint zone ({}) is longer than ours ({}) and our chain \
                     lies under it: this software is outdated, please update it. Disconnecting.",
                    ctx.peer_id, hshd.last_checkpoint_height, local_checkpoint
                );
                return Err(ProtocolError::OutdatedSoftware {
                    remote: hshd.last_checkpoint_height,
                    local: local_checkpoint,
                });
            }
            warn!(
                "[{}] remote checkpoint zone ({}) is longer than ours ({}): \
                 this software may be outdated, please update it",
                ctx.peer_id, hshd.last_checkpoint_height, local_checkpoint
            );
        }

        ctx.state = SyncState::Synchronizing;
        debug!("[{}] requesting callback", ctx.peer_id);
        ctx.callback_request_count += 1;
        self.p2p().request_callback(ctx.peer_id);

        self.state.observe_remote_height(hshd.current_height);
        self.state.init_core_heights(local_height);
        Ok(())
    }

    /// Fired by the transport once our handshake reply has been flushed;
    /// kicks off the chain download for a synchronizing peer.
    pub fn on_callback(&self, ctx: &mut ConnectionContext) -> Result<(), ProtocolError> {
        debug!("[{}] callback fired", ctx.peer_id);
        if ctx.callback_request_count == 0 {
            return Err(ProtocolError::Internal(
                "callback fired with no outstanding request".to_string(),
            ));
        }
        ctx.callback_request_count -= 1;

        if ctx.state == SyncState::Synchronizing {
            let gate = self.core.gate();
            match gate.try_enter() {
                Some(_guard) => {
                    let block_ids = self.core.short_chain_history();
                    debug!(
                        "[{}] -->> RequestChain: {} history ids",
                        ctx.peer_id,
                        block_ids.len()
                    );
                    self.p2p()
                        .post_notify(ctx.peer_id, ProtocolMessage::RequestChain { block_ids });
                }
                None => {
                    info!(
                        "[{}] store busy during callback, connection parked idle",
                        ctx.peer_id
                    );
                    ctx.state = SyncState::Idle;
                }
            }
        }
        Ok(())
    }

    // ---- chain discovery --------------------------------------------------

    pub fn handle_request_chain(
        &self,
        block_ids: &[BlockHash],
        ctx: &mut ConnectionContext,
    ) -> Result<(), ProtocolError> {
        debug!(
            "[{}] <<-- RequestChain: {} history ids",
            ctx.peer_id,
            block_ids.len()
        );

        // Until we have ever reached the network tip, answer with a bare
        // genesis chain so still-syncing nodes do not feed off each other
        if !self.state.been_synchronized() {
            info!(
                "[{}] chain request while never synchronized, answered with genesis stub",
                ctx.peer_id
            );
            self.post_genesis_stub(ctx);
            return Ok(());
        }

        let gate = self.core.gate();
        match gate.try_enter() {
            Some(_guard) => match self.core.find_blockchain_supplement(block_ids) {
                Some(entry) => {
                    debug!(
                        "[{}] -->> ResponseChainEntry: start {}, total {}, {} ids",
                        ctx.peer_id,
                        entry.start_height,
                        entry.total_height,
                        entry.block_ids.len()
                    );
                    self.p2p().post_notify(
                        ctx.peer_id,
                        ProtocolMessage::ResponseChainEntry {
                            block_ids: entry.block_ids,
                            start_height: entry.start_height,
                            total_height: entry.total_height,
                        },
                    );
                }
                None => {
                    // Histories end with genesis, so an unmatched request
                    // means the peer runs a different network
                    error!(
                        "[{}] chain request shares no block with our chain",
                        ctx.peer_id
                    );
                }
            },
            None => {
                info!(
                    "[{}] store busy during chain request, answered with genesis stub",
                    ctx.peer_id
                );
                self.post_genesis_stub(ctx);
            }
        }
        Ok(())
    }

    fn post_genesis_stub(&self, ctx: &ConnectionContext) {
        self.p2p().post_notify(
            ctx.peer_id,
            ProtocolMessage::ResponseChainEntry {
                block_ids: vec![self.core.genesis_id()],
                start_height: 0,
                total_height: 1,
            },
        );
    }

    pub fn handle_response_chain_entry(
        &self,
        block_ids: Vec<BlockHash>,
        start_height: u64,
        total_height: u64,
        ctx: &mut ConnectionContext,
    ) -> Result<(), ProtocolError> {
        debug!(
            "[{}] <<-- ResponseChainEntry: {} ids, start {}, total {}",
            ctx.peer_id,
            block_ids.len(),
            start_height,
            total_height
        );

        if block_ids.is_empty() {
            self.p2p().add_ip_fail(ctx.remote_addr.ip());
            return Err(ProtocolError::Violation(
                "empty chain entry".to_string(),
            ));
        }

        let gate = self.core.gate();
        let Some(_guard) = gate.try_enter() else {
            info!(
                "[{}] store busy during chain entry, connection parked idle",
                ctx.peer_id
            );
            ctx.state = SyncState::Idle;
            return Ok(());
        };

        if !self.core.have_block(&block_ids[0]) {
            self.p2p().add_ip_fail(ctx.remote_addr.ip());
            return Err(ProtocolError::Violation(format!(
                "chain entry starts from unknown id {}",
                short_hash(&block_ids[0])
            )));
        }

        ctx.remote_blockchain_height = total_height;
        ctx.last_response_height = start_height + block_ids.len() as u64 - 1;
        if ctx.last_response_height > ctx.remote_blockchain_height {
            return Err(ProtocolError::Violation(format!(
                "chain entry exceeds claimed total: start {} + {} ids > total {}",
                start_height,
                block_ids.len(),
                total_height
            )));
        }

        for id in &block_ids {
            if self.is_stopping() {
                return Err(ProtocolError::Shutdown);
            }
            if !self.core.have_block(id) {
                ctx.needed_objects.push_back(*id);
            }
        }

        self.request_missing_objects(ctx, false)
    }

    // ---- object fetch -----------------------------------------------------

    /// Drive the fetch pipeline forward for one peer: request the next batch
    /// of bodies, ask for more chain ids, or conclude synchronization.
    ///
    /// `check_having` is false right after a chain entry (the announced list
    /// is trusted) and true after an objects response, when time has passed
    /// and a concurrent peer may already have delivered some of the blocks.
    pub fn request_missing_objects(
        &self,
        ctx: &mut ConnectionContext,
        check_having: bool,
    ) -> Result<(), ProtocolError> {
        if !ctx.needed_objects.is_empty() {
            let mut blocks = Vec::new();
            while let Some(id) = ctx.needed_objects.pop_front() {
                if blocks.len() >= BLOCKS_SYNC_BATCH_COUNT {
                    ctx.needed_objects.push_front(id);
                    break;
                }
                if check_having && self.core.have_block(&id) {
                    continue;
                }
                ctx.requested_objects.insert(id);
                blocks.push(id);
            }
            debug!(
                "[{}] -->> RequestGetObjects: {} blocks",
                ctx.peer_id,
                blocks.len()
            );
            self.p2p().post_notify(
                ctx.peer_id,
                ProtocolMessage::RequestGetObjects {
                    blocks,
                    txs: Vec::new(),
                },
            );
        } else if ctx.last_response_height < ctx.remote_blockchain_height.saturating_sub(1) {
            // The peer's chain continues past the last entry: fetch more ids
            let gate = self.core.gate();
            match gate.try_enter() {
                Some(_guard) => {
                    let block_ids = self.core.short_chain_history();
                    debug!(
                        "[{}] -->> RequestChain: {} history ids",
                        ctx.peer_id,
                        block_ids.len()
                    );
                    self.p2p()
                        .post_notify(ctx.peer_id, ProtocolMessage::RequestChain { block_ids });
                }
                None => {
                    info!(
                        "[{}] store busy while continuing sync, connection parked idle",
                        ctx.peer_id
                    );
                    ctx.state = SyncState::Idle;
                }
            }
        } else {
            if !(ctx.last_response_height == ctx.remote_blockchain_height.saturating_sub(1)
                && ctx.needed_objects.is_empty()
                && ctx.requested_objects.is_empty())
            {
                return Err(ProtocolError::Internal(format!(
                    "sync pipeline final condition failed: last_response_height={}, \
                     remote_blockchain_height={}, needed={}, requested={}",
                    ctx.last_response_height,
                    ctx.remote_blockchain_height,
                    ctx.needed_objects.len(),
                    ctx.requested_objects.len()
                )));
            }
            ctx.state = SyncState::Normal;
            info!("🏁 [{}] SYNCHRONIZED OK", ctx.peer_id);
            self.force_resync_idle_connections();
        }
        Ok(())
    }

    /// Our chain just advanced: parked peers get a fresh sync-data exchange
    /// so they can re-enter the pipeline.
    fn force_resync_idle_connections(&self) {
        let p2p = self.p2p();
        let mut idle = Vec::new();
        p2p.for_each_connection(&mut |snap| {
            if snap.state == SyncState::Idle {
                idle.push(snap.peer_id);
            }
            true
        });
        if !idle.is_empty() {
            info!("explicit resync of {} idle connection(s)", idle.len());
            p2p.do_idle_sync_with_peers(&idle);
        }
    }

    pub fn handle_request_get_objects(
        &self,
        blocks: Vec<BlockHash>,
        txs: Vec<TxHash>,
        ctx: &mut ConnectionContext,
    ) -> Result<(), ProtocolError> {
        if blocks.len() > MAX_BLOCKS_REQUEST_COUNT || txs.len() > MAX_TXS_REQUEST_COUNT {
            return Err(ProtocolError::Violation(format!(
                "objects request too large: {} blocks (max {}), {} txs (max {})",
                blocks.len(),
                MAX_BLOCKS_REQUEST_COUNT,
                txs.len(),
                MAX_TXS_REQUEST_COUNT
            )));
        }

        if !self.state.been_synchronized() {
            return Err(ProtocolError::Internal(
                "objects requested from a node that was never synchronized".to_string(),
            ));
        }

        debug!(
            "[{}] <<-- RequestGetObjects: {} blocks, {} txs",
            ctx.peer_id,
            blocks.len(),
            txs.len()
        );

        let bundle = self.core.get_objects(&blocks, &txs);
        debug!(
            "[{}] -->> ResponseGetObjects: {} blocks, {} txs, {} missed, height {}",
            ctx.peer_id,
            bundle.blocks.len(),
            bundle.txs.len(),
            bundle.missed_ids.len(),
            bundle.current_blockchain_height
        );
        self.p2p().post_notify(
            ctx.peer_id,
            ProtocolMessage::ResponseGetObjects {
                blocks: bundle.blocks,
                txs: bundle.txs,
                missed_ids: bundle.missed_ids,
                current_blockchain_height: bundle.current_blockchain_height,
            },
        );
        Ok(())
    }

    pub async fn handle_response_get_objects(
        &self,
        blocks: Vec<BlockEntry>,
        txs: Vec<Vec<u8>>,
        _missed_ids: Vec<BlockHash>,
        current_blockchain_height: u64,
        ctx: &mut ConnectionContext,
    ) -> Result<(), ProtocolError> {
        debug!(
            "[{}] <<-- ResponseGetObjects: {} blocks, {} txs, remote height {}",
            ctx.peer_id,
            blocks.len(),
            txs.len(),
            current_blockchain_height
        );

        if ctx.last_response_height > current_blockchain_height {
            return Err(ProtocolError::Violation(format!(
                "claimed height {} below earlier chain entry height {}",
                current_blockchain_height, ctx.last_response_height
            )));
        }
        ctx.remote_blockchain_height = current_blockchain_height;

        let gate = self.core.gate();
        let Some(_guard) = gate.try_enter() else {
            info!(
                "[{}] store busy during objects response, connection parked idle",
                ctx.peer_id
            );
            ctx.state = SyncState::Idle;
            return Ok(());
        };

        // Pre-validate every body before anything touches the store
        let mut parsed = Vec::with_capacity(blocks.len());
        for (index, entry) in blocks.iter().enumerate() {
            if self.is_stopping() {
                return Err(ProtocolError::Shutdown);
            }

            let block = match Block::from_blob(&entry.block) {
                Ok(block) if block.is_well_formed() => block,
                Ok(_) | Err(_) => {
                    self.p2p().add_ip_fail(ctx.remote_addr.ip());
                    return Err(ProtocolError::Violation(
                        "undecodable or malformed block body".to_string(),
                    ));
                }
            };
            let id = block.hash();

            // If the second block is already in the store, another peer
            // overtook this one; park the slower connection instead of
            // racing it against the core
            if index == 1 && self.core.have_block(&id) {
                info!(
                    "[{}] batch already delivered by a faster peer, connection parked idle",
                    ctx.peer_id
                );
                ctx.state = SyncState::Idle;
                ctx.clear_sync_objects();
                return Ok(());
            }

            if !ctx.requested_objects.remove(&id) {
                return Err(ProtocolError::Violation(format!(
                    "block {} was never requested",
                    short_hash(&id)
                )));
            }
            if block.tx_hashes.len() != entry.txs.len() {
                return Err(ProtocolError::Violation(format!(
                    "block {} carries {} tx blobs but names {} tx hashes",
                    short_hash(&id),
                    entry.txs.len(),
                    block.tx_hashes.len()
                )));
            }
            parsed.push(block);
        }

        if !ctx.requested_objects.is_empty() {
            return Err(ProtocolError::Violation(format!(
                "{} requested object(s) withheld",
                ctx.requested_objects.len()
            )));
        }

        // Ingest under paused mining + locked pool + open store batch
        let mut scope = IngestScope::begin(&self.core).await;
        for (block, entry) in parsed.iter().zip(blocks.iter()) {
            if self.is_stopping() {
                // Keep the blocks already applied
                scope.commit();
                info!("[{}] stop requested, committing partial ingest", ctx.peer_id);
                return Err(ProtocolError::Shutdown);
            }

            for tx_blob in &entry.txs {
                if self.is_stopping() {
                    scope.commit();
                    info!("[{}] stop requested, committing partial ingest", ctx.peer_id);
                    return Err(ProtocolError::Shutdown);
                }
                let verdict = self.core.handle_incoming_tx(tx_blob, true);
                if verdict.verification_failed {
                    self.p2p().add_ip_fail(ctx.remote_addr.ip());
                    return Err(ProtocolError::Violation(
                        "transaction verification failed during sync".to_string(),
                    ));
                }
            }

            let verdict = self.core.handle_incoming_block(&entry.block);
            if verdict.verification_failed {
                self.p2p().add_ip_fail(ctx.remote_addr.ip());
                return Err(ProtocolError::Violation(format!(
                    "block {} failed verification during sync",
                    short_hash(&block.hash())
                )));
            }
            if verdict.marked_as_orphaned {
                self.p2p().add_ip_fail(ctx.remote_addr.ip());
                return Err(ProtocolError::Violation(format!(
                    "sync block {} does not attach to our chain",
                    short_hash(&block.hash())
                )));
            }
            self.state.set_core_current_height(verdict.height);
        }
        scope.commit();
        drop(scope);

        let current_height = self.core.blockchain_height();
        let remote = ctx.remote_blockchain_height.max(1);
        info!(
            "📦 [{}] sync progress: {} blocks added, now have {} of {} ({:.2}%), {} left",
            ctx.peer_id,
            blocks.len(),
            current_height,
            remote,
            current_height as f64 * 100.0 / remote as f64,
            remote.saturating_sub(current_height)
        );

        self.request_missing_objects(ctx, true)
    }

    // ---- gossip -----------------------------------------------------------

    pub fn handle_notify_new_block(
        &self,
        block_entry: BlockEntry,
        hop: u32,
        ctx: &mut ConnectionContext,
    ) -> Result<(), ProtocolError> {
        debug!("[{}] <<-- NotifyNewBlock (hop {})", ctx.peer_id, hop);

        // Gossip is only admitted between peers tracking the network tip
        if !self.state.is_synchronized()
            || ctx.state != SyncState::Normal
            || ctx.remote_blockchain_height <= 1
        {
            return Ok(());
        }

        for tx_blob in &block_entry.txs {
            let verdict = self.core.handle_incoming_tx(tx_blob, true);
            if verdict.verification_failed {
                return Err(ProtocolError::Violation(
                    "announced block carries an invalid transaction".to_string(),
                ));
            }
        }

        self.core.pause_mine();
        let verdict = self.core.handle_incoming_block(&block_entry.block);
        self.core.resume_mine();

        if verdict.verification_failed {
            return Err(ProtocolError::Violation(
                "announced block failed verification".to_string(),
            ));
        }

        if verdict.added_to_main_chain {
            self.state.set_core_current_height(verdict.height);
            let relayed = self.p2p().relay_notify(
                &ProtocolMessage::NotifyNewBlock {
                    block_entry,
                    hop: hop + 1,
                },
                ctx.peer_id,
            );
            debug!("[{}] block relayed to {} peer(s)", ctx.peer_id, relayed);
        } else if verdict.marked_as_orphaned {
            // The announcement outpaces our chain: go back to synchronizing
            info!(
                "[{}] announced block is orphaned here, resynchronizing",
                ctx.peer_id
            );
            ctx.state = SyncState::Synchronizing;
            let gate = self.core.gate();
            match gate.try_enter() {
                Some(_guard) => {
                    let block_ids = self.core.short_chain_history();
                    debug!(
                        "[{}] -->> RequestChain: {} history ids",
                        ctx.peer_id,
                        block_ids.len()
                    );
                    self.p2p()
                        .post_notify(ctx.peer_id, ProtocolMessage::RequestChain { block_ids });
                }
                None => {
                    info!(
                        "[{}] store busy after orphan announcement, connection parked idle",
                        ctx.peer_id
                    );
                    ctx.state = SyncState::Idle;
                }
            }
        }
        Ok(())
    }

    pub fn handle_notify_new_transactions(
        &self,
        txs: Vec<Vec<u8>>,
        ctx: &mut ConnectionContext,
    ) -> Result<(), ProtocolError> {
        debug!(
            "[{}] <<-- NotifyNewTransactions: {} txs",
            ctx.peer_id,
            txs.len()
        );

        if !self.state.is_synchronized()
            || ctx.state != SyncState::Normal
            || ctx.remote_blockchain_height <= 1
        {
            return Ok(());
        }

        let mut relay = Vec::new();
        for tx_blob in txs {
            let verdict = self.core.handle_incoming_tx(&tx_blob, false);
            if verdict.verification_failed {
                return Err(ProtocolError::Violation(
                    "invalid transaction gossip".to_string(),
                ));
            }
            if verdict.should_be_relayed {
                relay.push(tx_blob);
            }
        }

        if !relay.is_empty() {
            let relayed = self.p2p().relay_notify(
                &ProtocolMessage::NotifyNewTransactions { txs: relay },
                ctx.peer_id,
            );
            debug!("[{}] txs relayed to {} peer(s)", ctx.peer_id, relayed);
        }
        Ok(())
    }

    // ---- supervision ------------------------------------------------------

    /// Periodic tick: recompute the synchronized quorum and let the core run
    /// its own maintenance.
    pub fn on_idle(&self) {
        let mut synced = 0usize;
        let mut syncing = 0usize;
        let mut total = 0usize;
        self.p2p().for_each_connection(&mut |snap| {
            if snap.state == SyncState::Normal && snap.remote_blockchain_height > 1 {
                synced += 1;
            }
            if snap.state == SyncState::Synchronizing {
                syncing += 1;
            }
            total += 1;
            true
        });
        self.state.set_synchronizing_connections(syncing);

        match quorum_verdict(synced, total, self.state.is_synchronized()) {
            Some(true) => {
                self.on_connection_synchronized();
                self.state.mark_been_synchronized();
                info!("Synchronized set to TRUE ({}/{} peers synced)", synced, total);
            }
            Some(false) => {
                if self.state.lower_synchronized() {
                    info!(
                        "Synchronized set to FALSE ({}/{} peers synced)",
                        synced, total
                    );
                }
            }
            None => {}
        }

        self.core.on_idle();
    }

    /// One-shot low→high edge of the synchronized flag
    fn on_connection_synchronized(&self) {
        if self.state.raise_synchronized() {
            info!(
                "\n**********************************************************************\n\
                 You are now synchronized with the network.\n\
                 The daemon will keep relaying blocks and transactions automatically.\n\
                 **********************************************************************"
            );
            self.core.on_synchronized();
        }
    }

    /// Live count of peers currently downloading from us or others
    pub fn synchronizing_connections_count(&self) -> usize {
        let mut count = 0;
        self.p2p().for_each_connection(&mut |snap| {
            if snap.state == SyncState::Synchronizing {
                count += 1;
            }
            true
        });
        count
    }

    /// Core stats, skipped while the store is busy
    pub fn get_stat_info(&self) -> Option<CoreStats> {
        let gate = self.core.gate();
        let _guard = gate.try_enter()?;
        Some(self.core.stat_info())
    }

    /// Dump the connection table to the log
    pub fn log_connections(&self) {
        let mut table = format!(
            "{:<24} {:<8} {:<26} {:<16} {:<10} {:<14} Version\n",
            "Remote Host", "Peer id", "Recv/Sent (idle,sec)", "State", "Height", "Livetime (sec)"
        );
        self.p2p().for_each_connection(&mut |snap| {
            table.push_str(&format!(
                "{:<24} {:<8} {:<26} {:<16} {:<10} {:<14} {}\n",
                format!(
                    "{}{}",
                    if snap.is_income { "[INC] " } else { "[OUT] " },
                    snap.remote_addr
                ),
                snap.peer_id,
                format!(
                    "{}({})/{}({})",
                    snap.recv_cnt, snap.recv_idle_secs, snap.send_cnt, snap.send_idle_secs
                ),
                snap.state.to_string(),
                snap.remote_blockchain_height,
                snap.live_secs,
                snap.remote_version
            ));
            true
        });
        info!("Connections:\n{}", table);
    }
}
