//! Protocol handler integration tests.
//!
//! Each scenario drives a real handler over the real in-memory store with a
//! recording endpoint standing in for the transport. The happy path runs two
//! full nodes against each other and pumps their message queues until the
//! slower side reaches the faster side's tip.

use cinderd::block::types::Block;
use cinderd::blockchain::Blockchain;
use cinderd::constants::protocol::BLOCKS_SYNC_BATCH_COUNT;
use cinderd::core::NodeCore;
use cinderd::mining::Miner;
use cinderd::network::connection_context::{ConnectionContext, ConnectionSnapshot, SyncState};
use cinderd::network::handshake::SyncData;
use cinderd::network::message::ProtocolMessage;
use cinderd::network::protocol_handler::{ProtocolError, ProtocolHandler};
use cinderd::network::transport::P2pEndpoint;
use cinderd::network_type::NetworkType;
use cinderd::transaction_pool::TransactionPool;
use cinderd::types::{BlockHash, PeerId, Transaction, TxInput, TxOutput};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

// ---- test transport -------------------------------------------------------

/// Endpoint that records every call the handler makes, with a configurable
/// stop signal and connection-table snapshots.
#[derive(Default)]
struct RecordingEndpoint {
    posted: Mutex<Vec<(PeerId, ProtocolMessage)>>,
    relayed: Mutex<Vec<(PeerId, ProtocolMessage)>>,
    dropped: Mutex<Vec<PeerId>>,
    ip_fails: Mutex<Vec<IpAddr>>,
    callbacks: Mutex<Vec<PeerId>>,
    idle_syncs: Mutex<Vec<Vec<PeerId>>>,
    snapshots: Mutex<Vec<ConnectionSnapshot>>,
    stop: AtomicBool,
    /// When set, `is_stop_signal_sent` flips true after this many polls
    stop_after_polls: AtomicUsize,
    polls: AtomicUsize,
}

impl RecordingEndpoint {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn take_posted(&self) -> Vec<(PeerId, ProtocolMessage)> {
        std::mem::take(&mut self.posted.lock())
    }

    fn posted_count(&self) -> usize {
        self.posted.lock().len()
    }

    fn relayed_count(&self) -> usize {
        self.relayed.lock().len()
    }

    fn callback_count(&self) -> usize {
        self.callbacks.lock().len()
    }

    fn ip_fail_count(&self) -> usize {
        self.ip_fails.lock().len()
    }

    fn idle_sync_batches(&self) -> Vec<Vec<PeerId>> {
        self.idle_syncs.lock().clone()
    }

    fn set_snapshots(&self, snaps: Vec<ConnectionSnapshot>) {
        *self.snapshots.lock() = snaps;
    }

    fn stop_after(&self, polls: usize) {
        self.stop_after_polls.store(polls, Ordering::SeqCst);
    }
}

impl P2pEndpoint for RecordingEndpoint {
    fn for_each_connection(&self, visitor: &mut dyn FnMut(&ConnectionSnapshot) -> bool) {
        for snap in self.snapshots.lock().iter() {
            if !visitor(snap) {
                break;
            }
        }
    }

    fn post_notify(&self, peer: PeerId, msg: ProtocolMessage) -> bool {
        self.posted.lock().push((peer, msg));
        true
    }

    fn relay_notify(&self, msg: &ProtocolMessage, exclude: PeerId) -> usize {
        self.relayed.lock().push((exclude, msg.clone()));
        self.snapshots
            .lock()
            .iter()
            .filter(|s| s.peer_id != exclude)
            .count()
    }

    fn drop_connection(&self, peer: PeerId) {
        self.dropped.lock().push(peer);
    }

    fn add_ip_fail(&self, ip: IpAddr) {
        self.ip_fails.lock().push(ip);
    }

    fn request_callback(&self, peer: PeerId) {
        self.callbacks.lock().push(peer);
    }

    fn is_stop_signal_sent(&self) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            return true;
        }
        let threshold = self.stop_after_polls.load(Ordering::SeqCst);
        if threshold == 0 {
            return false;
        }
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        polls >= threshold
    }

    fn do_idle_sync_with_peers(&self, peers: &[PeerId]) {
        self.idle_syncs.lock().push(peers.to_vec());
    }
}

// ---- fixtures -------------------------------------------------------------

struct TestNode {
    handler: Arc<ProtocolHandler>,
    chain: Arc<Blockchain>,
    pool: Arc<TransactionPool>,
    endpoint: Arc<RecordingEndpoint>,
}

fn test_tx(seed: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            prev_tx: [seed; 32],
            vout: 0,
        }],
        outputs: vec![TxOutput {
            value: 250,
            recipient: vec![seed; 20],
        }],
        timestamp: 1_700_000_000,
    }
}

/// Node whose chain is extended by `blocks` deterministic blocks. Every
/// fifth block confirms one transaction so the ingest path sees tx blobs.
/// Two nodes built this way share every block id up to the shorter height.
fn test_node(blocks: usize) -> TestNode {
    let chain = Arc::new(Blockchain::new(NetworkType::Testnet));
    let pool = Arc::new(TransactionPool::new());

    for i in 0..blocks {
        let (_, top_id) = chain.top();
        let (tx_hashes, tx_blobs) = if i % 5 == 4 {
            let tx = test_tx(i as u8);
            (vec![tx.txid()], vec![(tx.txid(), tx.to_blob())])
        } else {
            (Vec::new(), Vec::new())
        };
        let block = Block::new(top_id, 1_700_000_000 + i as i64, tx_hashes);
        let verdict = chain.submit_block(block, tx_blobs);
        assert!(verdict.added_to_main_chain);
    }

    let core = NodeCore::new(Arc::clone(&chain), Arc::clone(&pool), Arc::new(Miner::new()));
    let handler = Arc::new(ProtocolHandler::new(Arc::new(core)));
    let endpoint = RecordingEndpoint::new();
    handler.set_p2p_endpoint(Some(Arc::clone(&endpoint) as Arc<dyn P2pEndpoint>));

    TestNode {
        handler,
        chain,
        pool,
        endpoint,
    }
}

fn ctx(peer_id: PeerId, is_income: bool) -> ConnectionContext {
    ConnectionContext::new(
        peer_id,
        format!("192.0.2.{}:28680", peer_id).parse().unwrap(),
        is_income,
    )
}

fn snapshot_with(peer_id: PeerId, state: SyncState, height: u64) -> ConnectionSnapshot {
    let mut snap = ctx(peer_id, true).snapshot();
    snap.state = state;
    snap.remote_blockchain_height = height;
    snap
}

/// Shuttle protocol messages between two handlers until both queues drain.
/// Returns the number of rounds; panics if the exchange does not terminate.
async fn pump(
    local: &TestNode,
    remote: &TestNode,
    ctx_local: &mut ConnectionContext,
    ctx_remote: &mut ConnectionContext,
) -> usize {
    let mut rounds = 0;
    loop {
        rounds += 1;
        assert!(rounds < 200, "message exchange did not terminate");

        let to_remote = local.endpoint.take_posted();
        let to_local = remote.endpoint.take_posted();
        if to_remote.is_empty() && to_local.is_empty() {
            break;
        }

        for (_, msg) in to_remote {
            if let ProtocolMessage::RequestGetObjects { blocks, .. } = &msg {
                assert!(
                    blocks.len() <= BLOCKS_SYNC_BATCH_COUNT,
                    "objects request exceeds the sync batch bound"
                );
            }
            remote
                .handler
                .handle_message(msg, ctx_remote)
                .await
                .expect("remote side must accept local messages");
        }
        for (_, msg) in to_local {
            local
                .handler
                .handle_message(msg, ctx_local)
                .await
                .expect("local side must accept remote messages");
            assert!(
                ctx_local.object_sets_disjoint(),
                "needed and requested sets must stay disjoint"
            );
        }
    }
    rounds
}

// ---- scenarios ------------------------------------------------------------

#[tokio::test]
async fn ahead_peer_syncs_to_remote_tip() {
    let local = test_node(100);
    let remote = test_node(200);
    remote.handler.init(true); // serving side has been synchronized

    let mut ctx_local = ctx(1, false); // our view of the remote peer
    let mut ctx_remote = ctx(9, true); // remote's view of us

    // Initial sync-data exchange
    let hshd = remote.handler.get_payload_sync_data();
    assert_eq!(hshd.current_height, 201);
    local
        .handler
        .process_payload_sync_data(&hshd, &mut ctx_local, true)
        .unwrap();
    assert_eq!(ctx_local.state, SyncState::Synchronizing);
    assert_eq!(ctx_local.callback_request_count, 1);
    assert_eq!(local.endpoint.callback_count(), 1);
    assert_eq!(local.handler.state().max_height_seen(), 201);
    assert_eq!(local.handler.state().core_initial_height(), 101);

    // Transport flushes the handshake reply, then fires the callback
    local.handler.on_callback(&mut ctx_local).unwrap();
    assert_eq!(ctx_local.callback_request_count, 0);

    pump(&local, &remote, &mut ctx_local, &mut ctx_remote).await;

    assert_eq!(local.chain.height(), 201);
    assert_eq!(local.chain.top().1, remote.chain.top().1);
    assert_eq!(ctx_local.state, SyncState::Normal);
    assert!(ctx_local.needed_objects.is_empty());
    assert!(ctx_local.requested_objects.is_empty());
    assert_eq!(ctx_local.last_response_height, 200);
    assert_eq!(ctx_local.remote_blockchain_height, 201);
    assert_eq!(local.handler.state().core_current_height(), 201);
    assert!(local.pool.is_empty(), "synced txs must be confirmed, not pooled");
}

#[tokio::test]
async fn handshake_with_identical_tip_goes_normal() {
    let local = test_node(50);
    let remote = test_node(50);

    let mut ctx_local = ctx(1, false);
    let hshd = remote.handler.get_payload_sync_data();
    local
        .handler
        .process_payload_sync_data(&hshd, &mut ctx_local, true)
        .unwrap();

    assert_eq!(ctx_local.state, SyncState::Normal);
    assert_eq!(local.endpoint.callback_count(), 0, "no callback requested");
    assert_eq!(local.endpoint.posted_count(), 0, "no chain request sent");
}

#[tokio::test]
async fn longer_remote_checkpoint_zone_refuses_handshake() {
    let local = test_node(40);
    local.chain.add_checkpoint(50, [0x50; 32]);

    let mut ctx_local = ctx(1, false);
    let hshd = SyncData {
        client_version: "0.9.9-future".to_string(),
        current_height: 200,
        top_id: [0xAB; 32],
        last_checkpoint_height: 100,
    };

    let err = local
        .handler
        .process_payload_sync_data(&hshd, &mut ctx_local, true)
        .unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::OutdatedSoftware {
            remote: 100,
            local: 50
        }
    ));
}

#[tokio::test]
async fn longer_remote_checkpoint_zone_is_tolerated_above_it() {
    // Our chain already passed the remote checkpoint zone: warn, keep going
    let local = test_node(150);
    local.chain.add_checkpoint(50, [0x50; 32]);

    let mut ctx_local = ctx(1, false);
    let hshd = SyncData {
        client_version: "0.9.9-future".to_string(),
        current_height: 200,
        top_id: [0xAB; 32],
        last_checkpoint_height: 100,
    };

    local
        .handler
        .process_payload_sync_data(&hshd, &mut ctx_local, true)
        .unwrap();
    assert_eq!(ctx_local.state, SyncState::Synchronizing);
}

#[tokio::test]
async fn busy_store_parks_handshake_peer_idle() {
    let local = test_node(10);
    let remote = test_node(20);

    local.chain.start_batch().await;

    let mut ctx_local = ctx(1, false);
    let hshd = remote.handler.get_payload_sync_data();
    local
        .handler
        .process_payload_sync_data(&hshd, &mut ctx_local, true)
        .unwrap();
    assert_eq!(ctx_local.state, SyncState::Idle);
    assert_eq!(local.endpoint.posted_count(), 0);
    assert_eq!(local.endpoint.callback_count(), 0);

    // Gate reopens: a re-exchange resumes the pipeline
    local.chain.finish_batch(true);
    local
        .handler
        .process_payload_sync_data(&hshd, &mut ctx_local, false)
        .unwrap();
    assert_eq!(ctx_local.state, SyncState::Synchronizing);
}

#[tokio::test]
async fn busy_outbound_peer_is_rejected_while_bootstrapping() {
    let local = test_node(0);
    let mut ctx_local = ctx(1, false);
    let hshd = SyncData {
        client_version: "0.9.2-test".to_string(),
        current_height: 1,
        top_id: [0xCC; 32],
        last_checkpoint_height: 0,
    };

    let err = local
        .handler
        .process_payload_sync_data(&hshd, &mut ctx_local, true)
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Violation(_)));

    // The same peer inbound is kept
    let mut inbound = ctx(2, true);
    local
        .handler
        .process_payload_sync_data(&hshd, &mut inbound, true)
        .unwrap();
}

#[tokio::test]
async fn orphan_announcement_triggers_resync() {
    let local = test_node(30);
    assert!(local.handler.state().raise_synchronized());

    let mut ctx_local = ctx(1, true);
    ctx_local.state = SyncState::Normal;
    ctx_local.remote_blockchain_height = 40;

    let stray = Block::new([0xEE; 32], 1_800_000_000, Vec::new());
    let entry = cinderd::network::message::BlockEntry {
        block: stray.to_blob(),
        txs: Vec::new(),
    };

    local
        .handler
        .handle_notify_new_block(entry, 3, &mut ctx_local)
        .unwrap();

    assert_eq!(ctx_local.state, SyncState::Synchronizing);
    assert_eq!(local.endpoint.relayed_count(), 0, "orphans are not relayed");

    let posted = local.endpoint.take_posted();
    assert_eq!(posted.len(), 1);
    match &posted[0].1 {
        ProtocolMessage::RequestChain { block_ids } => {
            assert_eq!(block_ids.last(), Some(&local.chain.genesis_id()));
        }
        other => panic!("expected RequestChain, got {}", other.message_type()),
    }
}

#[tokio::test]
async fn accepted_announcement_is_relayed_with_bumped_hop() {
    let local = test_node(5);
    assert!(local.handler.state().raise_synchronized());

    let mut ctx_local = ctx(1, true);
    ctx_local.state = SyncState::Normal;
    ctx_local.remote_blockchain_height = 7;
    local.endpoint.set_snapshots(vec![
        snapshot_with(1, SyncState::Normal, 7),
        snapshot_with(2, SyncState::Normal, 7),
    ]);

    let (_, top_id) = local.chain.top();
    let block = Block::new(top_id, 1_800_000_000, Vec::new());
    let entry = cinderd::network::message::BlockEntry {
        block: block.to_blob(),
        txs: Vec::new(),
    };

    local
        .handler
        .handle_notify_new_block(entry, 2, &mut ctx_local)
        .unwrap();

    assert_eq!(local.chain.height(), 7);
    let relayed = local.endpoint.relayed.lock().clone();
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].0, 1, "source peer is excluded from the relay");
    match &relayed[0].1 {
        ProtocolMessage::NotifyNewBlock { hop, .. } => assert_eq!(*hop, 3),
        other => panic!("expected NotifyNewBlock, got {}", other.message_type()),
    }
}

#[tokio::test]
async fn gossip_is_ignored_before_quorum() {
    let local = test_node(5);
    // synchronized flag not raised
    let mut ctx_local = ctx(1, true);
    ctx_local.state = SyncState::Normal;
    ctx_local.remote_blockchain_height = 7;

    let (_, top_id) = local.chain.top();
    let block = Block::new(top_id, 1_800_000_000, Vec::new());
    let entry = cinderd::network::message::BlockEntry {
        block: block.to_blob(),
        txs: Vec::new(),
    };

    local
        .handler
        .handle_notify_new_block(entry, 0, &mut ctx_local)
        .unwrap();
    assert_eq!(local.chain.height(), 6, "block must not be ingested");
    assert_eq!(local.endpoint.relayed_count(), 0);
}

#[tokio::test]
async fn transaction_gossip_filters_and_relays() {
    let local = test_node(3);
    assert!(local.handler.state().raise_synchronized());

    let mut ctx_local = ctx(1, true);
    ctx_local.state = SyncState::Normal;
    ctx_local.remote_blockchain_height = 5;

    let fresh = test_tx(0xA1).to_blob();
    local
        .handler
        .handle_notify_new_transactions(vec![fresh], &mut ctx_local)
        .unwrap();
    let relayed = local.endpoint.relayed.lock().clone();
    assert_eq!(relayed.len(), 1);
    match &relayed[0].1 {
        ProtocolMessage::NotifyNewTransactions { txs } => assert_eq!(txs.len(), 1),
        other => panic!("expected NotifyNewTransactions, got {}", other.message_type()),
    }
    assert!(
        local.pool.is_empty(),
        "gossip-only submission must not park txs in the pool"
    );

    let garbage = vec![0xDE, 0xAD];
    let err = local
        .handler
        .handle_notify_new_transactions(vec![garbage], &mut ctx_local)
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Violation(_)));
}

#[tokio::test]
async fn quorum_flip_raises_then_lowers() {
    let local = test_node(0);

    // 4 of 6 peers synced: strict majority reached
    local.endpoint.set_snapshots(vec![
        snapshot_with(1, SyncState::Normal, 10),
        snapshot_with(2, SyncState::Normal, 10),
        snapshot_with(3, SyncState::Normal, 10),
        snapshot_with(4, SyncState::Normal, 10),
        snapshot_with(5, SyncState::Synchronizing, 10),
        snapshot_with(6, SyncState::Idle, 10),
    ]);
    local.handler.on_idle();
    assert!(local.handler.state().is_synchronized());
    assert!(local.handler.state().been_synchronized());
    assert_eq!(local.handler.state().synchronizing_connections(), 1);

    // A second tick with the same quorum changes nothing
    local.handler.on_idle();
    assert!(local.handler.state().is_synchronized());

    // Peers vanish: one idle connection left, below the lower threshold
    local
        .endpoint
        .set_snapshots(vec![snapshot_with(6, SyncState::Idle, 10)]);
    local.handler.on_idle();
    assert!(!local.handler.state().is_synchronized());
    assert!(
        local.handler.state().been_synchronized(),
        "the sticky flag survives losing quorum"
    );
}

#[tokio::test]
async fn half_synced_peers_are_not_a_quorum() {
    let local = test_node(0);
    local.endpoint.set_snapshots(vec![
        snapshot_with(1, SyncState::Normal, 10),
        snapshot_with(2, SyncState::Normal, 10),
        snapshot_with(3, SyncState::Normal, 10),
        snapshot_with(4, SyncState::Idle, 10),
        snapshot_with(5, SyncState::Idle, 10),
        snapshot_with(6, SyncState::Idle, 10),
    ]);
    local.handler.on_idle();
    assert!(!local.handler.state().is_synchronized());
}

// ---- chain discovery edges ------------------------------------------------

#[tokio::test]
async fn chain_request_before_first_sync_gets_genesis_stub() {
    let local = test_node(25);
    let mut peer = ctx(3, true);

    local
        .handler
        .handle_request_chain(&[local.chain.genesis_id()], &mut peer)
        .unwrap();

    let posted = local.endpoint.take_posted();
    assert_eq!(posted.len(), 1);
    match &posted[0].1 {
        ProtocolMessage::ResponseChainEntry {
            block_ids,
            start_height,
            total_height,
        } => {
            assert_eq!(block_ids, &vec![local.chain.genesis_id()]);
            assert_eq!(*start_height, 0);
            assert_eq!(*total_height, 1);
        }
        other => panic!("expected ResponseChainEntry, got {}", other.message_type()),
    }
}

#[tokio::test]
async fn busy_store_answers_chain_request_with_genesis_stub() {
    let local = test_node(25);
    local.handler.init(true);
    local.chain.start_batch().await;

    let mut peer = ctx(3, true);
    local
        .handler
        .handle_request_chain(&[local.chain.genesis_id()], &mut peer)
        .unwrap();
    local.chain.finish_batch(true);

    let posted = local.endpoint.take_posted();
    match &posted[0].1 {
        ProtocolMessage::ResponseChainEntry { total_height, .. } => {
            assert_eq!(*total_height, 1);
        }
        other => panic!("expected ResponseChainEntry, got {}", other.message_type()),
    }
}

#[tokio::test]
async fn empty_chain_entry_drops_with_ip_fail() {
    let local = test_node(5);
    let mut peer = ctx(3, false);

    let err = local
        .handler
        .handle_response_chain_entry(Vec::new(), 0, 10, &mut peer)
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Violation(_)));
    assert_eq!(local.endpoint.ip_fail_count(), 1);
}

#[tokio::test]
async fn chain_entry_not_rooted_in_our_chain_drops() {
    let local = test_node(5);
    let mut peer = ctx(3, false);

    let err = local
        .handler
        .handle_response_chain_entry(vec![[0xBB; 32]], 0, 10, &mut peer)
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Violation(_)));
    assert_eq!(local.endpoint.ip_fail_count(), 1);
}

#[tokio::test]
async fn chain_entry_exceeding_claimed_total_drops() {
    let local = test_node(5);
    let mut peer = ctx(3, false);

    // Rooted correctly but 10 ids from height 5 cannot fit a total of 8
    let mut ids = vec![local.chain.genesis_id()];
    ids.extend(std::iter::repeat([0x0F; 32]).take(9));
    let err = local
        .handler
        .handle_response_chain_entry(ids, 5, 8, &mut peer)
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Violation(_)));
}

// ---- object fetch edges ---------------------------------------------------

#[tokio::test]
async fn oversized_objects_request_drops() {
    let local = test_node(5);
    local.handler.init(true);
    let mut peer = ctx(3, true);

    let blocks = vec![[0u8; 32]; 501];
    let err = local
        .handler
        .handle_request_get_objects(blocks, Vec::new(), &mut peer)
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Violation(_)));
}

#[tokio::test]
async fn objects_request_before_first_sync_is_internal_error() {
    let local = test_node(5);
    let mut peer = ctx(3, true);

    let err = local
        .handler
        .handle_request_get_objects(vec![[0u8; 32]], Vec::new(), &mut peer)
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Internal(_)));
}

#[tokio::test]
async fn response_below_earlier_claim_drops() {
    let local = test_node(5);
    let mut peer = ctx(3, false);
    peer.last_response_height = 100;

    let err = local
        .handler
        .handle_response_get_objects(Vec::new(), Vec::new(), Vec::new(), 50, &mut peer)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Violation(_)));
}

#[tokio::test]
async fn unrequested_block_in_response_drops() {
    let local = test_node(5);
    let mut peer = ctx(3, false);
    peer.state = SyncState::Synchronizing;
    peer.remote_blockchain_height = 10;

    let (_, top_id) = local.chain.top();
    let block = Block::new(top_id, 1_900_000_000, Vec::new());
    let entry = cinderd::network::message::BlockEntry {
        block: block.to_blob(),
        txs: Vec::new(),
    };

    let err = local
        .handler
        .handle_response_get_objects(vec![entry], Vec::new(), Vec::new(), 10, &mut peer)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Violation(_)));
}

#[tokio::test]
async fn tx_count_mismatch_in_response_drops() {
    let local = test_node(5);
    let mut peer = ctx(3, false);
    peer.remote_blockchain_height = 10;

    let (_, top_id) = local.chain.top();
    let block = Block::new(top_id, 1_900_000_000, Vec::new());
    peer.requested_objects.insert(block.hash());
    let entry = cinderd::network::message::BlockEntry {
        block: block.to_blob(),
        txs: vec![vec![0xAA]], // one blob, zero declared hashes
    };

    let err = local
        .handler
        .handle_response_get_objects(vec![entry], Vec::new(), Vec::new(), 10, &mut peer)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Violation(_)));
}

#[tokio::test]
async fn withheld_objects_drop_the_connection() {
    let local = test_node(5);
    let mut peer = ctx(3, false);
    peer.remote_blockchain_height = 10;
    peer.requested_objects.insert([0x99; 32]);

    let err = local
        .handler
        .handle_response_get_objects(Vec::new(), Vec::new(), Vec::new(), 10, &mut peer)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Violation(_)));
    assert!(
        local.endpoint.dropped.lock().is_empty(),
        "the transport owns the close; the handler only returns the error"
    );
}

#[tokio::test]
async fn overtaken_batch_parks_connection_idle() {
    // A faster peer already delivered these blocks: the store has them, the
    // slower connection is parked instead of dropped
    let serving = test_node(10);
    serving.handler.init(true);
    let local = test_node(10); // already has every block the batch carries

    let entry = serving
        .chain
        .find_blockchain_supplement(&[local.chain.genesis_id()])
        .unwrap();
    let ids: Vec<BlockHash> = entry.block_ids.iter().skip(1).take(3).copied().collect();
    let bundle = serving.chain.get_objects(&ids, &[]);
    assert_eq!(bundle.blocks.len(), 3);

    let mut peer = ctx(3, false);
    peer.state = SyncState::Synchronizing;
    peer.remote_blockchain_height = 11;
    peer.last_response_height = 10;
    for id in &ids {
        peer.requested_objects.insert(*id);
    }
    peer.needed_objects.push_back([0x42; 32]);

    local
        .handler
        .handle_response_get_objects(bundle.blocks, Vec::new(), Vec::new(), 11, &mut peer)
        .await
        .unwrap();

    assert_eq!(peer.state, SyncState::Idle);
    assert!(peer.needed_objects.is_empty());
    assert!(peer.requested_objects.is_empty());
    assert_eq!(local.endpoint.ip_fail_count(), 0, "no misbehavior recorded");
}

#[tokio::test]
async fn shutdown_mid_ingest_commits_partial_batch() {
    let serving = test_node(10);
    serving.handler.init(true);
    let local = test_node(0);

    // Local requests the first three blocks above genesis
    let entry = serving
        .chain
        .find_blockchain_supplement(&[local.chain.genesis_id()])
        .unwrap();
    let wanted: Vec<BlockHash> = entry.block_ids[1..4].to_vec();
    let bundle = serving.chain.get_objects(&wanted, &[]);
    assert_eq!(bundle.blocks.len(), 3);

    let mut peer = ctx(3, false);
    peer.state = SyncState::Synchronizing;
    peer.remote_blockchain_height = 11;
    peer.last_response_height = 3;
    for id in &wanted {
        peer.requested_objects.insert(*id);
    }

    // Prevalidation polls the stop flag once per block (3 polls); the first
    // ingest iteration polls again and sees the signal after block one
    local.endpoint.stop_after(5);

    let err = local
        .handler
        .handle_response_get_objects(bundle.blocks, Vec::new(), Vec::new(), 11, &mut peer)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Shutdown));

    assert_eq!(
        local.chain.height(),
        2,
        "the block ingested before the stop signal must survive"
    );
    assert!(!local.chain.gate().is_exclusive(), "batch must be closed");
}

#[tokio::test]
async fn corrupt_body_fails_prevalidation_before_ingest() {
    let serving = test_node(6);
    serving.handler.init(true);
    let local = test_node(0);

    let entry = serving
        .chain
        .find_blockchain_supplement(&[local.chain.genesis_id()])
        .unwrap();
    let wanted: Vec<BlockHash> = entry.block_ids[1..4].to_vec();
    let mut bundle = serving.chain.get_objects(&wanted, &[]);
    bundle.blocks[2].block = vec![0xFF, 0x00];

    let mut peer = ctx(3, false);
    peer.state = SyncState::Synchronizing;
    peer.remote_blockchain_height = 7;
    peer.last_response_height = 3;
    for id in &wanted {
        peer.requested_objects.insert(*id);
    }

    let err = local
        .handler
        .handle_response_get_objects(bundle.blocks, Vec::new(), Vec::new(), 7, &mut peer)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Violation(_)));
    assert_eq!(local.endpoint.ip_fail_count(), 1);
    assert_eq!(local.chain.height(), 1, "nothing reaches the store");
}

#[tokio::test]
async fn failed_block_mid_ingest_aborts_batch() {
    let serving = test_node(6);
    serving.handler.init(true);
    let local = test_node(0);

    let entry = serving
        .chain
        .find_blockchain_supplement(&[local.chain.genesis_id()])
        .unwrap();
    let wanted: Vec<BlockHash> = entry.block_ids[1..3].to_vec();
    let mut bundle = serving.chain.get_objects(&wanted, &[]);

    // Third body parses and is well formed, but names a tx the pool will
    // not hold: verification fails only once ingest reaches it
    let rogue = Block::new(wanted[1], 1_900_000_000, vec![[0x77; 32]]);
    bundle.blocks.push(cinderd::network::message::BlockEntry {
        block: rogue.to_blob(),
        txs: vec![test_tx(0xB7).to_blob()],
    });

    let mut peer = ctx(3, false);
    peer.state = SyncState::Synchronizing;
    peer.remote_blockchain_height = 7;
    peer.last_response_height = 3;
    for id in &wanted {
        peer.requested_objects.insert(*id);
    }
    peer.requested_objects.insert(rogue.hash());

    let err = local
        .handler
        .handle_response_get_objects(bundle.blocks, Vec::new(), Vec::new(), 7, &mut peer)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Violation(_)));
    assert_eq!(local.endpoint.ip_fail_count(), 1);
    assert_eq!(
        local.chain.height(),
        1,
        "aborted batch must unwind the blocks applied before the bad one"
    );
    assert!(!local.chain.gate().is_exclusive());
}

#[tokio::test]
async fn synchronized_peer_forces_idle_resync() {
    let local = test_node(10);
    local.endpoint.set_snapshots(vec![
        snapshot_with(4, SyncState::Idle, 11),
        snapshot_with(5, SyncState::Normal, 11),
    ]);

    let mut peer = ctx(3, false);
    peer.state = SyncState::Synchronizing;
    peer.remote_blockchain_height = 11;
    peer.last_response_height = 10;

    local
        .handler
        .request_missing_objects(&mut peer, true)
        .unwrap();

    assert_eq!(peer.state, SyncState::Normal);
    let batches = local.endpoint.idle_sync_batches();
    assert_eq!(batches, vec![vec![4]], "only the idle peer is resynced");
}

#[tokio::test]
async fn callback_without_request_is_an_internal_error() {
    let local = test_node(1);
    let mut peer = ctx(3, false);
    assert_eq!(peer.callback_request_count, 0);

    let err = local.handler.on_callback(&mut peer).unwrap_err();
    assert!(matches!(err, ProtocolError::Internal(_)));
}

#[tokio::test]
async fn stat_info_is_skipped_while_store_is_busy() {
    let local = test_node(4);
    assert_eq!(
        local.handler.get_stat_info().unwrap().blockchain_height,
        5
    );

    local.chain.start_batch().await;
    assert!(local.handler.get_stat_info().is_none());
    local.chain.finish_batch(true);
    assert!(local.handler.get_stat_info().is_some());
}
