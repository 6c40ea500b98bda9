//! Per-connection protocol state.
//!
//! One [`ConnectionContext`] exists per peer, owned by the transport and
//! handed mutably to the protocol handler while that peer's inbound event is
//! processed. The transport serializes events per connection, so no locking
//! happens here; different connections run concurrently.

use crate::types::{BlockHash, PeerId};
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

/// Protocol position of one peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Created, sync data not yet exchanged
    BeforeHandshake,
    /// Downloading the remote chain
    Synchronizing,
    /// Parked: the store was busy or another peer overtook this one
    Idle,
    /// At the remote tip, eligible for gossip
    Normal,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::BeforeHandshake => write!(f, "before_handshake"),
            SyncState::Synchronizing => write!(f, "synchronizing"),
            SyncState::Idle => write!(f, "idle"),
            SyncState::Normal => write!(f, "normal"),
        }
    }
}

pub struct ConnectionContext {
    pub peer_id: PeerId,
    pub remote_addr: SocketAddr,
    /// Inbound (peer dialed us) vs outbound
    pub is_income: bool,
    pub state: SyncState,

    pub remote_version: String,
    /// Chain length the peer last claimed
    pub remote_blockchain_height: u64,
    /// Highest height index covered by the peer's last chain entry
    pub last_response_height: u64,

    /// Announced block ids we still have to request, in announcement order
    pub needed_objects: VecDeque<BlockHash>,
    /// Block ids currently in flight to this peer
    pub requested_objects: HashSet<BlockHash>,
    /// Self-callbacks requested from the transport and not yet fired
    pub callback_request_count: u32,

    // Telemetry, maintained by the transport
    pub started_at: Instant,
    pub last_recv: Instant,
    pub last_send: Instant,
    pub recv_cnt: u64,
    pub send_cnt: u64,
}

impl ConnectionContext {
    pub fn new(peer_id: PeerId, remote_addr: SocketAddr, is_income: bool) -> Self {
        let now = Instant::now();
        Self {
            peer_id,
            remote_addr,
            is_income,
            state: SyncState::BeforeHandshake,
            remote_version: String::new(),
            remote_blockchain_height: 0,
            last_response_height: 0,
            needed_objects: VecDeque::new(),
            requested_objects: HashSet::new(),
            callback_request_count: 0,
            started_at: now,
            last_recv: now,
            last_send: now,
            recv_cnt: 0,
            send_cnt: 0,
        }
    }

    pub fn note_recv(&mut self, bytes: u64) {
        self.last_recv = Instant::now();
        self.recv_cnt += bytes;
    }

    pub fn note_send(&mut self, bytes: u64) {
        self.last_send = Instant::now();
        self.send_cnt += bytes;
    }

    /// A block id must never be queued and in flight at the same time
    pub fn object_sets_disjoint(&self) -> bool {
        self.needed_objects
            .iter()
            .all(|id| !self.requested_objects.contains(id))
    }

    /// Forget all pending sync work (used when this peer is parked)
    pub fn clear_sync_objects(&mut self) {
        self.needed_objects.clear();
        self.requested_objects.clear();
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            peer_id: self.peer_id,
            remote_addr: self.remote_addr,
            is_income: self.is_income,
            state: self.state,
            remote_blockchain_height: self.remote_blockchain_height,
            remote_version: self.remote_version.clone(),
            recv_cnt: self.recv_cnt,
            send_cnt: self.send_cnt,
            recv_idle_secs: self.last_recv.elapsed().as_secs(),
            send_idle_secs: self.last_send.elapsed().as_secs(),
            live_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Read-only copy of a connection's state for snapshot iteration
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub peer_id: PeerId,
    pub remote_addr: SocketAddr,
    pub is_income: bool,
    pub state: SyncState,
    pub remote_blockchain_height: u64,
    pub remote_version: String,
    pub recv_cnt: u64,
    pub send_cnt: u64,
    pub recv_idle_secs: u64,
    pub send_idle_secs: u64,
    pub live_secs: u64,
}
