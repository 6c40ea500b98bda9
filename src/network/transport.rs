//! Transport capability surface consumed by the protocol handler.
//!
//! The handler never owns sockets. Everything it needs from the P2P layer is
//! behind [`P2pEndpoint`]; the production implementation lives in
//! [`server`](crate::network::server), tests inject recorders, and
//! [`NullEndpoint`] stands in when no transport is attached (deinit, unit
//! tests) so call sites never branch on a missing endpoint.
//!
//! `for_each_connection` iterates read-only snapshots while the endpoint
//! holds its connection-table lock: visitors must only read and branch, and
//! must not call back into the endpoint.

use crate::network::connection_context::ConnectionSnapshot;
use crate::network::message::ProtocolMessage;
use crate::types::PeerId;
use std::net::IpAddr;

pub trait P2pEndpoint: Send + Sync {
    /// Visit a snapshot of every live connection; return false to stop early
    fn for_each_connection(&self, visitor: &mut dyn FnMut(&ConnectionSnapshot) -> bool);

    /// Queue a message to one peer; false when the peer is gone
    fn post_notify(&self, peer: PeerId, msg: ProtocolMessage) -> bool;

    /// Queue a message to every peer except `exclude`; returns receiver count
    fn relay_notify(&self, msg: &ProtocolMessage, exclude: PeerId) -> usize;

    /// Ask the transport to close this connection after the current event
    fn drop_connection(&self, peer: PeerId);

    /// Record a protocol failure against an address so reconnects back off
    fn add_ip_fail(&self, ip: IpAddr);

    /// Ask the transport to invoke the handler's `on_callback` for this peer
    /// once the current reply has been flushed
    fn request_callback(&self, peer: PeerId);

    fn is_stop_signal_sent(&self) -> bool;

    /// Re-run the sync-data exchange with the given (parked) peers
    fn do_idle_sync_with_peers(&self, peers: &[PeerId]);
}

/// No-op sink used when no transport is attached
pub struct NullEndpoint;

impl P2pEndpoint for NullEndpoint {
    fn for_each_connection(&self, _visitor: &mut dyn FnMut(&ConnectionSnapshot) -> bool) {}

    fn post_notify(&self, _peer: PeerId, _msg: ProtocolMessage) -> bool {
        false
    }

    fn relay_notify(&self, _msg: &ProtocolMessage, _exclude: PeerId) -> usize {
        0
    }

    fn drop_connection(&self, _peer: PeerId) {}

    fn add_ip_fail(&self, _ip: IpAddr) {}

    fn request_callback(&self, _peer: PeerId) {}

    fn is_stop_signal_sent(&self) -> bool {
        false
    }

    fn do_idle_sync_with_peers(&self, _peers: &[PeerId]) {}
}
