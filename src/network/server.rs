//! TCP transport for the protocol handler.
//!
//! One task runs per connection and is the only place that touches that
//! peer's [`ConnectionContext`]: inbound frames and queued events (sends,
//! callbacks, idle resyncs, closes) are processed strictly one at a time, so
//! the handler sees per-peer serialized access while different peers run
//! concurrently.
//!
//! The shared [`ConnectionRegistry`] implements the endpoint surface the
//! handler consumes: snapshot iteration, message posting and relay, drop and
//! callback scheduling, and the per-address failure book.

use crate::constants::network::MAX_IP_FAILS;
use crate::error::AppError;
use crate::network::connection_context::{ConnectionContext, ConnectionSnapshot};
use crate::network::message::ProtocolMessage;
use crate::network::protocol_handler::{ProtocolError, ProtocolHandler};
use crate::network::transport::P2pEndpoint;
use crate::network::wire;
use crate::types::PeerId;
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Work queued for a connection task
enum PeerEvent {
    Send(ProtocolMessage),
    Callback,
    IdleSync,
    Close,
}

struct PeerSlot {
    tx: mpsc::UnboundedSender<PeerEvent>,
    snapshot: Arc<parking_lot::RwLock<ConnectionSnapshot>>,
}

pub struct ConnectionRegistry {
    peers: DashMap<PeerId, PeerSlot>,
    ip_fails: DashMap<IpAddr, u32>,
    next_peer_id: AtomicU64,
    cancel: CancellationToken,
}

impl ConnectionRegistry {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            peers: DashMap::new(),
            ip_fails: DashMap::new(),
            next_peer_id: AtomicU64::new(1),
            cancel,
        }
    }

    fn allocate_peer_id(&self) -> PeerId {
        self.next_peer_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(
        &self,
        peer_id: PeerId,
        snapshot: ConnectionSnapshot,
    ) -> (
        mpsc::UnboundedReceiver<PeerEvent>,
        Arc<parking_lot::RwLock<ConnectionSnapshot>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(parking_lot::RwLock::new(snapshot));
        self.peers.insert(
            peer_id,
            PeerSlot {
                tx,
                snapshot: Arc::clone(&snapshot),
            },
        );
        (rx, snapshot)
    }

    fn unregister(&self, peer_id: PeerId) {
        self.peers.remove(&peer_id);
    }

    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    /// True when an address has failed too often to be worth another try
    pub fn is_ip_banned(&self, ip: &IpAddr) -> bool {
        self.ip_fails.get(ip).map(|f| *f >= MAX_IP_FAILS).unwrap_or(false)
    }

    pub fn ip_fail_count(&self, ip: &IpAddr) -> u32 {
        self.ip_fails.get(ip).map(|f| *f).unwrap_or(0)
    }
}

impl P2pEndpoint for ConnectionRegistry {
    fn for_each_connection(&self, visitor: &mut dyn FnMut(&ConnectionSnapshot) -> bool) {
        for entry in self.peers.iter() {
            let snapshot = entry.value().snapshot.read().clone();
            if !visitor(&snapshot) {
                break;
            }
        }
    }

    fn post_notify(&self, peer: PeerId, msg: ProtocolMessage) -> bool {
        match self.peers.get(&peer) {
            Some(slot) => slot.tx.send(PeerEvent::Send(msg)).is_ok(),
            None => false,
        }
    }

    fn relay_notify(&self, msg: &ProtocolMessage, exclude: PeerId) -> usize {
        let mut sent = 0;
        for entry in self.peers.iter() {
            if *entry.key() == exclude {
                continue;
            }
            if entry.value().tx.send(PeerEvent::Send(msg.clone())).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    fn drop_connection(&self, peer: PeerId) {
        if let Some(slot) = self.peers.get(&peer) {
            let _ = slot.tx.send(PeerEvent::Close);
        }
    }

    fn add_ip_fail(&self, ip: IpAddr) {
        let fails = {
            let mut entry = self.ip_fails.entry(ip).or_insert(0);
            *entry += 1;
            *entry
        };
        warn!("recorded failure #{} for {}", fails, ip);
    }

    fn request_callback(&self, peer: PeerId) {
        if let Some(slot) = self.peers.get(&peer) {
            let _ = slot.tx.send(PeerEvent::Callback);
        }
    }

    fn is_stop_signal_sent(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn do_idle_sync_with_peers(&self, peers: &[PeerId]) {
        for peer in peers {
            if let Some(slot) = self.peers.get(peer) {
                let _ = slot.tx.send(PeerEvent::IdleSync);
            }
        }
    }
}

pub struct NetworkServer {
    handler: Arc<ProtocolHandler>,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
}

impl NetworkServer {
    pub fn new(handler: Arc<ProtocolHandler>, cancel: CancellationToken) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(cancel.clone()));
        handler.set_p2p_endpoint(Some(Arc::clone(&registry) as Arc<dyn P2pEndpoint>));
        Self {
            handler,
            registry,
            cancel,
        }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bind and serve inbound connections until the stop token fires.
    /// Returns the bound address (relevant when the port was 0).
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, AppError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("📡 P2P listening on {}", local_addr);

        let handler = Arc::clone(&self.handler);
        let registry = Arc::clone(&self.registry);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let (stream, remote_addr) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!("accept failed: {}", e);
                                continue;
                            }
                        };
                        if registry.is_ip_banned(&remote_addr.ip()) {
                            debug!("refusing banned address {}", remote_addr);
                            continue;
                        }
                        spawn_connection(
                            stream,
                            remote_addr,
                            true,
                            Arc::clone(&handler),
                            Arc::clone(&registry),
                            cancel.clone(),
                        );
                    }
                }
            }
            info!("P2P accept loop stopped");
        });

        Ok(local_addr)
    }

    /// Dial one peer and run the connection until either side closes
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), AppError> {
        if self.registry.is_ip_banned(&addr.ip()) {
            return Err(AppError::Network(format!(
                "address {} is banned",
                addr.ip()
            )));
        }
        let stream = TcpStream::connect(addr).await?;
        info!("🤝 connected to peer {}", addr);
        spawn_connection(
            stream,
            addr,
            false,
            Arc::clone(&self.handler),
            Arc::clone(&self.registry),
            self.cancel.clone(),
        );
        Ok(())
    }
}

fn spawn_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    is_income: bool,
    handler: Arc<ProtocolHandler>,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
) {
    let peer_id = registry.allocate_peer_id();
    tokio::spawn(async move {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = tokio::io::split(stream);
        run_connection(
            reader,
            writer,
            peer_id,
            remote_addr,
            is_income,
            handler,
            Arc::clone(&registry),
            cancel,
        )
        .await;
        registry.unregister(peer_id);
        debug!("[{}] connection task finished", peer_id);
    });
}

/// Outcome of one read on the wire, shipped from the reader task
enum ReadOutcome {
    Frame(ProtocolMessage, u64),
    Eof,
    Bad(String),
}

#[allow(clippy::too_many_arguments)]
async fn run_connection<R, W>(
    mut reader: R,
    mut writer: W,
    peer_id: PeerId,
    remote_addr: SocketAddr,
    is_income: bool,
    handler: Arc<ProtocolHandler>,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let mut ctx = ConnectionContext::new(peer_id, remote_addr, is_income);
    let (mut rx, snapshot) = registry.register(peer_id, ctx.snapshot());
    let mut initial_done = false;

    // The reader owns the read half exclusively so a frame is never torn by
    // event processing; the loop below stays the single place touching ctx
    let (frame_tx, mut frame_rx) = mpsc::channel::<ReadOutcome>(16);
    let reader_task = tokio::spawn(async move {
        loop {
            let outcome = match wire::read_message(&mut reader).await {
                Ok(Some((msg, bytes))) => ReadOutcome::Frame(msg, bytes),
                Ok(None) => ReadOutcome::Eof,
                Err(e) => ReadOutcome::Bad(e),
            };
            let terminal = !matches!(outcome, ReadOutcome::Frame(..));
            if frame_tx.send(outcome).await.is_err() || terminal {
                break;
            }
        }
    });

    // The dialing side opens the sync-data exchange
    if !is_income {
        let payload = handler.get_payload_sync_data();
        let msg = ProtocolMessage::Handshake {
            data: payload,
            is_response: false,
        };
        match wire::write_message(&mut writer, &msg).await {
            Ok(bytes) => ctx.note_send(bytes),
            Err(e) => {
                warn!("[{}] handshake send failed: {}", peer_id, e);
                reader_task.abort();
                return;
            }
        }
    }

    loop {
        *snapshot.write() = ctx.snapshot();

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("[{}] stop signal, closing connection", peer_id);
                break;
            }

            event = rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    PeerEvent::Send(msg) => {
                        match wire::write_message(&mut writer, &msg).await {
                            Ok(bytes) => ctx.note_send(bytes),
                            Err(e) => {
                                warn!("[{}] send failed: {}", peer_id, e);
                                break;
                            }
                        }
                    }
                    PeerEvent::Callback => {
                        if let Err(e) = handler.on_callback(&mut ctx) {
                            warn!("[{}] callback failed: {}", peer_id, e);
                            break;
                        }
                    }
                    PeerEvent::IdleSync => {
                        let payload = handler.get_payload_sync_data();
                        let msg = ProtocolMessage::Handshake {
                            data: payload,
                            is_response: false,
                        };
                        match wire::write_message(&mut writer, &msg).await {
                            Ok(bytes) => ctx.note_send(bytes),
                            Err(e) => {
                                warn!("[{}] idle resync send failed: {}", peer_id, e);
                                break;
                            }
                        }
                    }
                    PeerEvent::Close => {
                        debug!("[{}] close requested", peer_id);
                        break;
                    }
                }
            }

            outcome = frame_rx.recv() => {
                match outcome {
                    Some(ReadOutcome::Frame(msg, bytes)) => {
                        ctx.note_recv(bytes);
                        if !dispatch_frame(
                            msg,
                            &mut ctx,
                            &mut writer,
                            &handler,
                            &mut initial_done,
                        )
                        .await
                        {
                            break;
                        }
                    }
                    Some(ReadOutcome::Eof) | None => {
                        debug!("[{}] peer closed the connection", peer_id);
                        break;
                    }
                    Some(ReadOutcome::Bad(e)) => {
                        warn!("[{}] bad frame from {}: {}", peer_id, remote_addr, e);
                        registry.add_ip_fail(remote_addr.ip());
                        break;
                    }
                }
            }
        }
    }

    reader_task.abort();
    *snapshot.write() = ctx.snapshot();
}

/// Handle one inbound frame. Returns false when the connection must close.
async fn dispatch_frame<W: AsyncWrite + Unpin>(
    msg: ProtocolMessage,
    ctx: &mut ConnectionContext,
    writer: &mut W,
    handler: &Arc<ProtocolHandler>,
    initial_done: &mut bool,
) -> bool {
    // Sync-data exchanges bypass the normal dispatch: the transport knows
    // which exchange is the initial one and owes the peer a reply
    if let ProtocolMessage::Handshake { data, is_response } = msg {
        let is_initial = !*initial_done;
        *initial_done = true;

        let result = handler.process_payload_sync_data(&data, ctx, is_initial);
        if !is_response {
            let reply = ProtocolMessage::Handshake {
                data: handler.get_payload_sync_data(),
                is_response: true,
            };
            match wire::write_message(writer, &reply).await {
                Ok(bytes) => ctx.note_send(bytes),
                Err(e) => {
                    warn!("[{}] handshake reply failed: {}", ctx.peer_id, e);
                    return false;
                }
            }
        }
        if let Err(e) = result {
            warn!("[{}] dropping connection: {}", ctx.peer_id, e);
            return false;
        }
        return true;
    }

    match handler.handle_message(msg, ctx).await {
        Ok(()) => true,
        Err(ProtocolError::Shutdown) => {
            info!("[{}] closing connection for shutdown", ctx.peer_id);
            false
        }
        Err(e) => {
            warn!("[{}] dropping connection: {}", ctx.peer_id, e);
            false
        }
    }
}
