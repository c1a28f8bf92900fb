use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::{DashMap, DashSet};
use futures_util::StreamExt;
use llmlink_protocol::payload::WelcomePayload;
use llmlink_protocol::{Body, Envelope, MessageType, PROTOCOL_VERSION, Payload};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{Mutex, broadcast};
use tokio_util::codec::LinesCodecError;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{IpcError, Result};
use crate::framing::{self, LineReader, LineWriter};

const INBOUND_CAPACITY: usize = 256;

/// An envelope received from a connected peer.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    pub peer_id: String,
    pub envelope: Envelope,
}

struct Peer {
    id: String,
    addr: SocketAddr,
    writer: Mutex<LineWriter>,
}

struct Running {
    port: u16,
    cancel: CancellationToken,
}

struct Inner {
    server_id: String,
    peers: DashMap<String, Arc<Peer>>,
    inbound_tx: broadcast::Sender<InboundEnvelope>,
    running: StdMutex<Option<Running>>,
    /// Types the owner answers with a correlated response instead of an ack.
    replied: DashSet<MessageType>,
    /// Parent of every per-start token; cancelled when the last handle drops.
    root: CancellationToken,
}

/// Server half of the IPC transport.
///
/// Accepts TCP peers, greets each with `welcome`, answers `ping` with `pong`
/// before publishing, and acks other `ackRequired` envelopes after
/// publishing, except for types registered with
/// [`replies_to`](Self::replies_to). Cheap to clone; all clones share one
/// peer table.
#[derive(Clone)]
pub struct IpcListener {
    inner: Arc<Inner>,
    _guard: Arc<DropGuard>,
}

impl IpcListener {
    pub fn new(server_id: impl Into<String>) -> Self {
        let (inbound_tx, _) = broadcast::channel(INBOUND_CAPACITY);
        let root = CancellationToken::new();
        Self {
            _guard: Arc::new(root.clone().drop_guard()),
            inner: Arc::new(Inner {
                server_id: server_id.into(),
                peers: DashMap::new(),
                inbound_tx,
                running: StdMutex::new(None),
                replied: DashSet::new(),
                root,
            }),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    /// Register `kind` as answered by a typed response carrying
    /// `original_id`. The listener then skips the ack for it so the sender
    /// sees exactly one correlated reply.
    pub fn replies_to(&self, kind: MessageType) {
        self.inner.replied.insert(kind);
    }

    /// Bind and start accepting. Port 0 picks a free port; the bound port is
    /// returned either way.
    pub async fn start(&self, host: &str, port: u16) -> Result<u16> {
        if let Some(port) = self.local_port() {
            return Err(IpcError::AlreadyRunning { port });
        }

        let addr = format!("{host}:{port}");
        let listener = bind(&addr).await.map_err(|source| IpcError::Bind {
            addr: addr.clone(),
            source,
        })?;
        let bound = listener.local_addr()?.port();

        let cancel = self.inner.root.child_token();
        {
            let mut running = lock(&self.inner.running);
            if let Some(existing) = running.as_ref() {
                return Err(IpcError::AlreadyRunning {
                    port: existing.port,
                });
            }
            *running = Some(Running {
                port: bound,
                cancel: cancel.clone(),
            });
        }

        tracing::info!(server = %self.inner.server_id, port = bound, "IPC listener started");
        tokio::spawn(accept_loop(self.inner.clone(), listener, cancel));
        Ok(bound)
    }

    /// Stop accepting and close every peer. Safe to call when not running.
    pub fn stop(&self) {
        let Some(running) = lock(&self.inner.running).take() else {
            return;
        };
        running.cancel.cancel();
        let dropped = self.inner.peers.len();
        self.inner.peers.clear();
        tracing::info!(server = %self.inner.server_id, port = running.port, dropped, "IPC listener stopped");
    }

    pub fn local_port(&self) -> Option<u16> {
        lock(&self.inner.running).as_ref().map(|r| r.port)
    }

    pub fn is_running(&self) -> bool {
        self.local_port().is_some()
    }

    /// Send to one peer. A write failure drops that peer and returns false.
    pub async fn send_to(&self, peer_id: &str, envelope: &Envelope) -> bool {
        let Some(peer) = self.inner.peers.get(peer_id).map(|p| p.clone()) else {
            tracing::debug!(peer = %peer_id, "send to unknown peer");
            return false;
        };
        self.inner.write_to(&peer, envelope).await
    }

    /// Send to every connected peer and return how many writes succeeded.
    pub async fn broadcast(&self, envelope: &Envelope) -> usize {
        let peers: Vec<Arc<Peer>> = self.inner.peers.iter().map(|p| p.value().clone()).collect();
        let mut delivered = 0;
        for peer in peers {
            if self.inner.write_to(&peer, envelope).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Subscribe to inbound envelopes. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundEnvelope> {
        self.inner.inbound_tx.subscribe()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.inner.peers.iter().map(|p| p.key().clone()).collect()
    }
}

impl Inner {
    async fn write_to(&self, peer: &Peer, envelope: &Envelope) -> bool {
        let result = {
            let mut writer = peer.writer.lock().await;
            framing::write_envelope(&mut writer, envelope).await
        };
        match result {
            Ok(()) => true,
            Err(IpcError::Envelope(e)) => {
                tracing::warn!(peer = %peer.id, err = %e, "failed to encode envelope");
                false
            }
            Err(e) => {
                tracing::info!(peer = %peer.id, addr = %peer.addr, err = %e, "write failed, dropping peer");
                self.peers.remove(&peer.id);
                false
            }
        }
    }

    async fn handle_line(&self, peer: &Peer, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let envelope = match Envelope::decode(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(peer = %peer.id, err = %e, "dropping undecodable line");
                return;
            }
        };
        if envelope.kind().is_unknown() {
            tracing::warn!(peer = %peer.id, kind = %envelope.kind(), "dropping envelope with unknown type");
            return;
        }

        let kind = envelope.kind().clone();
        if kind == MessageType::Ping {
            // Pong goes out before subscribers see the ping, and doubles as the ack.
            let pong = envelope.create_response(MessageType::Pong, Payload::new(), false);
            self.write_to(peer, &pong).await;
        }

        let wants_ack = envelope.ack_required()
            && !matches!(kind, MessageType::Ping | MessageType::Ack)
            && !self.replied.contains(&kind);
        let ack = wants_ack.then(|| envelope.create_ack(true, None));

        // No subscribers is fine.
        let _ = self.inbound_tx.send(InboundEnvelope {
            peer_id: peer.id.clone(),
            envelope,
        });

        if let Some(ack) = ack {
            self.write_to(peer, &ack).await;
        }
    }

    fn remove_peer(&self, peer: &Peer) {
        // Only remove the entry if it is still this connection.
        if self
            .peers
            .remove_if(&peer.id, |_, p| std::ptr::eq(p.as_ref(), peer))
            .is_some()
        {
            tracing::info!(peer = %peer.id, addr = %peer.addr, "peer disconnected");
        }
    }
}

async fn bind(addr: &str) -> std::io::Result<TcpListener> {
    let resolved = tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "address did not resolve")
    })?;
    let socket = if resolved.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    // Allows an immediate restart on the port a previous instance published.
    socket.set_reuseaddr(true)?;
    socket.bind(resolved)?;
    socket.listen(128)
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                let inner = inner.clone();
                let cancel = cancel.child_token();
                tokio::spawn(serve_peer(inner, stream, addr, cancel));
            }
            Err(e) => {
                tracing::warn!(err = %e, "accept failed");
            }
        }
    }
    tracing::debug!(server = %inner.server_id, "accept loop exited");
}

async fn serve_peer(
    inner: Arc<Inner>,
    stream: TcpStream,
    addr: SocketAddr,
    cancel: CancellationToken,
) {
    stream.set_nodelay(true).ok();
    let (mut reader, writer) = framing::split(stream);
    let peer = Arc::new(Peer {
        id: uuid::Uuid::new_v4().to_string(),
        addr,
        writer: Mutex::new(writer),
    });
    inner.peers.insert(peer.id.clone(), peer.clone());
    tracing::info!(peer = %peer.id, addr = %addr, "peer connected");

    let welcome = Envelope::from_body(Body::Welcome(WelcomePayload {
        server_id: inner.server_id.clone(),
        client_id: peer.id.clone(),
        protocol_version: PROTOCOL_VERSION,
    }))
    .with_source(inner.server_id.clone())
    .with_target(peer.id.clone());
    if !inner.write_to(&peer, &welcome).await {
        return;
    }

    read_loop(&inner, &peer, &mut reader, &cancel).await;
    inner.remove_peer(&peer);
}

async fn read_loop(inner: &Inner, peer: &Peer, reader: &mut LineReader, cancel: &CancellationToken) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = reader.next() => next,
        };
        match next {
            None => return,
            Some(Ok(line)) => inner.handle_line(peer, &line).await,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                tracing::warn!(peer = %peer.id, "dropping oversize line");
            }
            Some(Err(LinesCodecError::Io(e))) => {
                tracing::debug!(peer = %peer.id, err = %e, "peer read failed");
                return;
            }
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
