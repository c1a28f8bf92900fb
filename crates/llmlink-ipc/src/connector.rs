use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::StreamExt;
use llmlink_protocol::{Body, DiscoveryFile, Envelope, MessageType, Payload};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio_util::codec::LinesCodecError;
use tokio_util::sync::CancellationToken;

use crate::error::{IpcError, Result};
use crate::framing::{self, LineReader, LineWriter};

const INBOUND_CAPACITY: usize = 256;

/// `Connecting` covers both a dial in progress and a reconnect waiting out
/// its backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Where the connector finds the listener's port.
#[derive(Debug, Clone)]
pub enum PortSource {
    Fixed(u16),
    /// Re-read on every connection attempt, so a listener that restarted on
    /// a new port is still found.
    Discovery(DiscoveryFile),
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// How long a heartbeat `ping` may wait for its `pong`.
    pub heartbeat_timeout: Duration,
    pub request_timeout: Duration,
    /// Attempt `n` waits `n * reconnect_delay` before dialing.
    pub reconnect_delay: Duration,
    /// 0 disables automatic reconnection.
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(2),
            max_reconnect_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub wait_for_response: bool,
    /// Overrides `ConnectorConfig::request_timeout`.
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn wait() -> Self {
        Self {
            wait_for_response: true,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
struct Target {
    host: String,
    port: PortSource,
}

type Pending = HashMap<String, oneshot::Sender<Result<Envelope>>>;

struct Inner {
    config: ConnectorConfig,
    target: StdMutex<Option<Target>>,
    state_tx: watch::Sender<ConnectionState>,
    writer: Mutex<Option<LineWriter>>,
    pending: StdMutex<Pending>,
    inbound_tx: broadcast::Sender<Envelope>,
    /// Cancelled to end the current supervisor (explicit disconnect/reconnect).
    supervisor: StdMutex<Option<CancellationToken>>,
    /// Cancelled when the current socket is deemed dead.
    session: StdMutex<Option<CancellationToken>>,
    welcome: StdMutex<Option<(String, String)>>,
    attempts: AtomicU32,
    root: CancellationToken,
}

/// Client half of the IPC transport.
///
/// Correlates requests with their responses, keeps the connection alive with
/// heartbeats, and reconnects with linear backoff after the socket drops.
/// Dropping the connector cancels its tasks and fails every in-flight
/// request immediately.
pub struct IpcConnector {
    inner: Arc<Inner>,
}

impl IpcConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (inbound_tx, _) = broadcast::channel(INBOUND_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                target: StdMutex::new(None),
                state_tx,
                writer: Mutex::new(None),
                pending: StdMutex::new(HashMap::new()),
                inbound_tx,
                supervisor: StdMutex::new(None),
                session: StdMutex::new(None),
                welcome: StdMutex::new(None),
                attempts: AtomicU32::new(0),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Connect to a fixed port. Any existing connection is closed first.
    pub async fn connect(&self, host: &str, port: u16) -> Result<()> {
        self.connect_to(Target {
            host: host.to_string(),
            port: PortSource::Fixed(port),
        })
        .await
    }

    /// Connect to whichever port the discovery file currently names.
    pub async fn connect_discovered(&self, host: &str, discovery: DiscoveryFile) -> Result<()> {
        self.connect_to(Target {
            host: host.to_string(),
            port: PortSource::Discovery(discovery),
        })
        .await
    }

    async fn connect_to(&self, target: Target) -> Result<()> {
        self.disconnect().await;
        *lock(&self.inner.target) = Some(target);
        self.inner.attempts.store(0, Ordering::SeqCst);

        // Stored before dialing so a concurrent disconnect() can cancel it.
        let supervisor = self.inner.root.child_token();
        *lock(&self.inner.supervisor) = Some(supervisor.clone());
        let (reader, session) = match self.inner.open(&supervisor).await {
            Ok(opened) => opened,
            Err(e) => {
                // Cancelled means a later disconnect or connect already owns the slot.
                if !supervisor.is_cancelled() {
                    lock(&self.inner.supervisor).take();
                }
                return Err(e);
            }
        };
        tokio::spawn(supervise(self.inner.clone(), reader, session, supervisor));
        Ok(())
    }

    /// Close the connection and stop reconnecting.
    pub async fn disconnect(&self) {
        let supervisor = lock(&self.inner.supervisor).take();
        if let Some(token) = supervisor {
            token.cancel();
            self.inner.teardown("disconnect requested").await;
        }
    }

    /// Send an envelope.
    ///
    /// Waits for the matching response when `wait_for_response` is set or the
    /// envelope requires an ack; returns `Ok(None)` otherwise.
    pub async fn send(&self, envelope: Envelope, options: SendOptions) -> Result<Option<Envelope>> {
        let timeout = options.timeout.unwrap_or(self.inner.config.request_timeout);
        if options.wait_for_response || envelope.ack_required() {
            self.inner.request(envelope, timeout).await.map(Some)
        } else {
            self.inner.write(&envelope).await.map(|()| None)
        }
    }

    /// Send a `ping` and wait for its `pong`, returning the round trip.
    pub async fn ping(&self) -> Result<Duration> {
        let started = tokio::time::Instant::now();
        self.inner
            .request(Envelope::ping(), self.inner.config.request_timeout)
            .await?;
        Ok(started.elapsed())
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Every envelope received from the listener, including responses.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inner.inbound_tx.subscribe()
    }

    /// Listener id from the last `welcome`.
    pub fn server_id(&self) -> Option<String> {
        lock(&self.inner.welcome).as_ref().map(|(server, _)| server.clone())
    }

    /// Peer id the listener assigned to this connection.
    pub fn client_id(&self) -> Option<String> {
        lock(&self.inner.welcome).as_ref().map(|(_, client)| client.clone())
    }

    /// Failed reconnect attempts since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

impl Drop for IpcConnector {
    fn drop(&mut self) {
        self.inner.root.cancel();
        self.inner.fail_pending();
        self.inner.state_tx.send_replace(ConnectionState::Disconnected);
    }
}

impl Inner {
    async fn open(&self, supervisor: &CancellationToken) -> Result<(LineReader, CancellationToken)> {
        let target = lock(&self.target).clone().ok_or(IpcError::NotConnected)?;
        let port = match &target.port {
            PortSource::Fixed(port) => *port,
            PortSource::Discovery(file) => file.discover().map_err(|e| IpcError::Connect {
                addr: target.host.clone(),
                message: e.to_string(),
            })?,
        };
        let addr = format!("{}:{port}", target.host);

        self.state_tx.send_replace(ConnectionState::Connecting);
        let connected = tokio::select! {
            _ = supervisor.cancelled() => {
                self.state_tx.send_replace(ConnectionState::Disconnected);
                return Err(IpcError::NotConnected);
            }
            connected = tokio::time::timeout(
                self.config.connect_timeout,
                TcpStream::connect(addr.as_str()),
            ) => connected,
        };
        let stream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state_tx.send_replace(ConnectionState::Disconnected);
                return Err(IpcError::Connect {
                    addr,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                self.state_tx.send_replace(ConnectionState::Disconnected);
                return Err(IpcError::Connect {
                    addr,
                    message: format!(
                        "timed out after {}ms",
                        self.config.connect_timeout.as_millis()
                    ),
                });
            }
        };
        stream.set_nodelay(true).ok();

        let (reader, writer) = framing::split(stream);
        let session = supervisor.child_token();
        {
            // teardown() takes this lock after cancelling, so a disconnect
            // either lands before this check or clears what we install.
            let mut slot = self.writer.lock().await;
            if supervisor.is_cancelled() {
                self.state_tx.send_replace(ConnectionState::Disconnected);
                return Err(IpcError::NotConnected);
            }
            *slot = Some(writer);
            *lock(&self.session) = Some(session.clone());
            self.attempts.store(0, Ordering::SeqCst);
            self.state_tx.send_replace(ConnectionState::Connected);
        }
        tracing::info!(addr = %addr, "connected to IPC listener");
        Ok((reader, session))
    }

    async fn write(&self, envelope: &Envelope) -> Result<()> {
        let result = {
            let mut guard = self.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                return Err(IpcError::NotConnected);
            };
            framing::write_envelope(writer, envelope).await
        };
        if let Err(e) = &result
            && !matches!(e, IpcError::Envelope(_))
        {
            tracing::warn!(err = %e, "IPC write failed");
            self.lose_session();
        }
        result
    }

    async fn request(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope> {
        let id = envelope.id().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);

        if let Err(e) = self.write(&envelope).await {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(IpcError::Disconnected { id }),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(IpcError::Timeout { id, timeout })
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let envelope = match Envelope::decode(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(err = %e, "dropping undecodable line");
                return;
            }
        };
        if envelope.kind().is_unknown() {
            tracing::warn!(kind = %envelope.kind(), "dropping envelope with unknown type");
            return;
        }

        if let Ok(Body::Welcome(welcome)) = envelope.body() {
            tracing::debug!(server = %welcome.server_id, client = %welcome.client_id, "welcomed");
            *lock(&self.welcome) = Some((welcome.server_id, welcome.client_id));
        }

        let key = envelope
            .original_id()
            .unwrap_or_else(|| envelope.id())
            .to_string();
        let waiter = lock(&self.pending).remove(&key);
        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(envelope.clone()));
        }

        let kind = envelope.kind().clone();
        if kind == MessageType::Ping {
            let pong = envelope.create_response(MessageType::Pong, Payload::new(), false);
            let _ = self.write(&pong).await;
        }
        let ack = (envelope.ack_required()
            && !matches!(kind, MessageType::Ping | MessageType::Ack))
        .then(|| envelope.create_ack(true, None));

        let _ = self.inbound_tx.send(envelope);

        if let Some(ack) = ack {
            let _ = self.write(&ack).await;
        }
    }

    fn lose_session(&self) {
        if let Some(session) = lock(&self.session).as_ref() {
            session.cancel();
        }
    }

    async fn teardown(&self, reason: &str) {
        lock(&self.session).take();
        self.writer.lock().await.take();
        let failed = self.fail_pending();
        let was = self.state_tx.send_replace(ConnectionState::Disconnected);
        if was != ConnectionState::Disconnected {
            tracing::info!(reason, failed_requests = failed, "IPC connection closed");
        }
    }

    fn fail_pending(&self) -> usize {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        let count = drained.len();
        for (id, waiter) in drained {
            let _ = waiter.send(Err(IpcError::Disconnected { id }));
        }
        count
    }

    async fn reconnect(&self, supervisor: &CancellationToken) -> Option<(LineReader, CancellationToken)> {
        let max = self.config.max_reconnect_attempts;
        loop {
            let attempt = self.attempts.load(Ordering::SeqCst) + 1;
            if attempt > max {
                tracing::warn!(attempts = max, "giving up on reconnecting");
                self.state_tx.send_replace(ConnectionState::Disconnected);
                return None;
            }
            self.attempts.store(attempt, Ordering::SeqCst);

            let delay = self.config.reconnect_delay * attempt;
            tracing::info!(attempt, max, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            self.state_tx.send_replace(ConnectionState::Connecting);
            tokio::select! {
                _ = supervisor.cancelled() => {
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    return None;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.open(supervisor).await {
                Ok(opened) => return Some(opened),
                Err(e) => tracing::warn!(attempt, err = %e, "reconnect failed"),
            }
        }
    }
}

/// Owns one logical connection: runs sessions back to back until the
/// reconnect budget runs out or the supervisor token is cancelled.
async fn supervise(
    inner: Arc<Inner>,
    mut reader: LineReader,
    mut session: CancellationToken,
    supervisor: CancellationToken,
) {
    loop {
        let heartbeat = tokio::spawn(heartbeat_loop(inner.clone(), session.clone()));
        let reason = read_session(&inner, &mut reader, &session).await;
        session.cancel();
        heartbeat.abort();

        if supervisor.is_cancelled() {
            return;
        }
        inner.teardown(reason).await;

        match inner.reconnect(&supervisor).await {
            Some((next_reader, next_session)) => {
                reader = next_reader;
                session = next_session;
            }
            None => return,
        }
    }
}

async fn read_session(
    inner: &Inner,
    reader: &mut LineReader,
    session: &CancellationToken,
) -> &'static str {
    loop {
        let next = tokio::select! {
            _ = session.cancelled() => return "connection lost",
            next = reader.next() => next,
        };
        match next {
            None => return "closed by listener",
            Some(Ok(line)) => inner.handle_line(&line).await,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                tracing::warn!("dropping oversize line");
            }
            Some(Err(LinesCodecError::Io(e))) => {
                tracing::debug!(err = %e, "IPC read failed");
                return "read error";
            }
        }
    }
}

async fn heartbeat_loop(inner: Arc<Inner>, session: CancellationToken) {
    let period = inner.config.heartbeat_interval;
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = session.cancelled() => return,
            _ = interval.tick() => {}
        }
        match inner
            .request(Envelope::ping(), inner.config.heartbeat_timeout)
            .await
        {
            Ok(_) => tracing::trace!("heartbeat ok"),
            Err(e) => {
                tracing::warn!(err = %e, "heartbeat failed");
                session.cancel();
                return;
            }
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_without_connection_fails_fast() {
        let connector = IpcConnector::new(ConnectorConfig::default());
        let err = connector
            .send(Envelope::ping(), SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::NotConnected));
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn refused_connect_reports_error_and_stays_disconnected() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let connector = IpcConnector::new(ConnectorConfig::default());
        let err = connector.connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, IpcError::Connect { .. }));
        assert!(err.is_transient());
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn missing_discovery_file_is_a_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let connector = IpcConnector::new(ConnectorConfig::default());
        let err = connector
            .connect_discovered("127.0.0.1", DiscoveryFile::new(dir.path().join("tray_port")))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Connect { .. }));
    }

    #[tokio::test]
    async fn cancelled_dial_installs_nothing() {
        let server = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let connector = IpcConnector::new(ConnectorConfig::default());
        *lock(&connector.inner.target) = Some(Target {
            host: "127.0.0.1".to_string(),
            port: PortSource::Fixed(port),
        });

        let supervisor = CancellationToken::new();
        supervisor.cancel();
        let err = connector.inner.open(&supervisor).await.unwrap_err();
        assert!(matches!(err, IpcError::NotConnected));
        assert_eq!(connector.state(), ConnectionState::Disconnected);
        assert!(connector.inner.writer.lock().await.is_none());
        assert!(lock(&connector.inner.session).is_none());
        let err = connector
            .send(Envelope::ping(), SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::NotConnected));
    }

    #[test]
    fn default_timings() {
        let config = ConnectorConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.reconnect_delay, Duration::from_secs(2));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }
}
