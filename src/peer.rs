//! Peer orchestration and the discovery protocol
//!
//! A [`Peer`] simultaneously listens for inbound connections and maintains
//! outbound channels to every peer it knows, growing its
//! [`ConnectionTable`] through flood discovery: a newcomer announces its
//! own listen endpoint to its first contact, the contact relays the
//! announcement to the members it already has and dials the newcomer back,
//! and the "not already connected" guard stops the flood from looping.
//!
//! Peers are built with [`PeerBuilder`], which resolves and validates all
//! configured addresses up front: a bad listen address or bootstrap peer
//! aborts construction, never a running peer.

use crate::connection::{Connection, ConnectionTable};
use crate::endpoint::{resolve, Endpoint};
use crate::envelope::{Envelope, RECV_BUFFER_SIZE};
use crate::error::{NetworkError, Result};
use crate::events::{Observer, ObserverBus, SubscriptionHandle};
use crate::logging;
use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// Listen address used when the builder is not given one
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1";

/// Current lifecycle state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Built but not started
    Created,
    /// Listening and connected to the mesh
    Running,
    /// Shut down; terminal
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Immutable peer configuration, produced by [`PeerBuilder`]
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Local listen endpoint (port 0 means "any free port")
    pub listen: Endpoint,
    /// Resolved bootstrap peers dialed at startup
    pub bootstrap: Vec<Endpoint>,
    /// Display name; announcements fall back to `ip:port` when unset
    pub username: Option<String>,
    /// Route this peer's tracing output to a `<ip>:<port>.log` file
    pub diagnostics: bool,
}

/// Builder for creating [`Peer`] instances
///
/// # Examples
///
/// ```no_run
/// use meshchat::PeerBuilder;
///
/// # async fn example() -> meshchat::Result<()> {
/// let peer = PeerBuilder::new()
///     .with_listen_port(9001)
///     .add_peer("127.0.0.1:9002")
///     .with_username("alice")
///     .build()?;
///
/// peer.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct PeerBuilder {
    listen_addr: String,
    listen_port: Option<u16>,
    peers: Vec<String>,
    username: Option<String>,
    diagnostics: bool,
}

impl PeerBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            listen_port: None,
            peers: Vec::new(),
            username: None,
            diagnostics: false,
        }
    }

    /// Set the local address to listen on (default `127.0.0.1`)
    ///
    /// Accepts `host` or `host:port`; a port given here wins over
    /// [`with_listen_port`](Self::with_listen_port).
    pub fn with_listen_addr<S: Into<String>>(mut self, addr: S) -> Self {
        self.listen_addr = addr.into();
        self
    }

    /// Set the local port to listen on (default 0, a free port)
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// Add a bootstrap peer to dial at startup, as `host[:port]`
    pub fn add_peer<S: Into<String>>(mut self, peer: S) -> Self {
        self.peers.push(peer.into());
        self
    }

    /// Set the display name carried in announcements and chat lines
    pub fn with_username<S: Into<String>>(mut self, username: S) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Enable or disable the per-peer diagnostic log file
    pub fn with_diagnostics(mut self, diagnostics: bool) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Resolve all configured addresses and build the peer
    ///
    /// # Errors
    ///
    /// Address errors for the listen address or any bootstrap peer abort
    /// construction; nothing is bound or dialed yet.
    pub fn build(self) -> Result<Peer> {
        let listen = resolve(&self.listen_addr, self.listen_port)?;
        let bootstrap = self
            .peers
            .iter()
            .map(|peer| resolve(peer, None))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let config = PeerConfig {
            listen,
            bootstrap,
            username: self.username,
            diagnostics: self.diagnostics,
        };

        Ok(Peer {
            shared: Arc::new(Shared {
                listen: RwLock::new(config.listen),
                username: RwLock::new(config.username.clone()),
                connections: ConnectionTable::new(),
                dialing: DashSet::new(),
                observers: ObserverBus::new(),
                state: RwLock::new(PeerState::Created),
                config,
            }),
            accept_task: Mutex::new(None),
            log_guard: Mutex::new(None),
        })
    }
}

impl Default for PeerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared between the peer handle and its spawned tasks
struct Shared {
    config: PeerConfig,
    /// Actual listen endpoint; replaces a configured port 0 after binding
    listen: RwLock<Endpoint>,
    username: RwLock<Option<String>>,
    connections: ConnectionTable,
    /// Endpoints with a dial in flight; two relayed announcements for the
    /// same newcomer may race, and only one may open a channel
    dialing: DashSet<Endpoint>,
    observers: ObserverBus,
    state: RwLock<PeerState>,
}

impl Shared {
    fn listen_endpoint(&self) -> Endpoint {
        *self.listen.read()
    }

    fn effective_username(&self) -> String {
        self.username
            .read()
            .clone()
            .unwrap_or_else(|| self.listen_endpoint().to_string())
    }

    fn ensure_running(&self, operation: &str) -> std::result::Result<(), NetworkError> {
        let state = *self.state.read();
        if state == PeerState::Running {
            Ok(())
        } else {
            Err(NetworkError::InvalidState {
                operation: operation.to_string(),
                state: state.to_string(),
            })
        }
    }

    /// Dial `endpoint`, register the channel, and announce ourselves on it
    ///
    /// Dialing an endpoint that is already in the table (or already being
    /// dialed) is a no-op returning `Ok(false)`; this is the guard that
    /// keeps re-announcements from causing duplicate channels. `Ok(true)`
    /// means a new channel was actually opened.
    fn dial(
        self: Arc<Self>,
        endpoint: Endpoint,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send>> {
        Box::pin(async move {
            self.ensure_running("connect")?;
            if self.connections.contains(&endpoint) {
                debug!("already connected with {}", endpoint);
                return Ok(false);
            }
            if !self.dialing.insert(endpoint) {
                debug!("dial to {} already in flight", endpoint);
                return Ok(false);
            }

            match TcpStream::connect(endpoint.to_socket_addr()).await {
                Ok(stream) => {
                    let (reader, writer) = stream.into_split();
                    let connection = Arc::new(Connection::new(endpoint, writer));
                    self.connections.insert(Arc::clone(&connection));
                    self.dialing.remove(&endpoint);
                    tokio::spawn(Arc::clone(&self).receive_loop(
                        reader,
                        endpoint.to_socket_addr(),
                        Some(endpoint),
                    ));

                    let hello =
                        Envelope::announcement(self.listen_endpoint(), &self.effective_username());
                    if let Err(e) = connection.send_text(hello.wire()).await {
                        self.connections.remove(&endpoint);
                        connection.close().await;
                        return Err(e.into());
                    }

                    info!("connected with {}", endpoint);
                    Ok(true)
                },
                Err(e) => {
                    self.dialing.remove(&endpoint);
                    error!("can not connect with {}: {}", endpoint, e);
                    self.observers
                        .publish(&Envelope::system(&format!(
                            "Impossible to connect with {endpoint}"
                        )));
                    Err(NetworkError::ConnectionFailed {
                        address: endpoint.to_string(),
                        reason: e.to_string(),
                    }
                    .into())
                },
            }
        })
    }

    /// Write `text` to every current channel, skipping over failures
    async fn broadcast_best_effort(&self, text: &str) {
        for connection in self.connections.snapshot() {
            match connection.send_text(text).await {
                Ok(()) => info!("send message <{}> to {}", text, connection.endpoint()),
                Err(e) => warn!("skipping {} during broadcast: {}", connection.endpoint(), e),
            }
        }
    }

    /// Read frames off one socket until it closes or a frame is undecodable
    ///
    /// Runs once per socket, inbound or outbound. `dialed` names the table
    /// entry this task reads for, when it reads the outbound side; an
    /// end-of-stream then drops that entry so the table only ever holds
    /// live channels.
    async fn receive_loop<R>(self: Arc<Self>, mut reader: R, remote: SocketAddr, dialed: Option<Endpoint>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            // read() returning 0 is the transport's end-of-stream signal:
            // the remote side shut down, not a momentary idle.
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!("end of stream from {}", remote);
                    self.drop_dialed(dialed).await;
                    return;
                },
                Ok(n) => n,
                Err(e) => {
                    warn!("read error from {}: {}", remote, e);
                    self.drop_dialed(dialed).await;
                    return;
                },
            };

            let envelope = match std::str::from_utf8(&buf[..n])
                .map_err(|e| e.to_string())
                .and_then(|text| Envelope::from_wire(text).map_err(|e| e.to_string()))
            {
                Ok(envelope) => envelope,
                Err(reason) => {
                    // A malformed frame kills this receive loop, never the peer
                    error!("undecodable frame from {}: {}", remote, reason);
                    return;
                },
            };

            info!("received message <{}> from {}", envelope.wire(), remote);

            // Every received envelope is observable, control messages included
            self.observers.publish(&envelope);

            if envelope.is_farewell() {
                if let Some(endpoint) = envelope.announced_endpoint() {
                    if let Some(connection) = self.connections.remove(&endpoint) {
                        connection.close().await;
                    }
                    info!("closed connection with {}", endpoint);
                }
                return;
            }

            if envelope.is_announcement() {
                let shared = Arc::clone(&self);
                tokio::spawn(async move { shared.handle_announcement(envelope).await });
            }
        }
    }

    /// React to a new-connection announcement: dial back, then relay it
    ///
    /// The relay is what carries membership transitively; without it a
    /// newcomer would only ever be known to the peers it dialed itself.
    /// Relaying happens only after the dial actually opened a channel, so
    /// an unreachable or already-known endpoint is never re-announced and
    /// the flood always dies out: every peer relays a given newcomer at
    /// most once, and the newcomer drops its own announcement.
    async fn handle_announcement(self: Arc<Self>, envelope: Envelope) {
        let Some(endpoint) = envelope.announced_endpoint() else {
            warn!("announcement without a valid listen endpoint; ignoring");
            return;
        };
        if endpoint == self.listen_endpoint() {
            return;
        }

        match Arc::clone(&self).dial(endpoint).await {
            Ok(true) => {
                for connection in self.connections.snapshot() {
                    if connection.endpoint() == endpoint {
                        continue;
                    }
                    if let Err(e) = connection.send_text(envelope.wire()).await {
                        warn!(
                            "skipping {} while relaying an announcement: {}",
                            connection.endpoint(),
                            e
                        );
                    }
                }
            },
            // Already connected, already being dialed, or the dial failed
            // (logged and published where it happened); nothing to relay.
            Ok(false) | Err(_) => {},
        }
    }

    /// Accept inbound connections forever, one receive task per socket
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("new connection active from {}", addr);
                    tokio::spawn(Arc::clone(&self).receive_loop(stream, addr, None));
                },
                Err(e) => {
                    error!("accept failed: {}", e);
                    return;
                },
            }
        }
    }

    async fn drop_dialed(&self, dialed: Option<Endpoint>) {
        if let Some(endpoint) = dialed {
            if let Some(connection) = self.connections.remove(&endpoint) {
                connection.close().await;
                debug!("dropped channel to {} after end of stream", endpoint);
            }
        }
    }
}

/// A node in the group-chat mesh
///
/// Owns the listening socket, the connection table, and the configured
/// bootstrap peers. All methods take `&self`; the peer may be shared
/// freely across tasks.
///
/// # Examples
///
/// ```no_run
/// use meshchat::{Envelope, PeerBuilder};
/// use std::sync::Arc;
///
/// # async fn example() -> meshchat::Result<()> {
/// let peer = PeerBuilder::new()
///     .with_listen_port(9001)
///     .with_username("alice")
///     .build()?;
///
/// peer.add_observer(Arc::new(|envelope: &Envelope| {
///     println!("{:?}", envelope.kind());
/// }));
///
/// peer.start().await?;
/// peer.send_to_everyone(Envelope::chat("alice", "hello").wire()).await?;
/// peer.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Peer {
    shared: Arc<Shared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    log_guard: Mutex<Option<WorkerGuard>>,
}

impl Peer {
    /// Start listening and dial every bootstrap peer
    ///
    /// Must be called exactly once, on a freshly-built peer. A bind
    /// failure is unrecoverable and aborts startup; a bootstrap peer that
    /// cannot be reached is not: the failure is logged, surfaced as a
    /// system envelope on the observer bus, and startup continues.
    ///
    /// # Errors
    ///
    /// [`NetworkError::InvalidState`] when the peer is not freshly built,
    /// [`NetworkError::BindFailed`] when the listen endpoint cannot be
    /// bound.
    pub async fn start(&self) -> Result<()> {
        {
            let state = *self.shared.state.read();
            if state != PeerState::Created {
                return Err(NetworkError::InvalidState {
                    operation: "start".to_string(),
                    state: state.to_string(),
                }
                .into());
            }
        }

        let configured = self.shared.config.listen;
        let listener = TcpListener::bind(configured.to_socket_addr())
            .await
            .map_err(|e| NetworkError::BindFailed {
                address: configured.to_string(),
                reason: e.to_string(),
            })?;

        // A configured port of 0 means "any free port"; announcements and
        // the diagnostic log must carry the port actually bound.
        let actual = match listener.local_addr() {
            Ok(SocketAddr::V4(v4)) => Endpoint::new(*v4.ip(), v4.port()),
            _ => configured,
        };
        *self.shared.listen.write() = actual;

        if self.shared.config.diagnostics {
            *self.log_guard.lock() = logging::init_peer_log(&actual);
        }

        *self.shared.state.write() = PeerState::Running;
        info!("peer listening on {}", actual);

        let handle = tokio::spawn(Arc::clone(&self.shared).accept_loop(listener));
        *self.accept_task.lock() = Some(handle);

        for endpoint in self.shared.config.bootstrap.clone() {
            if let Err(e) = Arc::clone(&self.shared).dial(endpoint).await {
                warn!("bootstrap peer {} unreachable: {}", endpoint, e);
            }
        }

        Ok(())
    }

    /// Set the display name carried in announcements and chat lines
    ///
    /// Until set, the peer identifies itself as its own `ip:port`.
    pub fn set_username<S: Into<String>>(&self, name: S) {
        *self.shared.username.write() = Some(name.into());
    }

    /// The display name currently in effect
    pub fn username(&self) -> String {
        self.shared.effective_username()
    }

    /// Open an outbound channel to `endpoint` and announce ourselves on it
    ///
    /// A no-op when already connected. On a failed dial no table entry is
    /// created; a system envelope describing the failure is published on
    /// the observer bus and the error is returned for the caller to decide
    /// whether to retry.
    pub async fn connect(&self, endpoint: Endpoint) -> Result<()> {
        Arc::clone(&self.shared).dial(endpoint).await.map(|_| ())
    }

    /// Write `text` as one frame to the channel registered for `endpoint`
    ///
    /// # Errors
    ///
    /// [`NetworkError::NotConnected`] when no channel is registered for
    /// `endpoint`; sending to an unknown peer is an integration error and
    /// is never swallowed.
    pub async fn send(&self, endpoint: Endpoint, text: &str) -> Result<()> {
        self.shared.ensure_running("send")?;
        let connection =
            self.shared
                .connections
                .get(&endpoint)
                .ok_or_else(|| NetworkError::NotConnected {
                    address: endpoint.to_string(),
                })?;
        connection.send_text(text).await?;
        info!("send message <{}> to {}", text, endpoint);
        Ok(())
    }

    /// Write `text` to every currently-connected peer, best-effort
    ///
    /// Not atomic across entries: a peer disconnecting mid-broadcast
    /// causes its send to be logged and skipped, not to poison the rest.
    pub async fn send_to_everyone(&self, text: &str) -> Result<()> {
        self.shared.ensure_running("send")?;
        self.shared.broadcast_best_effort(text).await;
        Ok(())
    }

    /// Close the channel to `endpoint` and drop it from the table
    ///
    /// # Errors
    ///
    /// [`NetworkError::NotConnected`] when there is no such channel, so a
    /// disconnect that did nothing is never mistaken for one that worked.
    pub async fn disconnect(&self, endpoint: Endpoint) -> Result<()> {
        self.shared.ensure_running("disconnect")?;
        match self.shared.connections.remove(&endpoint) {
            Some(connection) => {
                connection.close().await;
                info!("closed connection with {}", endpoint);
                Ok(())
            },
            None => Err(NetworkError::NotConnected {
                address: endpoint.to_string(),
            }
            .into()),
        }
    }

    /// Announce departure to every peer, close all channels, stop listening
    ///
    /// The only orderly shutdown path. The peer is terminal afterwards:
    /// every further operation, including a second `close`, fails with
    /// [`NetworkError::InvalidState`].
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.write();
            if *state != PeerState::Running {
                return Err(NetworkError::InvalidState {
                    operation: "close".to_string(),
                    state: state.to_string(),
                }
                .into());
            }
            *state = PeerState::Closed;
        }

        let farewell = Envelope::farewell(
            self.shared.listen_endpoint(),
            &self.shared.effective_username(),
        );
        for connection in self.shared.connections.snapshot() {
            if let Err(e) = connection.send_text(farewell.wire()).await {
                warn!(
                    "could not announce departure to {}: {}",
                    connection.endpoint(),
                    e
                );
            }
            connection.close().await;
            self.shared.connections.remove(&connection.endpoint());
            info!("closed connection with {}", connection.endpoint());
        }

        if let Some(handle) = self.accept_task.lock().take() {
            handle.abort();
        }
        info!("peer {} closed", self.shared.listen_endpoint());
        Ok(())
    }

    /// Register an observer for every received envelope
    pub fn add_observer(&self, observer: Arc<dyn Observer>) -> SubscriptionHandle {
        self.shared.observers.subscribe(observer)
    }

    /// Remove a previously registered observer
    pub fn remove_observer(&self, handle: SubscriptionHandle) {
        self.shared.observers.unsubscribe(handle);
    }

    /// The local listen endpoint
    ///
    /// Before `start()` this is the configured endpoint; afterwards it
    /// carries the actually-bound port, which matters when configured
    /// with port 0.
    pub fn local_endpoint(&self) -> Endpoint {
        self.shared.listen_endpoint()
    }

    /// Endpoints with a currently-open channel
    pub fn connected_endpoints(&self) -> Vec<Endpoint> {
        self.shared.connections.endpoints()
    }

    /// Whether `endpoint` currently has an open channel
    pub fn is_connected(&self, endpoint: &Endpoint) -> bool {
        self.shared.connections.contains(endpoint)
    }

    /// Current lifecycle state
    pub fn state(&self) -> PeerState {
        *self.shared.state.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let peer = PeerBuilder::new().build().unwrap();
        assert_eq!(peer.local_endpoint().to_string(), "127.0.0.1:0");
        assert_eq!(peer.state(), PeerState::Created);
        assert!(peer.connected_endpoints().is_empty());
    }

    #[test]
    fn test_builder_rejects_bad_listen_addr() {
        assert!(PeerBuilder::new()
            .with_listen_addr("example.com")
            .build()
            .is_err());
        assert!(PeerBuilder::new()
            .with_listen_addr("::1")
            .build()
            .is_err());
    }

    #[test]
    fn test_builder_rejects_bad_bootstrap_peer() {
        assert!(PeerBuilder::new()
            .add_peer("127.0.0.1:9001")
            .add_peer("127.0.0.1:999999")
            .build()
            .is_err());
    }

    #[test]
    fn test_builder_resolves_localhost() {
        let peer = PeerBuilder::new()
            .with_listen_addr("localhost")
            .with_listen_port(9001)
            .build()
            .unwrap();
        assert_eq!(peer.local_endpoint().to_string(), "127.0.0.1:9001");
    }

    #[test]
    fn test_username_defaults_to_endpoint() {
        let peer = PeerBuilder::new().with_listen_port(9001).build().unwrap();
        assert_eq!(peer.username(), "127.0.0.1:9001");

        peer.set_username("alice");
        assert_eq!(peer.username(), "alice");
    }

    #[tokio::test]
    async fn test_operations_require_running_state() {
        let peer = PeerBuilder::new().build().unwrap();
        let endpoint = resolve("127.0.0.1:9001", None).unwrap();

        for result in [
            peer.send(endpoint, "hi").await,
            peer.send_to_everyone("hi").await,
            peer.disconnect(endpoint).await,
            peer.connect(endpoint).await,
            peer.close().await,
        ] {
            assert!(matches!(
                result,
                Err(crate::Error::Network(NetworkError::InvalidState { .. }))
            ));
        }
    }

    #[tokio::test]
    async fn test_start_twice_is_a_precondition_violation() {
        let peer = PeerBuilder::new().build().unwrap();
        peer.start().await.unwrap();
        assert!(matches!(
            peer.start().await,
            Err(crate::Error::Network(NetworkError::InvalidState { .. }))
        ));
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_aborts_startup() {
        let first = PeerBuilder::new().build().unwrap();
        first.start().await.unwrap();

        let second = PeerBuilder::new()
            .with_listen_port(first.local_endpoint().port())
            .build()
            .unwrap();
        assert!(matches!(
            second.start().await,
            Err(crate::Error::Network(NetworkError::BindFailed { .. }))
        ));

        first.close().await.unwrap();
    }
}
