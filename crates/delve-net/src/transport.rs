//! Framed transport over one reliable byte stream.
//!
//! [`Transport`] owns the socket (plain TCP or TLS) for the lifetime of one
//! connection. A background receive task turns the byte stream into frames
//! and enqueues them on the [`DispatchSender`] handed in at construction,
//! bracketed by exactly one [`TransportEvent::Connected`] and exactly one
//! [`TransportEvent::Disconnected`] per connection.
//!
//! Writes are serialized behind one async lock; disconnects are serialized
//! behind one sync lock. Each connection gets a generation number so a late
//! receive task from an old connection can never tear down a newer one.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dispatch::DispatchSender;
use crate::framing::{FrameConfig, FrameError, check_len, read_frame, write_frame};
use crate::messages::{Envelope, MessageError, encode_envelope};
use crate::socket::{SocketConfig, configure_stream};
use crate::tls::{self, TlsSettings};

// ---------------------------------------------------------------------------
// Endpoint and settings
// ---------------------------------------------------------------------------

/// Where to connect, and whether to upgrade to TLS first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// `Some` selects the TLS strategy.
    pub tls: Option<TlsSettings>,
}

impl Endpoint {
    /// Plain TCP endpoint.
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
        }
    }

    /// TLS endpoint verified against `host`.
    pub fn tls(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            tls: Some(TlsSettings::new(host.clone())),
            host,
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls.is_some() { "tls" } else { "tcp" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Transport settings.
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    pub frame: FrameConfig,
    pub socket: SocketConfig,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected.
    Idle,
    /// Raw connect (and TLS upgrade) in progress.
    Connecting,
    /// Stream established, not yet authenticated.
    Connected,
    /// Handshake in flight.
    Authenticating,
    /// Handshake accepted.
    Authenticated,
    /// Connection lost or intentionally closed.
    Disconnected,
}

/// Observable connection state backed by a [`watch`] channel.
///
/// Multiple subscribers can observe state transitions without polling.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Idle`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Idle);
        Self { tx }
    }

    /// Set the current connection state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_replace(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local code asked for the disconnect.
    Requested,
    /// The peer closed the stream.
    RemoteClosed,
    /// A read or write failed.
    IoError,
    /// The peer sent a frame that violates the framing rules.
    ReceiveProtocolError,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::Requested => "disconnected by the client",
            DisconnectReason::RemoteClosed => "the server closed the connection",
            DisconnectReason::IoError => "the network connection failed",
            DisconnectReason::ReceiveProtocolError => "the server sent invalid data",
        };
        f.write_str(text)
    }
}

/// What the transport reports to the consumer context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection was established.
    Connected,
    /// One complete frame body, in receive order.
    Frame(Vec<u8>),
    /// The connection ended. Emitted once per connection.
    Disconnected(DisconnectReason),
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by [`Transport::connect`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The connect (plus TLS upgrade) did not finish in time.
    #[error("connect timed out")]
    Timeout,
    /// The raw connect failed.
    #[error("connection refused: {0}")]
    Refused(#[source] std::io::Error),
    /// The caller cancelled the attempt.
    #[error("connect cancelled")]
    Cancelled,
    /// The TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    Tls(#[source] std::io::Error),
    /// The TLS server name is not a valid DNS name or address.
    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),
    /// A connection is already live.
    #[error("already connected")]
    AlreadyConnected,
}

/// Errors returned by [`Transport::send`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// No live connection.
    #[error("not connected")]
    NotConnected,
    /// The body exceeds the frame limit; nothing was written.
    #[error("payload size {size} exceeds maximum {max}")]
    OversizedPayload { size: u64, max: u32 },
    /// Empty bodies are never framed.
    #[error("empty payload")]
    EmptyPayload,
    /// The write did not finish in time.
    #[error("send timed out")]
    Timeout,
    /// The envelope could not be encoded.
    #[error("encode failed: {0}")]
    Encode(#[from] MessageError),
    /// The write failed; the connection has been closed.
    #[error("write failed: {0}")]
    Io(#[source] std::io::Error),
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Lifetime traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
struct Counters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Counters {
    fn record_sent(&self, body_len: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add((body_len + crate::framing::PREFIX_LEN) as u64, Ordering::Relaxed);
    }

    fn record_received(&self, body_len: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add((body_len + crate::framing::PREFIX_LEN) as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransportStats {
        TransportStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Any duplex byte stream the transport can own.
trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

type BoxedStream = Box<dyn ByteStream>;

struct Link {
    generation: u64,
    cancel: CancellationToken,
    connected_at: Instant,
    reader: Option<JoinHandle<()>>,
}

struct Writer {
    generation: u64,
    half: WriteHalf<BoxedStream>,
}

struct Shared {
    config: TransportConfig,
    state: ConnectionStateWatch,
    /// The disconnect lock. Also held while enqueuing events so that no
    /// frame can follow its connection's `Disconnected`.
    link: Mutex<Option<Link>>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    events: DispatchSender<TransportEvent>,
    next_generation: AtomicU64,
    counters: Counters,
}

/// Handle to the framed transport. Clones share the same connection.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    /// Create an idle transport that reports to `events`.
    pub fn new(config: TransportConfig, events: DispatchSender<TransportEvent>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: ConnectionStateWatch::new(),
                link: Mutex::new(None),
                writer: tokio::sync::Mutex::new(None),
                events,
                next_generation: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    /// Connect to `endpoint`, upgrading to TLS if requested.
    ///
    /// The raw connect and the TLS upgrade together are bounded by `timeout`
    /// and by `cancel`. Whichever fires first drops the in-progress future,
    /// which closes any partially opened socket.
    pub async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectError> {
        if self.is_connected() {
            return Err(ConnectError::AlreadyConnected);
        }
        self.shared.state.set(ConnectionState::Connecting);
        tracing::info!(%endpoint, "connecting");

        let attempt = async {
            let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
                .await
                .map_err(ConnectError::Refused)?;
            configure_stream(&tcp, &self.shared.config.socket).map_err(ConnectError::Refused)?;

            let stream: BoxedStream = match &endpoint.tls {
                Some(settings) => Box::new(tls::upgrade(tcp, settings).await?),
                None => Box::new(tcp),
            };
            Ok::<_, ConnectError>(stream)
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
            r = tokio::time::timeout(timeout, attempt) => r.unwrap_or(Err(ConnectError::Timeout)),
        };

        match result {
            Ok(stream) => self.install(stream).await,
            Err(e) => {
                tracing::warn!(%endpoint, error = %e, "connect failed");
                self.shared.state.set(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Take ownership of an already established stream.
    ///
    /// Used by [`connect`](Self::connect); also lets tests drive the
    /// transport over an in-memory pipe.
    pub async fn attach<S>(&self, stream: S) -> Result<(), ConnectError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.install(Box::new(stream)).await
    }

    async fn install(&self, stream: BoxedStream) -> Result<(), ConnectError> {
        let (read_half, write_half) = tokio::io::split(stream);

        // Hold the writer lock while the link goes live so no send can see
        // the new link with the old writer.
        let mut writer = self.shared.writer.lock().await;
        let cancel = CancellationToken::new();
        let generation = {
            let mut link = self.shared.lock_link();
            if link.is_some() {
                return Err(ConnectError::AlreadyConnected);
            }
            let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
            *link = Some(Link {
                generation,
                cancel: cancel.clone(),
                connected_at: Instant::now(),
                reader: None,
            });
            self.shared.state.set(ConnectionState::Connected);
            self.shared.events.enqueue(TransportEvent::Connected);
            generation
        };
        *writer = Some(Writer {
            generation,
            half: write_half,
        });
        drop(writer);

        let handle = tokio::spawn(receive_loop(
            Arc::clone(&self.shared),
            read_half,
            cancel,
            generation,
        ));
        if let Some(link) = self.shared.lock_link().as_mut()
            && link.generation == generation
        {
            link.reader = Some(handle);
        }

        tracing::info!(generation, "connected");
        Ok(())
    }

    /// Write one frame.
    ///
    /// Limits are checked before any lock is taken, so an oversized or
    /// empty body never reaches the stream. A write that fails or times
    /// out part-way leaves the stream unusable and closes the connection.
    /// Dropping this future mid-write does the same, so no later frame is
    /// written after a partial one.
    pub async fn send(&self, body: &[u8], timeout: Duration) -> Result<(), SendError> {
        check_len(body.len() as u64, &self.shared.config.frame).map_err(|e| match e {
            FrameError::OversizedPayload { size, max } => SendError::OversizedPayload { size, max },
            _ => SendError::EmptyPayload,
        })?;

        let deadline = Instant::now() + timeout;
        let (generation, cancel) = self.current_link().ok_or(SendError::NotConnected)?;

        let mut guard = tokio::time::timeout_at(deadline, self.shared.writer.lock())
            .await
            .map_err(|_| SendError::Timeout)?;
        let writer = match guard.as_mut() {
            Some(writer) if writer.generation == generation => writer,
            _ => return Err(SendError::NotConnected),
        };

        let mut in_flight = WriteInFlight {
            shared: &self.shared,
            generation,
            settled: false,
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SendError::NotConnected),
            r = tokio::time::timeout_at(
                deadline,
                write_frame(&mut writer.half, body, &self.shared.config.frame),
            ) => match r {
                Ok(Ok(())) => Ok(()),
                Ok(Err(FrameError::Io(e))) => Err(SendError::Io(e)),
                Ok(Err(_)) => Err(SendError::EmptyPayload),
                Err(_) => Err(SendError::Timeout),
            },
        };
        in_flight.settled = true;

        match outcome {
            Ok(()) => {
                self.shared.counters.record_sent(body.len());
                Ok(())
            }
            Err(SendError::NotConnected) => {
                guard.take();
                Err(SendError::NotConnected)
            }
            Err(e) => {
                guard.take();
                drop(guard);
                tracing::warn!(error = %e, "write failed, closing connection");
                self.shared.close(Some(generation), DisconnectReason::IoError);
                Err(e)
            }
        }
    }

    /// Encode and write one envelope.
    pub async fn send_envelope(
        &self,
        envelope: &Envelope,
        timeout: Duration,
    ) -> Result<(), SendError> {
        let body = encode_envelope(envelope)?;
        self.send(&body, timeout).await
    }

    /// Close the connection.
    ///
    /// Idempotent: returns `true` only for the call that actually performed
    /// the transition, which is also the only one that emits
    /// [`TransportEvent::Disconnected`].
    pub fn disconnect(&self, reason: DisconnectReason) -> bool {
        self.shared.close(None, reason)
    }

    /// Whether a connection is live.
    pub fn is_connected(&self) -> bool {
        self.shared.lock_link().is_some()
    }

    /// When the live connection was established.
    pub fn connected_at(&self) -> Option<Instant> {
        self.shared.lock_link().as_ref().map(|link| link.connected_at)
    }

    /// Cancellation token of the live connection; fires on disconnect.
    pub fn connection_token(&self) -> Option<CancellationToken> {
        self.current_link().map(|(_, cancel)| cancel)
    }

    /// Move a live connection through the session states.
    ///
    /// Ignored when no connection is live so a late handshake can never
    /// resurrect a disconnected state.
    pub fn set_session_state(&self, state: ConnectionState) {
        let link = self.shared.lock_link();
        if link.is_some() {
            self.shared.state.set(state);
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.current()
    }

    /// Subscribe to lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Frame limits in force.
    pub fn frame_config(&self) -> &FrameConfig {
        &self.shared.config.frame
    }

    /// Traffic counters since construction.
    pub fn stats(&self) -> TransportStats {
        self.shared.counters.snapshot()
    }

    fn current_link(&self) -> Option<(u64, CancellationToken)> {
        self.shared
            .lock_link()
            .as_ref()
            .map(|link| (link.generation, link.cancel.clone()))
    }
}

impl Shared {
    fn lock_link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a frame if `generation` is still the live connection.
    fn deliver(&self, generation: u64, body: Vec<u8>) -> bool {
        let link = self.lock_link();
        match link.as_ref() {
            Some(live) if live.generation == generation => {
                self.counters.record_received(body.len());
                self.events.enqueue(TransportEvent::Frame(body));
                true
            }
            _ => false,
        }
    }

    /// Tear down the live connection. `generation` restricts the close to a
    /// specific connection; `None` closes whatever is live.
    fn close(self: &Arc<Self>, generation: Option<u64>, reason: DisconnectReason) -> bool {
        let link = {
            let mut guard = self.lock_link();
            let matches = guard
                .as_ref()
                .is_some_and(|live| generation.is_none_or(|g| g == live.generation));
            if !matches {
                return false;
            }
            let link = guard.take();
            self.state.set(ConnectionState::Disconnected);
            self.events.enqueue(TransportEvent::Disconnected(reason));
            link
        };
        let Some(link) = link else {
            return false;
        };

        link.cancel.cancel();
        // Detach rather than join: the receive task may be the caller.
        drop(link.reader);
        self.release_writer(link.generation);

        match reason {
            DisconnectReason::Requested | DisconnectReason::RemoteClosed => {
                tracing::info!(generation = link.generation, %reason, "disconnected");
            }
            _ => tracing::warn!(generation = link.generation, %reason, "disconnected"),
        }
        true
    }

    fn release_writer(self: &Arc<Self>, generation: u64) {
        let taken = match self.writer.try_lock() {
            Ok(mut writer) => take_if_generation(&mut writer, generation),
            Err(_) => {
                // A send holds the lock, either live (it sees the cancelled
                // token) or being abandoned mid-write. Sweep once it is
                // released; this also covers an install racing the close.
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let shared = Arc::clone(self);
                    runtime.spawn(async move {
                        let mut writer = shared.writer.lock().await;
                        if let Some(half) = take_if_generation(&mut writer, generation) {
                            shutdown_quietly(half).await;
                        }
                    });
                }
                None
            }
        };

        if let Some(half) = taken
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            runtime.spawn(shutdown_quietly(half));
        }
    }
}

/// Closes the connection if a frame write is abandoned before it settles.
struct WriteInFlight<'a> {
    shared: &'a Arc<Shared>,
    generation: u64,
    settled: bool,
}

impl Drop for WriteInFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(generation = self.generation, "frame write abandoned, closing connection");
            self.shared.close(Some(self.generation), DisconnectReason::IoError);
        }
    }
}

fn take_if_generation(
    slot: &mut Option<Writer>,
    generation: u64,
) -> Option<WriteHalf<BoxedStream>> {
    if slot.as_ref().is_some_and(|w| w.generation == generation) {
        slot.take().map(|w| w.half)
    } else {
        None
    }
}

async fn shutdown_quietly(mut half: WriteHalf<BoxedStream>) {
    let _ = half.shutdown().await;
}

/// Read frames until the stream ends, the peer misbehaves, or the
/// connection is cancelled.
async fn receive_loop(
    shared: Arc<Shared>,
    mut reader: ReadHalf<BoxedStream>,
    cancel: CancellationToken,
    generation: u64,
) {
    let reason = loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            r = read_frame(&mut reader, &shared.config.frame) => r,
        };

        match result {
            Ok(body) => {
                if !shared.deliver(generation, body) {
                    return;
                }
            }
            Err(FrameError::ShortRead) => break DisconnectReason::RemoteClosed,
            Err(FrameError::Io(e)) => {
                tracing::warn!(error = %e, "read failed");
                break DisconnectReason::IoError;
            }
            Err(e) => {
                tracing::warn!(error = %e, "rejecting inbound frame");
                break DisconnectReason::ReceiveProtocolError;
            }
        }
    };

    shared.close(Some(generation), reason);
}
