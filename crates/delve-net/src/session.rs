//! Authentication handshake and heartbeat keep-alive.
//!
//! [`Session::authenticate`] sends one [`HandshakeRequest`] and waits for
//! either a [`HandshakeResponse`] or an [`Envelope::Error`]; anything else
//! that arrives in the window is skipped. A failed answer does not close
//! the connection: the caller may retry the handshake on the same socket or
//! disconnect. The exception is a cancel or timeout that lands while the
//! request is only partly written, which closes it.
//!
//! Once authenticated, [`Session::spawn_heartbeat`] sends a keep-alive on a
//! fixed cadence measured from connection establishment. Other traffic does
//! not reset the cadence. A zero interval disables the keep-alive.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::dispatch::DispatchReceiver;
use crate::messages::{Envelope, HandshakeRequest, Heartbeat, InitialState, decode_envelope};
use crate::transport::{ConnectionState, DisconnectReason, SendError, Transport, TransportEvent};

/// Credentials supplied once per handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub device_id: String,
    pub client_version: String,
}

impl Credentials {
    fn to_request(&self) -> HandshakeRequest {
        HandshakeRequest {
            token: self.token.clone(),
            device_id: self.device_id.clone(),
            client_version: self.client_version.clone(),
        }
    }
}

/// What the server handed back on a successful handshake.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerHello {
    /// Initial authoritative state, if the server sent one.
    pub snapshot: Option<InitialState>,
    /// Server clock at send time, in Unix milliseconds.
    pub server_time_ms: Option<u64>,
}

/// Why a handshake failed.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// No answer within the handshake window.
    #[error("handshake timed out")]
    Timeout,
    /// The server refused the credentials.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    /// The server sent something that cannot be a valid answer.
    #[error("protocol violation during handshake: {0}")]
    ProtocolViolation(String),
    /// The caller cancelled the wait.
    #[error("handshake cancelled")]
    Cancelled,
    /// The connection ended before an answer arrived.
    #[error("connection lost during handshake: {0}")]
    ConnectionLost(DisconnectReason),
    /// The request could not be written.
    #[error("handshake request not sent: {0}")]
    Send(#[from] SendError),
}

/// Session timing settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on the whole handshake (request write plus response wait). Default: 5 s.
    pub handshake_timeout: Duration,
    /// Keep-alive cadence. Default: 30 s.
    pub heartbeat_interval: Duration,
    /// Bound on each heartbeat write. Default: 5 s.
    pub send_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Drives a [`Transport`] through authentication and keep-alive.
#[derive(Clone)]
pub struct Session {
    transport: Transport,
    config: SessionConfig,
}

impl Session {
    pub fn new(transport: Transport, config: SessionConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Authenticate the live connection.
    ///
    /// `events` must be the consumer end of the transport's dispatch queue;
    /// the handshake borrows the consumer context for its duration.
    pub async fn authenticate(
        &self,
        events: &mut DispatchReceiver<TransportEvent>,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<ServerHello, HandshakeError> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        self.transport
            .set_session_state(ConnectionState::Authenticating);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HandshakeError::Cancelled),
            r = tokio::time::timeout_at(deadline, self.exchange(events, credentials)) => {
                r.unwrap_or(Err(HandshakeError::Timeout))
            }
        };

        match &result {
            Ok(_) => {
                self.transport
                    .set_session_state(ConnectionState::Authenticated);
                tracing::info!("authenticated");
            }
            Err(e) => {
                // Leave the socket usable for another attempt.
                self.transport.set_session_state(ConnectionState::Connected);
                tracing::warn!(error = %e, "handshake failed");
            }
        }
        result
    }

    async fn exchange(
        &self,
        events: &mut DispatchReceiver<TransportEvent>,
        credentials: &Credentials,
    ) -> Result<ServerHello, HandshakeError> {
        let request = Envelope::HandshakeRequest(credentials.to_request());
        self.transport
            .send_envelope(&request, self.config.handshake_timeout)
            .await?;

        loop {
            let Some(event) = events.recv().await else {
                return Err(HandshakeError::ConnectionLost(DisconnectReason::Requested));
            };
            let body = match event {
                TransportEvent::Connected => continue,
                TransportEvent::Disconnected(reason) => {
                    return Err(HandshakeError::ConnectionLost(reason));
                }
                TransportEvent::Frame(body) => body,
            };

            let envelope = decode_envelope(&body)
                .map_err(|e| HandshakeError::ProtocolViolation(e.to_string()))?;
            match envelope {
                Envelope::HandshakeResponse(response) if response.ok => {
                    return Ok(ServerHello {
                        snapshot: response.snapshot,
                        server_time_ms: response.server_time_ms,
                    });
                }
                Envelope::HandshakeResponse(response) => {
                    let reason = response
                        .error
                        .unwrap_or_else(|| "no reason given".to_string());
                    return Err(HandshakeError::AuthRejected(reason));
                }
                Envelope::Error(notice) => {
                    return Err(HandshakeError::AuthRejected(format!(
                        "{} (code {})",
                        notice.message, notice.code
                    )));
                }
                other => {
                    tracing::debug!(kind = ?other.kind(), "ignoring message during handshake");
                }
            }
        }
    }

    /// Start the keep-alive task for the live connection.
    ///
    /// The first beat fires one interval after the connection was
    /// established. The task ends when the connection does. Returns `None`
    /// if nothing is connected or the interval is zero.
    pub fn spawn_heartbeat(&self) -> Option<JoinHandle<()>> {
        if self.config.heartbeat_interval.is_zero() {
            tracing::warn!("heartbeat interval is zero, keep-alive disabled");
            return None;
        }
        let connected_at = self.transport.connected_at()?;
        let cancel = self.transport.connection_token()?;
        Some(tokio::spawn(heartbeat_loop(
            self.transport.clone(),
            connected_at,
            self.config.clone(),
            cancel,
        )))
    }
}

async fn heartbeat_loop(
    transport: Transport,
    connected_at: Instant,
    config: SessionConfig,
    cancel: CancellationToken,
) {
    let interval = config.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(connected_at + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let beat = Envelope::Heartbeat(Heartbeat {
                    client_time_ms: unix_millis(),
                });
                match transport.send_envelope(&beat, config.send_timeout).await {
                    Ok(()) => tracing::trace!("heartbeat sent"),
                    Err(SendError::NotConnected) => break,
                    Err(e) => tracing::warn!(error = %e, "heartbeat send failed"),
                }
            }
        }
    }
    tracing::debug!("heartbeat stopped");
}

/// Local wall clock in Unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::dispatch_queue;
    use crate::framing::{FrameConfig, FrameError, read_frame, write_frame};
    use crate::messages::{Currency, ErrorNotice, HandshakeResponse, ServerTime, encode_envelope};
    use crate::transport::TransportConfig;
    use tokio::io::{DuplexStream, duplex};

    fn credentials() -> Credentials {
        Credentials {
            token: "abc".to_string(),
            device_id: "device-1".to_string(),
            client_version: "0.1.0".to_string(),
        }
    }

    async fn session() -> (Session, Transport, DispatchReceiver<TransportEvent>, DuplexStream) {
        let (tx, rx) = dispatch_queue();
        let transport = Transport::new(TransportConfig::default(), tx);
        let (client, server) = duplex(64 * 1024);
        transport.attach(client).await.unwrap();
        let session = Session::new(transport.clone(), SessionConfig::default());
        (session, transport, rx, server)
    }

    async fn server_send(server: &mut DuplexStream, envelope: Envelope) {
        let body = encode_envelope(&envelope).unwrap();
        write_frame(server, &body, &FrameConfig::default())
            .await
            .unwrap();
    }

    async fn server_recv(server: &mut DuplexStream) -> Envelope {
        let body = read_frame(server, &FrameConfig::default()).await.unwrap();
        decode_envelope(&body).unwrap()
    }

    async fn try_server_recv(server: &mut DuplexStream) -> Option<Envelope> {
        tokio::time::timeout(Duration::from_millis(10), read_frame(server, &FrameConfig::default()))
            .await
            .ok()
            .map(|r| decode_envelope(&r.unwrap()).unwrap())
    }

    #[tokio::test]
    async fn test_successful_handshake_returns_snapshot() {
        let (session, transport, mut rx, mut server) = session().await;

        let peer = tokio::spawn(async move {
            let request = server_recv(&mut server).await;
            assert_eq!(
                request,
                Envelope::HandshakeRequest(HandshakeRequest {
                    token: "abc".to_string(),
                    device_id: "device-1".to_string(),
                    client_version: "0.1.0".to_string(),
                })
            );
            server_send(
                &mut server,
                Envelope::HandshakeResponse(HandshakeResponse {
                    ok: true,
                    error: None,
                    snapshot: Some(InitialState {
                        currency: Currency {
                            gold: 100,
                            crystal: 5,
                        },
                        ..InitialState::default()
                    }),
                    server_time_ms: Some(42),
                }),
            )
            .await;
            server
        });

        let hello = session
            .authenticate(&mut rx, &credentials(), &CancellationToken::new())
            .await
            .unwrap();
        let _server = peer.await.unwrap();

        assert_eq!(hello.server_time_ms, Some(42));
        assert_eq!(hello.snapshot.unwrap().currency.gold, 100);
        assert_eq!(transport.state(), ConnectionState::Authenticated);
    }

    #[tokio::test]
    async fn test_unrelated_messages_are_skipped() {
        let (session, _transport, mut rx, mut server) = session().await;

        let peer = tokio::spawn(async move {
            server_recv(&mut server).await;
            server_send(
                &mut server,
                Envelope::ServerTime(ServerTime { server_time_ms: 1 }),
            )
            .await;
            server_send(
                &mut server,
                Envelope::HandshakeResponse(HandshakeResponse {
                    ok: true,
                    ..HandshakeResponse::default()
                }),
            )
            .await;
            server
        });

        let hello = session
            .authenticate(&mut rx, &credentials(), &CancellationToken::new())
            .await
            .unwrap();
        let _server = peer.await.unwrap();
        assert_eq!(hello, ServerHello::default());
    }

    #[tokio::test]
    async fn test_rejection_carries_reason() {
        let (session, transport, mut rx, mut server) = session().await;

        let peer = tokio::spawn(async move {
            server_recv(&mut server).await;
            server_send(
                &mut server,
                Envelope::HandshakeResponse(HandshakeResponse {
                    ok: false,
                    error: Some("token expired".to_string()),
                    ..HandshakeResponse::default()
                }),
            )
            .await;
            server
        });

        let result = session
            .authenticate(&mut rx, &credentials(), &CancellationToken::new())
            .await;
        let _server = peer.await.unwrap();

        match result {
            Err(HandshakeError::AuthRejected(reason)) => assert_eq!(reason, "token expired"),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(transport.is_connected());
        assert_eq!(transport.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_error_envelope_is_rejection() {
        let (session, _transport, mut rx, mut server) = session().await;

        let peer = tokio::spawn(async move {
            server_recv(&mut server).await;
            server_send(
                &mut server,
                Envelope::Error(ErrorNotice {
                    code: 401,
                    message: "unknown device".to_string(),
                }),
            )
            .await;
            server
        });

        let result = session
            .authenticate(&mut rx, &credentials(), &CancellationToken::new())
            .await;
        let _server = peer.await.unwrap();
        assert!(matches!(result, Err(HandshakeError::AuthRejected(r)) if r.contains("unknown device")));
    }

    #[tokio::test]
    async fn test_garbage_frame_is_protocol_violation() {
        let (session, _transport, mut rx, mut server) = session().await;

        let peer = tokio::spawn(async move {
            server_recv(&mut server).await;
            write_frame(&mut server, &[0xEE, 0x01], &FrameConfig::default())
                .await
                .unwrap();
            server
        });

        let result = session
            .authenticate(&mut rx, &credentials(), &CancellationToken::new())
            .await;
        let _server = peer.await.unwrap();
        assert!(matches!(result, Err(HandshakeError::ProtocolViolation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out_and_keeps_connection() {
        let (session, transport, mut rx, mut server) = session().await;

        let result = session
            .authenticate(&mut rx, &credentials(), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(HandshakeError::Timeout)));
        assert!(transport.is_connected(), "timeout must not close the socket");
        assert_eq!(transport.state(), ConnectionState::Connected);
        assert!(matches!(
            server_recv(&mut server).await,
            Envelope::HandshakeRequest(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_timeout_on_same_socket() {
        let (session, _transport, mut rx, mut server) = session().await;

        let first = session
            .authenticate(&mut rx, &credentials(), &CancellationToken::new())
            .await;
        assert!(matches!(first, Err(HandshakeError::Timeout)));
        server_recv(&mut server).await;

        let peer = tokio::spawn(async move {
            server_recv(&mut server).await;
            server_send(
                &mut server,
                Envelope::HandshakeResponse(HandshakeResponse {
                    ok: true,
                    ..HandshakeResponse::default()
                }),
            )
            .await;
            server
        });
        let second = session
            .authenticate(&mut rx, &credentials(), &CancellationToken::new())
            .await;
        let _server = peer.await.unwrap();
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_leaves_transport_usable() {
        let (session, transport, mut rx, _server) = session().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = session.authenticate(&mut rx, &credentials(), &cancel).await;
        assert!(matches!(result, Err(HandshakeError::Cancelled)));
        assert!(transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_write_closes_instead_of_corrupting() {
        let (tx, mut rx) = dispatch_queue();
        let transport = Transport::new(TransportConfig::default(), tx);
        // Too small for the request; the server never reads, so the write stalls.
        let (client, mut server) = duplex(8);
        transport.attach(client).await.unwrap();
        let session = Session::new(transport.clone(), SessionConfig::default());

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result = session.authenticate(&mut rx, &credentials(), &cancel).await;
        assert!(matches!(result, Err(HandshakeError::Cancelled)));
        assert!(!transport.is_connected());
        assert_eq!(transport.state(), ConnectionState::Disconnected);

        let retry = transport
            .send_envelope(&Envelope::MissionListRequest, Duration::from_secs(1))
            .await;
        assert!(matches!(retry, Err(SendError::NotConnected)));

        // The peer sees the cut-off frame end, never a second frame glued to it.
        assert!(matches!(
            read_frame(&mut server, &FrameConfig::default()).await,
            Err(FrameError::ShortRead)
        ));

        let mut events = Vec::new();
        rx.drain_all(|event| events.push(event));
        assert_eq!(
            events.last(),
            Some(&TransportEvent::Disconnected(DisconnectReason::IoError))
        );
    }

    #[tokio::test]
    async fn test_remote_close_during_handshake() {
        let (session, _transport, mut rx, mut server) = session().await;

        let peer = tokio::spawn(async move {
            server_recv(&mut server).await;
            drop(server);
        });

        let result = session
            .authenticate(&mut rx, &credentials(), &CancellationToken::new())
            .await;
        peer.await.unwrap();
        assert!(matches!(
            result,
            Err(HandshakeError::ConnectionLost(DisconnectReason::RemoteClosed))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_heartbeat_per_interval() {
        let (session, _transport, _rx, mut server) = session().await;
        session.spawn_heartbeat().unwrap();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(try_server_recv(&mut server).await.is_none());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(
            try_server_recv(&mut server).await,
            Some(Envelope::Heartbeat(_))
        ));
        assert!(try_server_recv(&mut server).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_stops_on_disconnect() {
        let (session, transport, _rx, _server) = session().await;
        let handle = session.spawn_heartbeat().unwrap();

        transport.disconnect(DisconnectReason::Requested);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("heartbeat task ends")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_disables_heartbeat() {
        let (tx, _rx) = dispatch_queue();
        let transport = Transport::new(TransportConfig::default(), tx);
        let (client, mut server) = duplex(64 * 1024);
        transport.attach(client).await.unwrap();
        let session = Session::new(
            transport.clone(),
            SessionConfig {
                heartbeat_interval: Duration::ZERO,
                ..SessionConfig::default()
            },
        );

        assert!(session.spawn_heartbeat().is_none());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(try_server_recv(&mut server).await.is_none());
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_no_heartbeat_without_connection() {
        let (tx, _rx) = dispatch_queue();
        let transport = Transport::new(TransportConfig::default(), tx);
        let session = Session::new(transport, SessionConfig::default());
        assert!(session.spawn_heartbeat().is_none());
    }
}
