//! `GameClient`: the composition root.
//!
//! Owns the transport, the session, the router and the tasks around them.
//! Nothing is created lazily: construct with [`GameClient::new`], then
//! [`start`](GameClient::start) and [`stop`](GameClient::stop) as many times
//! as needed.
//!
//! While running there are four tasks: the transport's receive loop, the
//! send loop draining the request outbox, the heartbeat, and the consumer
//! loop that feeds the dispatch queue into the router. The consumer is the
//! only task that touches the caches.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use delve_config::Config;
use delve_net::TlsSettings;
use delve_net::dispatch::{DispatchReceiver, dispatch_queue};
use delve_net::framing::FrameConfig;
use delve_net::reconnect::{ReconnectConfig, ReconnectError, connect_with_backoff};
use delve_net::session::{Credentials, HandshakeError, ServerHello, Session, SessionConfig};
use delve_net::transport::{
    ConnectionState, DisconnectReason, Endpoint, Transport, TransportConfig, TransportEvent,
    TransportStats,
};

use crate::correlation::PendingCorrelations;
use crate::notify::Notifications;
use crate::requests::{RequestSender, send_loop};
use crate::router::{CacheViews, Router};

/// Errors from [`GameClient::start`] and [`GameClient::stop`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client is already running")]
    AlreadyRunning,
    #[error("client is not running")]
    NotRunning,
    #[error("could not connect: {0}")]
    Connect(#[from] ReconnectError),
    #[error("could not authenticate: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("consumer task failed: {0}")]
    ConsumerLost(#[from] tokio::task::JoinError),
    #[error("caches were lost with a failed consumer; create a new client")]
    CachesLost,
}

/// Everything a client needs to reach and authenticate with a server.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub endpoint: Endpoint,
    pub credentials: Credentials,
    pub transport: TransportConfig,
    pub session: SessionConfig,
    pub reconnect: ReconnectConfig,
    pub connect_timeout: Duration,
}

impl ClientSettings {
    /// Build settings from the persisted config and a bearer token.
    pub fn from_config(config: &Config, token: impl Into<String>) -> Self {
        let net = &config.network;
        let tls = net.tls.then(|| {
            TlsSettings::new(
                net.tls_server_name
                    .clone()
                    .unwrap_or_else(|| net.server_address.clone()),
            )
        });

        Self {
            endpoint: Endpoint {
                host: net.server_address.clone(),
                port: net.server_port,
                tls,
            },
            credentials: Credentials {
                token: token.into(),
                device_id: config.session.device_id.clone(),
                client_version: config.session.client_version.clone(),
            },
            transport: TransportConfig {
                frame: FrameConfig {
                    max_frame_bytes: net.max_frame_bytes,
                },
                ..TransportConfig::default()
            },
            session: SessionConfig {
                handshake_timeout: Duration::from_millis(net.handshake_timeout_ms),
                heartbeat_interval: Duration::from_millis(net.heartbeat_interval_ms),
                send_timeout: Duration::from_millis(net.send_timeout_ms),
            },
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(net.reconnect_initial_delay_ms),
                max_delay: Duration::from_millis(net.reconnect_max_delay_ms),
                max_attempts: net.reconnect_attempts,
                ..ReconnectConfig::default()
            },
            connect_timeout: Duration::from_millis(net.connect_timeout_ms),
        }
    }
}

/// The router plus its input queue; owned by whichever side is consuming.
struct Consumer {
    router: Router,
    events: DispatchReceiver<TransportEvent>,
}

impl Consumer {
    fn drain(&mut self) -> usize {
        let router = &mut self.router;
        self.events.drain_all(|event| router.handle_event(event))
    }
}

struct Running {
    cancel: CancellationToken,
    requests: RequestSender,
    consumer: JoinHandle<Consumer>,
    sender: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
}

/// Headless game client.
pub struct GameClient {
    settings: ClientSettings,
    transport: Transport,
    session: Session,
    notifications: Arc<Notifications>,
    correlations: PendingCorrelations,
    caches: CacheViews,
    idle: Option<Consumer>,
    running: Option<Running>,
}

impl GameClient {
    pub fn new(settings: ClientSettings) -> Self {
        let (events_tx, events) = dispatch_queue();
        let transport = Transport::new(settings.transport.clone(), events_tx);
        let session = Session::new(transport.clone(), settings.session.clone());
        let notifications = Arc::new(Notifications::new());
        let correlations = PendingCorrelations::new();
        let router = Router::new(correlations.clone(), Arc::clone(&notifications));
        let caches = router.views();

        Self {
            settings,
            transport,
            session,
            notifications,
            correlations,
            caches,
            idle: Some(Consumer { router, events }),
            running: None,
        }
    }

    /// Connect (with backoff), authenticate, seed the caches from the
    /// handshake snapshot, then start the background tasks.
    ///
    /// On a failed handshake the connection is closed again. `cancel`
    /// aborts the connect and handshake phases only.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<(), ClientError> {
        if self.running.is_some() {
            return Err(ClientError::AlreadyRunning);
        }
        let Some(mut consumer) = self.idle.take() else {
            return Err(ClientError::CachesLost);
        };
        consumer.drain();

        match self.connect_and_authenticate(&mut consumer, cancel).await {
            Ok(hello) => {
                consumer.router.apply_server_hello(hello);
                self.spawn_tasks(consumer);
                Ok(())
            }
            Err(e) => {
                self.idle = Some(consumer);
                Err(e)
            }
        }
    }

    async fn connect_and_authenticate(
        &self,
        consumer: &mut Consumer,
        cancel: &CancellationToken,
    ) -> Result<ServerHello, ClientError> {
        connect_with_backoff(
            &self.transport,
            &self.settings.endpoint,
            self.settings.connect_timeout,
            self.settings.reconnect.clone(),
            cancel,
        )
        .await?;

        let result = self
            .session
            .authenticate(&mut consumer.events, &self.settings.credentials, cancel)
            .await;
        match result {
            Ok(hello) => Ok(hello),
            Err(e) => {
                if let HandshakeError::AuthRejected(reason) = &e {
                    consumer.router.report_auth_failure(reason.clone());
                }
                self.transport.disconnect(DisconnectReason::Requested);
                consumer.drain();
                Err(e.into())
            }
        }
    }

    fn spawn_tasks(&mut self, consumer: Consumer) {
        let cancel = CancellationToken::new();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

        let sender = tokio::spawn(send_loop(
            self.transport.clone(),
            outbox_rx,
            self.correlations.clone(),
            self.settings.session.send_timeout,
            cancel.clone(),
        ));
        let heartbeat = self.session.spawn_heartbeat();
        let consumer = tokio::spawn(consume(consumer, cancel.clone()));

        self.running = Some(Running {
            cancel,
            requests: RequestSender::new(outbox_tx, self.correlations.clone()),
            consumer,
            sender,
            heartbeat,
        });
        tracing::info!(endpoint = %self.settings.endpoint, "client started");
    }

    /// Disconnect and wind down every task.
    ///
    /// Events still queued when the consumer stops are routed here, so the
    /// final `Disconnected` notification is always delivered.
    ///
    /// Every task is joined even if the consumer failed. In that case the
    /// caches went with it, this returns [`ClientError::ConsumerLost`] and
    /// later starts fail with [`ClientError::CachesLost`].
    pub async fn stop(&mut self) -> Result<(), ClientError> {
        let Some(running) = self.running.take() else {
            return Err(ClientError::NotRunning);
        };
        self.transport.disconnect(DisconnectReason::Requested);
        running.cancel.cancel();

        let consumer = running.consumer.await;

        if let Err(e) = running.sender.await {
            tracing::warn!(error = %e, "send loop ended abnormally");
        }
        if let Some(heartbeat) = running.heartbeat
            && let Err(e) = heartbeat.await
        {
            tracing::warn!(error = %e, "heartbeat ended abnormally");
        }

        match consumer {
            Ok(mut consumer) => {
                consumer.drain();
                self.idle = Some(consumer);
                tracing::info!("client stopped");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "consumer task lost, client cannot restart");
                Err(ClientError::ConsumerLost(e))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Request handle for the current run. `None` while stopped.
    pub fn requests(&self) -> Option<RequestSender> {
        self.running.as_ref().map(|running| running.requests.clone())
    }

    /// Read handles onto the caches.
    pub fn caches(&self) -> &CacheViews {
        &self.caches
    }

    pub fn notifications(&self) -> &Arc<Notifications> {
        &self.notifications
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.subscribe_state()
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }
}

impl Drop for GameClient {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            self.transport.disconnect(DisconnectReason::Requested);
        }
    }
}

async fn consume(mut consumer: Consumer, cancel: CancellationToken) -> Consumer {
    let Consumer { router, events } = &mut consumer;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            drained = events.wait_and_drain(|event| router.handle_event(event)) => {
                if drained.is_none() {
                    break;
                }
            }
        }
    }
    tracing::debug!(stats = ?router.stats(), "consumer stopped");
    consumer
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
