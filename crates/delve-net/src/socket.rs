//! Options set on the raw TCP socket before any TLS or frame traffic.

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// Keepalive probing for a game connection that may sit idle between
/// heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub idle: Duration,
    pub interval: Duration,
    /// Ignored on platforms without `TCP_KEEPCNT` support.
    pub probes: u32,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(60),
            interval: Duration::from_secs(10),
            probes: 3,
        }
    }
}

/// Socket options for the client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConfig {
    /// Requests are small and latency bound, so Nagle is off by default.
    pub nodelay: bool,
    /// `None` leaves OS keepalive disabled.
    pub keepalive: Option<Keepalive>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: Some(Keepalive::default()),
        }
    }
}

/// Apply `config` to a freshly connected stream.
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.nodelay)?;

    let Some(keepalive) = config.keepalive else {
        return Ok(());
    };
    let params = TcpKeepalive::new()
        .with_time(keepalive.idle)
        .with_interval(keepalive.interval);
    #[cfg(any(target_os = "linux", target_os = "windows"))]
    let params = params.with_retries(keepalive.probes);

    SockRef::from(stream).set_tcp_keepalive(&params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_client() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_defaults_enable_nodelay_and_keepalive() {
        let (client, _server) = loopback_client().await;
        configure_stream(&client, &SocketConfig::default()).unwrap();
        assert!(client.nodelay().unwrap());
        assert!(SockRef::from(&client).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_keepalive_none_leaves_it_off() {
        let (client, _server) = loopback_client().await;
        let config = SocketConfig {
            nodelay: false,
            keepalive: None,
        };
        configure_stream(&client, &config).unwrap();
        assert!(!client.nodelay().unwrap());
        assert!(!SockRef::from(&client).keepalive().unwrap());
    }
}
