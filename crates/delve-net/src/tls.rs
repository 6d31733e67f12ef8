//! TLS upgrade for endpoints that request transport security.
//!
//! Uses `tokio-rustls` with the ring provider and the webpki root set. The
//! upgraded stream feeds the same framed path as a plain socket.

use std::sync::{Arc, OnceLock};

use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};

use crate::transport::ConnectError;

/// Transport-security parameters for an [`Endpoint`](crate::Endpoint).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    /// Name verified against the server certificate.
    pub server_name: String,
}

impl TlsSettings {
    /// Verify the certificate against `server_name`.
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
        }
    }
}

fn client_config() -> Result<Arc<ClientConfig>, ConnectError> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    if let Some(config) = CONFIG.get() {
        return Ok(Arc::clone(config));
    }

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ConnectError::Tls(std::io::Error::other(e)))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(Arc::clone(CONFIG.get_or_init(|| Arc::new(config))))
}

/// Run the TLS client handshake over an already connected socket.
pub(crate) async fn upgrade(
    tcp: TcpStream,
    settings: &TlsSettings,
) -> Result<TlsStream<TcpStream>, ConnectError> {
    let name = ServerName::try_from(settings.server_name.clone())
        .map_err(|_| ConnectError::InvalidServerName(settings.server_name.clone()))?;

    let connector = TlsConnector::from(client_config()?);
    let stream = connector.connect(name, tcp).await.map_err(ConnectError::Tls)?;
    tracing::debug!(server_name = %settings.server_name, "TLS session established");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_is_cached() {
        let a = client_config().unwrap();
        let b = client_config().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_invalid_server_name_rejected_before_handshake() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tcp = TcpStream::connect(addr).await.unwrap();

        let result = upgrade(tcp, &TlsSettings::new("not a host name!")).await;
        assert!(matches!(result, Err(ConnectError::InvalidServerName(_))));
    }
}
