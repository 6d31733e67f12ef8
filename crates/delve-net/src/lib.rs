//! Framed TCP/TLS transport, wire messages, and the session lifecycle.

pub mod dispatch;
pub mod framing;
pub mod messages;
pub mod reconnect;
pub mod session;
pub mod socket;
mod tls;
pub mod transport;

pub use dispatch::{DispatchReceiver, DispatchSender, dispatch_queue};
pub use framing::{DEFAULT_MAX_FRAME_BYTES, FrameConfig, FrameError, read_frame, write_frame};
pub use messages::{Envelope, MessageError, MessageKind, decode_envelope, encode_envelope};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectState, connect_with_backoff};
pub use session::{Credentials, HandshakeError, ServerHello, Session, SessionConfig, unix_millis};
pub use socket::{Keepalive, SocketConfig};
pub use tls::TlsSettings;
pub use transport::{
    ConnectError, ConnectionState, ConnectionStateWatch, DisconnectReason, Endpoint, SendError,
    Transport, TransportConfig, TransportEvent, TransportStats,
};
