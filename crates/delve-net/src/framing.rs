//! Frame layer: a u32 little-endian body length, then the body.
//!
//! ```text
//! [len: u32 LE][body: len bytes]
//! ```
//!
//! `len` counts only the body. Zero is never valid since each frame holds
//! one encoded envelope.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PREFIX_LEN: usize = 4;

/// 10 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 10 * 1024 * 1024;

/// Limits shared by the read and write sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    pub max_frame_bytes: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length is zero")]
    InvalidLength,

    /// `size` is the advertised or attempted body length.
    #[error("payload size {size} exceeds maximum {max}")]
    OversizedPayload { size: u64, max: u32 },

    #[error("stream ended inside a frame")]
    ShortRead,

    #[error("frame I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Validate a body length without touching any stream.
pub fn check_len(len: u64, config: &FrameConfig) -> Result<(), FrameError> {
    match len {
        0 => Err(FrameError::InvalidLength),
        n if n > u64::from(config.max_frame_bytes) => Err(FrameError::OversizedPayload {
            size: n,
            max: config.max_frame_bytes,
        }),
        _ => Ok(()),
    }
}

/// Read one frame body.
///
/// A bad prefix is reported before any body byte is consumed, so a hostile
/// length never causes an allocation.
pub async fn read_frame<R>(reader: &mut R, config: &FrameConfig) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; PREFIX_LEN];
    reader.read_exact(&mut prefix).await.map_err(short_read)?;
    let len = u32::from_le_bytes(prefix);
    check_len(u64::from(len), config)?;

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await.map_err(short_read)?;
    Ok(body)
}

/// Write one frame and flush. Nothing is written if `body` fails
/// [`check_len`].
pub async fn write_frame<W>(writer: &mut W, body: &[u8], config: &FrameConfig) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    check_len(body.len() as u64, config)?;
    let prefix = (body.len() as u32).to_le_bytes();
    writer.write_all(&prefix).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

fn short_read(e: std::io::Error) -> FrameError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof => FrameError::ShortRead,
        _ => FrameError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn limit(max_frame_bytes: u32) -> FrameConfig {
        FrameConfig { max_frame_bytes }
    }

    #[tokio::test]
    async fn test_wire_layout_is_le_prefix_then_body() {
        let (mut tx, mut rx) = duplex(64);
        write_frame(&mut tx, b"gem", &FrameConfig::default())
            .await
            .unwrap();
        drop(tx);

        let mut raw = Vec::new();
        rx.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw, [3, 0, 0, 0, b'g', b'e', b'm']);
    }

    #[tokio::test]
    async fn test_body_larger_than_pipe_buffer() {
        // A 7-byte pipe forces every read_exact to resume several times.
        let (mut tx, mut rx) = duplex(7);
        let body: Vec<u8> = (0..=255).collect();
        let config = limit(256);

        let sent = body.clone();
        let writer = tokio::spawn(async move { write_frame(&mut tx, &sent, &config).await });
        assert_eq!(read_frame(&mut rx, &config).await.unwrap(), body);
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_consecutive_frames_keep_boundaries() {
        let (mut tx, mut rx) = duplex(256);
        let config = FrameConfig::default();
        for body in [&b"slot"[..], b"x", b"mission list"] {
            write_frame(&mut tx, body, &config).await.unwrap();
        }
        assert_eq!(read_frame(&mut rx, &config).await.unwrap(), b"slot");
        assert_eq!(read_frame(&mut rx, &config).await.unwrap(), b"x");
        assert_eq!(read_frame(&mut rx, &config).await.unwrap(), b"mission list");
    }

    #[tokio::test]
    async fn test_oversized_prefix_consumes_only_the_prefix() {
        let (mut tx, mut rx) = duplex(64);
        tx.write_all(&20_000_000u32.to_le_bytes()).await.unwrap();
        tx.write_all(b"tail").await.unwrap();

        let err = read_frame(&mut rx, &limit(10_000_000)).await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::OversizedPayload {
                size: 20_000_000,
                max: 10_000_000
            }
        ));

        let mut rest = [0u8; 4];
        rx.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"tail");
    }

    #[tokio::test]
    async fn test_rejected_writes_leave_stream_untouched() {
        let (mut tx, mut rx) = duplex(64);
        let config = limit(8);
        assert!(matches!(
            write_frame(&mut tx, &[1; 9], &config).await,
            Err(FrameError::OversizedPayload { size: 9, max: 8 })
        ));
        assert!(matches!(
            write_frame(&mut tx, &[], &config).await,
            Err(FrameError::InvalidLength)
        ));
        drop(tx);

        let mut raw = Vec::new();
        rx.read_to_end(&mut raw).await.unwrap();
        assert!(raw.is_empty());
    }

    #[tokio::test]
    async fn test_zero_prefix_is_invalid() {
        let (mut tx, mut rx) = duplex(64);
        tx.write_all(&[0; PREFIX_LEN]).await.unwrap();
        assert!(matches!(
            read_frame(&mut rx, &FrameConfig::default()).await,
            Err(FrameError::InvalidLength)
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_short_read() {
        let (tx, mut rx) = duplex(64);
        drop(tx);
        assert!(matches!(
            read_frame(&mut rx, &FrameConfig::default()).await,
            Err(FrameError::ShortRead)
        ));

        let (mut tx, mut rx) = duplex(64);
        tx.write_all(&10u32.to_le_bytes()).await.unwrap();
        tx.write_all(b"abc").await.unwrap();
        drop(tx);
        assert!(matches!(
            read_frame(&mut rx, &FrameConfig::default()).await,
            Err(FrameError::ShortRead)
        ));
    }

    #[test]
    fn test_check_len_bounds() {
        let config = limit(100);
        assert!(check_len(1, &config).is_ok());
        assert!(check_len(100, &config).is_ok());
        assert!(check_len(101, &config).is_err());
        assert!(matches!(check_len(0, &config), Err(FrameError::InvalidLength)));
    }
}
