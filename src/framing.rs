//! # Wire Framing
//!
//! Length-prefixed message framing over a connected stream socket. A frame is
//! a 4-byte big-endian length followed by exactly that many payload bytes.
//! The payload is an opaque encrypted token; this layer knows nothing about
//! file semantics.
//!
//! Reads are bounded: a declared length above the configured maximum is
//! rejected before a single payload byte is read, so a hostile sender cannot
//! force unbounded buffering.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default maximum frame payload: 1 MiB.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Errors raised while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Peer declared a payload larger than the configured maximum.
    #[error("frame length {len} exceeds maximum allowed {max}")]
    Oversized { len: usize, max: usize },

    /// Connection closed before a full prefix or payload arrived.
    #[error("connection closed mid-frame")]
    ConnectionClosed,

    /// Underlying socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Write one frame: length prefix plus payload, fully drained.
pub async fn write_frame<W>(stream: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::Oversized {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame, enforcing `max_len` on the declared payload length.
pub async fn read_frame<R>(stream: &mut R, max_len: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    read_exact(stream, &mut prefix).await?;
    let len = u32::from_be_bytes(prefix) as usize;

    if len > max_len {
        return Err(FrameError::Oversized { len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    read_exact(stream, &mut payload).await?;
    Ok(payload)
}

async fn read_exact<R>(stream: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(FrameError::ConnectionClosed)
        }
        Err(e) => Err(FrameError::Io(e)),
    }
}
