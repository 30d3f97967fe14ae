//! Length-prefixed message framing over a byte stream
//!
//! Every frame is a 4-byte big-endian length followed by that many payload
//! bytes. The handshake artifacts are the only unframed messages on the wire;
//! they are read with [`read_exact_message`] because their size is fixed by
//! the KEM.

use crate::QstpError;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a declared frame length (64 MiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Size of the length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Initial buffer capacity for a payload; the buffer grows with the bytes
/// that actually arrive rather than with the declared length.
const INITIAL_READ_CAPACITY: usize = 64 * 1024;

/// Read one length-prefixed frame.
pub async fn read_frame<S>(stream: &mut S) -> Result<Vec<u8>, QstpError>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| map_read_error(e, "frame length"))?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(QstpError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }

    read_exact_message(stream, len).await
}

/// Write one frame with its length prefix and flush.
pub async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> Result<(), QstpError>
where
    S: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(QstpError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let len = payload.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;

    Ok(())
}

/// Read exactly `len` bytes with no length prefix.
pub async fn read_exact_message<S>(stream: &mut S, len: usize) -> Result<Vec<u8>, QstpError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(len.min(INITIAL_READ_CAPACITY));
    (&mut *stream)
        .take(len as u64)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| map_read_error(e, "frame payload"))?;

    if buf.len() < len {
        return Err(QstpError::ConnectionClosed("frame payload"));
    }
    Ok(buf)
}

/// Write raw bytes with no length prefix and flush.
pub async fn write_raw<S>(stream: &mut S, data: &[u8]) -> Result<(), QstpError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

fn map_read_error(e: io::Error, what: &'static str) -> QstpError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        QstpError::ConnectionClosed(what)
    } else {
        QstpError::Io(e)
    }
}
