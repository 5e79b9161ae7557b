//! Length-prefixed framing over async byte streams.
//!
//! Format: [4 bytes little-endian length][payload]. Oversized frames are
//! drained off the stream before the error is returned so the connection
//! stays aligned and the caller can keep reading.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single frame. Generous next to the largest per-tick
/// snapshot an observer can receive.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Errors that can occur during framing.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("frame too large: {0} bytes (max {1})")]
    FrameTooLarge(usize, usize),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Read one length-prefixed frame from a stream.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, FramingError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(FramingError::ConnectionClosed);
        }
        Err(e) => return Err(FramingError::Io(e)),
    }

    let len = u32::from_le_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        // Discard the payload to keep the stream aligned.
        let mut remaining = len as u64;
        let mut sink = tokio::io::sink();
        match tokio::io::copy(&mut stream.take(remaining), &mut sink).await {
            Ok(copied) => remaining -= copied,
            Err(e) => return Err(FramingError::Io(e)),
        }
        if remaining > 0 {
            return Err(FramingError::ConnectionClosed);
        }
        return Err(FramingError::FrameTooLarge(len, MAX_FRAME_SIZE));
    }

    if len == 0 {
        return Ok(Vec::new());
    }

    let mut buf = vec![0u8; len];
    match stream.read_exact(&mut buf).await {
        Ok(_) => Ok(buf),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FramingError::ConnectionClosed),
        Err(e) => Err(FramingError::Io(e)),
    }
}

/// Write one length-prefixed frame to a stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    data: &[u8],
) -> Result<(), FramingError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(FramingError::FrameTooLarge(data.len(), MAX_FRAME_SIZE));
    }

    let len_bytes = (data.len() as u32).to_le_bytes();
    stream.write_all(&len_bytes).await?;
    stream.write_all(data).await?;
    stream.flush().await?;

    Ok(())
}
