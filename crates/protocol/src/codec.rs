//! Multipart framing for the broker's stream transport
//!
//! A multipart message is an ordered list of opaque frames. On the wire:
//!
//! ```text
//! [Frame count: u8][Length: u32 (big-endian)][Frame bytes]...
//! ```
//!
//! Clients send `[empty, payload]`; the router prefixes the connection's
//! identity so the dispatcher sees `[identity, empty, payload]`.
//!
//! Maximum frame size is 32 MiB to prevent memory exhaustion.

use crate::error::{ProtocolError, Result};
use bytes::Bytes;
use std::io::{Read, Write};

#[cfg(feature = "async")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum allowed size of a single frame (32 MiB)
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Maximum number of frames in one multipart message
pub const MAX_FRAMES: usize = u8::MAX as usize;

/// Ordered list of frames
pub type Multipart = Vec<Bytes>;

/// Encode a multipart message
///
/// # Example
/// ```
/// use bytes::Bytes;
/// use protocol::{decode_multipart, encode_multipart};
///
/// let parts = vec![Bytes::new(), Bytes::from_static(b"{\"Type\":\"List\"}")];
/// let encoded = encode_multipart(&parts).unwrap();
/// assert_eq!(decode_multipart(&encoded).unwrap(), parts);
/// ```
pub fn encode_multipart(frames: &[Bytes]) -> Result<Vec<u8>> {
    if frames.len() > MAX_FRAMES {
        return Err(ProtocolError::FrameTooLarge {
            size: frames.len(),
            max: MAX_FRAMES,
        });
    }

    let total: usize = frames.iter().map(|f| 4 + f.len()).sum();
    let mut out = Vec::with_capacity(1 + total);
    out.push(frames.len() as u8);

    for frame in frames {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        out.extend_from_slice(frame);
    }

    Ok(out)
}

/// Decode a complete multipart message from a buffer
pub fn decode_multipart(buf: &[u8]) -> Result<Multipart> {
    let (&count, mut rest) = buf.split_first().ok_or(ProtocolError::IncompleteFrame {
        expected: 1,
        actual: 0,
    })?;

    let mut frames = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        if rest.len() < 4 {
            return Err(ProtocolError::IncompleteFrame {
                expected: 4,
                actual: rest.len(),
            });
        }
        let length = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }
        rest = &rest[4..];
        if rest.len() < length {
            return Err(ProtocolError::IncompleteFrame {
                expected: length,
                actual: rest.len(),
            });
        }
        frames.push(Bytes::copy_from_slice(&rest[..length]));
        rest = &rest[length..];
    }

    Ok(frames)
}

/// Write a multipart message to a blocking writer
pub fn write_multipart<W: Write>(writer: &mut W, frames: &[Bytes]) -> Result<()> {
    let encoded = encode_multipart(frames)?;
    writer.write_all(&encoded)?;
    Ok(())
}

/// Read one multipart message from a blocking reader
pub fn read_multipart<R: Read>(reader: &mut R) -> Result<Multipart> {
    let mut count = [0u8; 1];
    reader.read_exact(&mut count)?;

    let mut frames = Vec::with_capacity(usize::from(count[0]));
    for _ in 0..count[0] {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let length = u32::from_be_bytes(len_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut frame = vec![0u8; length];
        reader.read_exact(&mut frame)?;
        frames.push(Bytes::from(frame));
    }

    Ok(frames)
}

/// Read one multipart message from an async reader (e.g. a TCP stream)
#[cfg(feature = "async")]
pub async fn read_multipart_async<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Multipart> {
    let count = reader.read_u8().await?;

    let mut frames = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let length = reader.read_u32().await? as usize;

        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut frame = vec![0u8; length];
        reader.read_exact(&mut frame).await?;
        frames.push(Bytes::from(frame));
    }

    Ok(frames)
}

/// Write a multipart message to an async writer
#[cfg(feature = "async")]
pub async fn write_multipart_async<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frames: &[Bytes],
) -> Result<()> {
    let encoded = encode_multipart(frames)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
