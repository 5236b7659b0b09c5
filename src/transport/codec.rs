//! Length-prefixed frame codec.
//!
//! Each frame is a 4-byte big-endian length followed by the prost-encoded
//! [`Frame`].

use bytes::{BufMut, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;
use crate::proto::Frame;

/// Encode a frame with its length prefix.
pub fn encode_frame(frame: &Frame, max_frame_bytes: usize) -> Result<BytesMut, TransportError> {
    let size = frame.encoded_len();
    if size > max_frame_bytes {
        return Err(TransportError::FrameTooLarge {
            size,
            limit: max_frame_bytes,
        });
    }

    let mut buf = BytesMut::with_capacity(4 + size);
    buf.put_u32(size as u32);
    frame.encode(&mut buf)?;
    Ok(buf)
}

/// Write one frame and flush.
pub async fn write_frame<W>(
    writer: &mut W,
    frame: &Frame,
    max_frame_bytes: usize,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_frame(frame, max_frame_bytes)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let size = match reader.read_u32().await {
        Ok(size) => size as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if size > max_frame_bytes {
        return Err(TransportError::FrameTooLarge {
            size,
            limit: max_frame_bytes,
        });
    }

    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf).await?;
    Ok(Some(Frame::decode(buf.as_slice())?))
}
