//! Framing: length-prefix (4 bytes LE) + bincode payload on the message channel,
//! delimiter-terminated bincode header on the file channel.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{FileDescriptor, FILE_DELIMITER};

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB
const MAX_FILE_HEADER_LEN: usize = 64 * 1024;

/// Serialize a packet with bincode (unframed).
pub fn encode_packet<T: Serialize>(packet: &T) -> Result<Vec<u8>, FrameEncodeError> {
    Ok(bincode::serialize(packet)?)
}

pub fn decode_packet<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameDecodeError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Wrap a payload into a single frame: 4 bytes LE length + payload.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameEncodeError> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` when the stream ends cleanly on a frame boundary;
/// an end of stream inside a frame surfaces as `UnexpectedEof`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, FrameDecodeError> {
    let mut len_buf = [0u8; LEN_SIZE];
    let first = reader.read(&mut len_buf).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_buf[first..]).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Header for the file channel: bincode descriptor followed by [`FILE_DELIMITER`].
pub fn encode_file_header(descriptor: &FileDescriptor) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = bincode::serialize(descriptor)?;
    out.extend_from_slice(FILE_DELIMITER);
    Ok(out)
}

/// Read up to and including the delimiter and decode the descriptor before it.
/// `Ok(None)` when the stream ends before any header byte.
pub async fn read_file_header<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<FileDescriptor>, FrameDecodeError> {
    let last = FILE_DELIMITER[FILE_DELIMITER.len() - 1];
    let mut limited = (&mut *reader).take((MAX_FILE_HEADER_LEN + FILE_DELIMITER.len()) as u64);
    let mut buf = Vec::new();
    loop {
        let n = limited.read_until(last, &mut buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            if limited.limit() == 0 {
                return Err(FrameDecodeError::TooLarge);
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        if buf.ends_with(FILE_DELIMITER) {
            break;
        }
    }
    let header = &buf[..buf.len() - FILE_DELIMITER.len()];
    Ok(Some(bincode::deserialize(header)?))
}

/// Error encoding a packet or frame (bincode, size limit or write failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
    #[error("write error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error decoding a frame (too large, bincode failure or read failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
}
