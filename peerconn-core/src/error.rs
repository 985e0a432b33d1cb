//! Error taxonomy: channel-level failures stay inside their task, facade errors go to callers.

use std::io;

use crate::cipher::CipherError;
use crate::config::ConfigError;
use crate::wire::{FrameDecodeError, FrameEncodeError};

/// Failure of one channel (message or file). Always handled inside the owning task.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("handshake protocol error: {0}")]
    HandshakeProtocol(String),
    #[error("stream closed by peer")]
    StreamClosed,
    #[error("connection closed abruptly: {0}")]
    AbruptDisconnect(io::Error),
    #[error("network unreachable: {0}")]
    NetworkUnreachable(io::Error),
    #[error("file chunk timed out")]
    FileIntegrityTimeout,
    #[error("transfer cancelled")]
    TransferCancelled,
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("frame error: {0}")]
    Frame(String),
    #[error("i/o error: {0}")]
    Io(io::Error),
}

#[cfg(unix)]
const NET_UNREACHABLE_CODES: &[i32] = &[101, 100]; // ENETUNREACH, ENETDOWN
#[cfg(windows)]
const NET_UNREACHABLE_CODES: &[i32] = &[10051, 10050]; // WSAENETUNREACH, WSAENETDOWN
#[cfg(not(any(unix, windows)))]
const NET_UNREACHABLE_CODES: &[i32] = &[];

impl ChannelError {
    /// Classify an I/O error into abrupt disconnect, network loss or anything else.
    pub fn from_io(e: io::Error) -> Self {
        if let Some(code) = e.raw_os_error() {
            if NET_UNREACHABLE_CODES.contains(&code) {
                return ChannelError::NetworkUnreachable(e);
            }
        }
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ChannelError::AbruptDisconnect(e),
            _ => ChannelError::Io(e),
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        ChannelError::from_io(e)
    }
}

impl From<FrameDecodeError> for ChannelError {
    fn from(e: FrameDecodeError) -> Self {
        match e {
            FrameDecodeError::Io(io) => ChannelError::from_io(io),
            other => ChannelError::Frame(other.to_string()),
        }
    }
}

impl From<FrameEncodeError> for ChannelError {
    fn from(e: FrameEncodeError) -> Self {
        match e {
            FrameEncodeError::Io(io) => ChannelError::from_io(io),
            other => ChannelError::Frame(other.to_string()),
        }
    }
}

/// Error returned by facade and dispatcher operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerConnError {
    #[error("peer connection not found: {0}")]
    NotFound(String),
    #[error("peer connection id already in use: {0}")]
    DuplicateId(String),
    #[error("command rejected: {0}")]
    CommandRejected(String),
    #[error("dispatcher is not running")]
    DispatcherStopped,
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_is_abrupt_disconnect() {
        let e = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert!(matches!(
            ChannelError::from_io(e),
            ChannelError::AbruptDisconnect(_)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn enetunreach_is_network_unreachable() {
        let e = io::Error::from_raw_os_error(101);
        assert!(matches!(
            ChannelError::from_io(e),
            ChannelError::NetworkUnreachable(_)
        ));
    }

    #[test]
    fn other_io_stays_io() {
        let e = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(ChannelError::from_io(e), ChannelError::Io(_)));
    }

    #[test]
    fn frame_decode_io_is_classified() {
        let e = FrameDecodeError::Io(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(
            ChannelError::from(e),
            ChannelError::AbruptDisconnect(_)
        ));
        assert!(matches!(
            ChannelError::from(FrameDecodeError::TooLarge),
            ChannelError::Frame(_)
        ));
    }
}
