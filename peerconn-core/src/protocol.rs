//! PeerConn wire protocol: packet types exchanged on the message and file channels.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cipher::KeyShare;
use crate::history::Message;

/// Current protocol version. Carried in the handshake packet.
pub const PROTOCOL_VERSION: u8 = 1;

/// Marker between a serialized [`FileDescriptor`] and the raw file bytes on the file channel.
pub const FILE_DELIMITER: &[u8] = b"PEERCONN_DELIMITER";

/// Reachable address of one side: display name, host and the two channel ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub name: String,
    pub local_address: String,
    pub message_port: u16,
    pub file_port: u16,
}

impl PeerDescriptor {
    pub fn new(
        name: impl Into<String>,
        local_address: impl Into<String>,
        message_port: u16,
        file_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            local_address: local_address.into(),
            message_port,
            file_port,
        }
    }

    pub fn message_addr(&self) -> String {
        format!("{}:{}", self.local_address, self.message_port)
    }

    pub fn file_addr(&self) -> String {
        format!("{}:{}", self.local_address, self.file_port)
    }
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} msg:{} file:{})",
            self.name, self.local_address, self.message_port, self.file_port
        )
    }
}

/// Header sent on the file channel before the raw bytes.
/// `name` is the file stem, `extension` has no leading dot and may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub extension: String,
    pub size_bytes: u64,
}

impl FileDescriptor {
    /// File name as it should appear on disk.
    pub fn file_name(&self) -> String {
        if self.extension.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, self.extension)
        }
    }
}

/// First and only unencrypted frame each side writes on the message channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakePacket {
    pub protocol_version: u8,
    pub sender: PeerDescriptor,
    pub key_share: KeyShare,
    /// Remote address of the stream as seen by the sender.
    pub observed_address: String,
}

/// Payload of every encrypted message-channel frame after the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPacket {
    pub sender: PeerDescriptor,
    pub message: Message,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_with_and_without_extension() {
        let with = FileDescriptor {
            name: "report".into(),
            extension: "pdf".into(),
            size_bytes: 10,
        };
        assert_eq!(with.file_name(), "report.pdf");
        let without = FileDescriptor {
            name: "Makefile".into(),
            extension: String::new(),
            size_bytes: 0,
        };
        assert_eq!(without.file_name(), "Makefile");
    }

    #[test]
    fn descriptor_addresses() {
        let d = PeerDescriptor::new("alice", "10.0.0.2", 9001, 9002);
        assert_eq!(d.message_addr(), "10.0.0.2:9001");
        assert_eq!(d.file_addr(), "10.0.0.2:9002");
    }

    #[test]
    fn delimiter_absent_from_serialized_descriptor() {
        let fd = FileDescriptor {
            name: "holiday photos".into(),
            extension: "tar".into(),
            size_bytes: u64::MAX,
        };
        let bytes = bincode::serialize(&fd).unwrap();
        assert!(!bytes
            .windows(FILE_DELIMITER.len())
            .any(|w| w == FILE_DELIMITER));
    }
}
