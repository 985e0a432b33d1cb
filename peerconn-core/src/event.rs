//! Notifications for presentation collaborators, tagged with the connection id.

use crate::history::Message;

/// One of the two channels of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Message,
    File,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Message => f.write_str("message"),
            Channel::File => f.write_str("file"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub id: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Server sockets bound; ports are the actual bound ports.
    Listening { message_port: u16, file_port: u16 },
    ChannelUp(Channel),
    ChannelDown(Channel),
    /// A message was appended to the connection's history.
    History(Message),
    /// Percentage of the current file transfer.
    FileProgress(u8),
    /// A command was refused and there was no history to record it in.
    Rejected(String),
    /// The connection was removed from the registry.
    Closed,
}
