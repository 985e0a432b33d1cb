//! Per-connection chat history: append-only messages in arrival order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a history entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Written by this side.
    SelfSent,
    /// Received from the peer.
    Peer,
    ConnectionEstablished,
    ConnectionLost,
    FileNotifyStart,
    FileNotifyEnd,
    SystemWarning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
}

impl Message {
    pub fn new(sender: impl Into<String>, content: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            sender: sender.into(),
            content: content.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Notification authored by the local system rather than a person.
    pub fn system(content: impl Into<String>, kind: MessageKind) -> Self {
        Self::new(SYSTEM_SENDER, content, kind)
    }
}

pub const SYSTEM_SENDER: &str = "SYSTEM";

/// Ordered messages plus unread tracking. Entries are never reordered or removed.
#[derive(Debug, Default, Clone)]
pub struct History {
    messages: Vec<Message>,
    /// Total peer messages ever appended.
    new_messages: u64,
    read_mark: u64,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message. Returns false when it was suppressed as a repeated warning.
    pub fn push(&mut self, message: Message) -> bool {
        if message.kind == MessageKind::SystemWarning {
            if let Some(last) = self.messages.last() {
                if last.kind == MessageKind::SystemWarning && last.content == message.content {
                    return false;
                }
            }
        }
        if message.kind == MessageKind::Peer {
            self.new_messages += 1;
        }
        self.messages.push(message);
        true
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn new_messages(&self) -> u64 {
        self.new_messages
    }

    pub fn unread(&self) -> u64 {
        self.new_messages - self.read_mark
    }

    pub fn mark_read(&mut self) {
        self.read_mark = self.new_messages;
    }

    pub fn count(&self, kind: MessageKind) -> usize {
        self.messages.iter().filter(|m| m.kind == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_warning_is_suppressed() {
        let mut h = History::new();
        assert!(h.push(Message::system("No connection", MessageKind::SystemWarning)));
        assert!(!h.push(Message::system("No connection", MessageKind::SystemWarning)));
        assert_eq!(h.count(MessageKind::SystemWarning), 1);
    }

    #[test]
    fn warning_repeats_after_other_entry() {
        let mut h = History::new();
        h.push(Message::system("No connection", MessageKind::SystemWarning));
        h.push(Message::new("me", "hi", MessageKind::SelfSent));
        assert!(h.push(Message::system("No connection", MessageKind::SystemWarning)));
        assert_eq!(h.len(), 3);
    }

    #[test]
    fn different_warnings_both_kept() {
        let mut h = History::new();
        h.push(Message::system("No connection", MessageKind::SystemWarning));
        assert!(h.push(Message::system("File not found", MessageKind::SystemWarning)));
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn unread_counts_peer_messages_only() {
        let mut h = History::new();
        h.push(Message::new("bob", "one", MessageKind::Peer));
        h.push(Message::new("me", "two", MessageKind::SelfSent));
        h.push(Message::new("bob", "three", MessageKind::Peer));
        assert_eq!(h.unread(), 2);
        h.mark_read();
        assert_eq!(h.unread(), 0);
        assert_eq!(h.new_messages(), 2);
        h.push(Message::new("bob", "four", MessageKind::Peer));
        assert_eq!(h.unread(), 1);
    }

    #[test]
    fn arrival_order_is_kept() {
        let mut h = History::new();
        for i in 0..5 {
            h.push(Message::new("bob", i.to_string(), MessageKind::Peer));
        }
        let contents: Vec<_> = h.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["0", "1", "2", "3", "4"]);
    }
}
