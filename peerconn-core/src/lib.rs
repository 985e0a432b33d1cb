//! Peer-to-peer connection manager.
//! Each connection pairs an encrypted message channel with a raw file channel; commands are
//! queued through `PeerConn` and executed in order by a `Dispatcher`.

mod channel;
pub mod cipher;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod handshake;
pub mod history;
pub mod peerconn;
pub mod protocol;
pub mod registry;
pub mod transfer;
pub mod wire;

pub use cipher::{CipherSuite, KeyShare, SharedKey, Side};
pub use config::Config;
pub use connection::{ChannelState, PeerConnection, Role};
pub use dispatcher::{Command, Dispatcher};
pub use error::{ChannelError, PeerConnError};
pub use event::{Channel, EventKind, PeerEvent};
pub use history::{Message, MessageKind};
pub use peerconn::{DispatcherThread, PeerConn};
pub use protocol::{FileDescriptor, PeerDescriptor, PROTOCOL_VERSION};
