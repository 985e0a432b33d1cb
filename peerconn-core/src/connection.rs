//! PeerConnection: the full record of one peer relationship and both of its channels.
//!
//! Fields are written from the dispatcher, the two receiver tasks and the send task, which may
//! run on different threads, so plain state sits behind a short `std::sync::Mutex` that is
//! never held across an await, and the channel writers sit behind async mutexes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cipher::{CipherSuite, KeyShare, Sealer, SharedKey};
use crate::event::{Channel, EventKind, PeerEvent};
use crate::history::{History, Message, MessageKind};
use crate::protocol::PeerDescriptor;

/// Listening if it owns bound server sockets, dialing if it dialed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unassigned,
    Listening,
    Dialing,
}

/// Lifecycle of one channel. Only `Connected` counts as connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unconnected,
    Handshaking,
    Connected,
    /// A caller asked to close while the channel was up.
    Closing,
    Closed,
}

/// Encrypting writer of the message channel, installed once the handshake completes.
pub struct MessageSink {
    pub writer: OwnedWriteHalf,
    pub sealer: Sealer,
}

struct ConnState {
    role: Role,
    endpoint: Option<PeerDescriptor>,
    local: Option<PeerDescriptor>,
    peerdata: Option<PeerDescriptor>,
    /// Our address as the peer saw it during the handshake.
    observed_address: Option<String>,
    message: ChannelState,
    file: ChannelState,
    key_share: Option<KeyShare>,
    cipher_key: Option<SharedKey>,
    cipher_suite: Option<CipherSuite>,
    history: History,
    sending_file: bool,
    receiving_file: bool,
    file_percentage: u8,
    dialed: bool,
}

pub struct PeerConnection {
    id: String,
    state: Mutex<ConnState>,
    cancel_file: AtomicBool,
    shutdown: CancellationToken,
    pub(crate) message_sink: tokio::sync::Mutex<Option<MessageSink>>,
    pub(crate) file_writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerConnection {
    pub(crate) fn new(id: String, events: broadcast::Sender<PeerEvent>) -> Self {
        Self {
            id,
            state: Mutex::new(ConnState {
                role: Role::Unassigned,
                endpoint: None,
                local: None,
                peerdata: None,
                observed_address: None,
                message: ChannelState::Unconnected,
                file: ChannelState::Unconnected,
                key_share: None,
                cipher_key: None,
                cipher_suite: None,
                history: History::new(),
                sending_file: false,
                receiving_file: false,
                file_percentage: 0,
                dialed: false,
            }),
            cancel_file: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            message_sink: tokio::sync::Mutex::new(None),
            file_writer: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, kind: EventKind) {
        // No subscribers is fine.
        let _ = self.events.send(PeerEvent {
            id: self.id.clone(),
            kind,
        });
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.lock().role
    }

    pub(crate) fn set_role(&self, role: Role) {
        self.lock().role = role;
    }

    /// Address supplied by the caller: bound when listening, dialed when dialing.
    pub fn endpoint(&self) -> Option<PeerDescriptor> {
        self.lock().endpoint.clone()
    }

    pub(crate) fn set_endpoint(&self, endpoint: PeerDescriptor) {
        self.lock().endpoint = Some(endpoint);
    }

    /// This side's descriptor as announced in the handshake.
    pub fn local(&self) -> Option<PeerDescriptor> {
        self.lock().local.clone()
    }

    pub(crate) fn set_local(&self, local: PeerDescriptor) {
        self.lock().local = Some(local);
    }

    /// Descriptor of the remote side, once known.
    pub fn peerdata(&self) -> Option<PeerDescriptor> {
        self.lock().peerdata.clone()
    }

    pub(crate) fn set_peerdata(&self, peer: PeerDescriptor) {
        self.lock().peerdata = Some(peer);
    }

    pub fn observed_address(&self) -> Option<String> {
        self.lock().observed_address.clone()
    }

    pub(crate) fn set_observed_address(&self, address: String) {
        self.lock().observed_address = Some(address);
    }

    pub(crate) fn peer_name(&self) -> String {
        self.lock()
            .peerdata
            .as_ref()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "PEER".to_string())
    }

    pub fn channel_state(&self, channel: Channel) -> ChannelState {
        let s = self.lock();
        match channel {
            Channel::Message => s.message,
            Channel::File => s.file,
        }
    }

    pub fn message_connected(&self) -> bool {
        self.channel_state(Channel::Message) == ChannelState::Connected
    }

    pub fn file_connected(&self) -> bool {
        self.channel_state(Channel::File) == ChannelState::Connected
    }

    /// Generate this side's share. Called before accepting or dialing.
    pub(crate) fn regenerate_key_share(&self) {
        self.lock().key_share = Some(KeyShare::generate());
    }

    pub(crate) fn ensure_key_share(&self) -> KeyShare {
        self.lock()
            .key_share
            .get_or_insert_with(KeyShare::generate)
            .clone()
    }

    pub fn cipher_key(&self) -> Option<SharedKey> {
        self.lock().cipher_key.clone()
    }

    pub fn has_cipher_suite(&self) -> bool {
        self.lock().cipher_suite.is_some()
    }

    pub(crate) fn set_cipher(&self, key: SharedKey, suite: CipherSuite) {
        let mut s = self.lock();
        s.cipher_key = Some(key);
        s.cipher_suite = Some(suite);
    }

    /// Marks a dialing connection as used; returns false if it had already dialed.
    pub(crate) fn mark_dialed(&self) -> bool {
        let mut s = self.lock();
        !std::mem::replace(&mut s.dialed, true)
    }

    /// Snapshot of the history.
    pub fn history(&self) -> Vec<Message> {
        self.lock().history.messages().to_vec()
    }

    pub fn unread(&self) -> u64 {
        self.lock().history.unread()
    }

    pub fn mark_read(&self) {
        self.lock().history.mark_read();
    }

    pub fn count(&self, kind: MessageKind) -> usize {
        self.lock().history.count(kind)
    }

    /// Append to history and notify subscribers. Repeated identical warnings are dropped.
    pub(crate) fn push(&self, message: Message) {
        let appended = self.lock().history.push(message.clone());
        if appended {
            self.emit(EventKind::History(message));
        }
    }

    pub(crate) fn notify(&self, kind: MessageKind, content: impl Into<String>) {
        self.push(Message::system(content, kind));
    }

    pub(crate) fn warn(&self, content: impl Into<String>) {
        self.notify(MessageKind::SystemWarning, content);
    }

    pub(crate) fn set_channel_state(&self, channel: Channel, new: ChannelState) {
        {
            let mut s = self.lock();
            match channel {
                Channel::Message => s.message = new,
                Channel::File => s.file = new,
            }
        }
        if new == ChannelState::Connected {
            self.emit(EventKind::ChannelUp(channel));
        }
    }

    /// Move connected channels to `Closing` so their receivers report an intentional disconnect.
    pub(crate) fn begin_close(&self) {
        let mut went_down = Vec::new();
        {
            let mut guard = self.lock();
            let s = &mut *guard;
            for (channel, state) in [
                (Channel::Message, &mut s.message),
                (Channel::File, &mut s.file),
            ] {
                if *state == ChannelState::Connected {
                    *state = ChannelState::Closing;
                    went_down.push(channel);
                }
            }
        }
        for channel in went_down {
            self.emit(EventKind::ChannelDown(channel));
        }
        self.shutdown.cancel();
    }

    /// Receiver exit path. Records exactly one lost notification per true-to-false transition.
    pub(crate) fn finish_channel(&self, channel: Channel, failure: Option<String>) {
        let previous = {
            let mut s = self.lock();
            let state = match channel {
                Channel::Message => &mut s.message,
                Channel::File => &mut s.file,
            };
            std::mem::replace(state, ChannelState::Closed)
        };
        let label = match channel {
            Channel::Message => "Message",
            Channel::File => "File",
        };
        match previous {
            ChannelState::Connected => {
                self.emit(EventKind::ChannelDown(channel));
                self.notify(
                    MessageKind::ConnectionLost,
                    format!("{label} channel closed abruptly."),
                );
            }
            ChannelState::Closing => {
                self.notify(
                    MessageKind::ConnectionLost,
                    format!("{label} channel disconnected."),
                );
            }
            ChannelState::Unconnected | ChannelState::Handshaking => {
                let reason = failure.unwrap_or_else(|| "closed before connecting".to_string());
                self.warn(format!("{label} channel could not be established: {reason}"));
            }
            ChannelState::Closed => {}
        }
    }

    pub fn in_file_transfer(&self) -> bool {
        let s = self.lock();
        s.sending_file || s.receiving_file
    }

    pub fn file_percentage(&self) -> u8 {
        self.lock().file_percentage
    }

    pub(crate) fn set_file_percentage(&self, percentage: u8) {
        let changed = {
            let mut s = self.lock();
            std::mem::replace(&mut s.file_percentage, percentage) != percentage
        };
        if changed {
            self.emit(EventKind::FileProgress(percentage));
        }
    }

    /// Claim the outbound transfer slot. False if any transfer is in progress.
    pub(crate) fn try_begin_send(&self) -> bool {
        let mut s = self.lock();
        if s.sending_file || s.receiving_file {
            return false;
        }
        s.sending_file = true;
        s.file_percentage = 0;
        true
    }

    /// Release the outbound slot. A cancel that arrived after the last chunk is dropped here.
    pub(crate) fn end_send(&self) {
        self.lock().sending_file = false;
        self.cancel_file.store(false, Ordering::SeqCst);
    }

    pub(crate) fn begin_receive(&self) {
        let mut s = self.lock();
        s.receiving_file = true;
        s.file_percentage = 0;
    }

    pub(crate) fn end_receive(&self) {
        self.lock().receiving_file = false;
    }

    pub fn is_sending_file(&self) -> bool {
        self.lock().sending_file
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_file.store(true, Ordering::SeqCst);
    }

    /// Read and reset the cancel flag.
    pub(crate) fn take_cancel(&self) -> bool {
        self.cancel_file.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn track_task(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    pub(crate) fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.lock();
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("role", &s.role)
            .field("message", &s.message)
            .field("file", &s.file)
            .field("history_len", &s.history.len())
            .finish()
    }
}
