//! Facade: synchronous entry points that enqueue commands for the dispatcher, plus
//! read-only access to the registry.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::thread::JoinHandle;

use tokio::sync::{broadcast, mpsc};

use crate::config::Config;
use crate::connection::PeerConnection;
use crate::dispatcher::{Command, Dispatcher};
use crate::error::PeerConnError;
use crate::event::PeerEvent;
use crate::protocol::PeerDescriptor;
use crate::registry::Registry;

const EVENT_CAPACITY: usize = 1024;

/// Join handle of the thread started by [`PeerConn::spawn`].
pub type DispatcherThread = JoinHandle<Result<(), PeerConnError>>;

/// State shared by the facade and the dispatcher.
pub(crate) struct Shared {
    pub(crate) registry: Registry,
    config: RwLock<Config>,
    pub(crate) events: broadcast::Sender<PeerEvent>,
}

impl Shared {
    pub(crate) fn config(&self) -> Config {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn config_mut(&self) -> RwLockWriteGuard<'_, Config> {
        self.config.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle to the connection manager.
#[derive(Clone)]
pub struct PeerConn {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl PeerConn {
    /// Build a facade and its dispatcher. The caller drives `Dispatcher::run` on a runtime.
    pub fn new(config: Config) -> (PeerConn, Dispatcher) {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            registry: Registry::new(events.clone()),
            config: RwLock::new(config),
            events,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(shared.clone(), rx);
        (
            PeerConn {
                shared,
                commands: tx,
            },
            dispatcher,
        )
    }

    /// Start the dispatcher on its own thread with a single-threaded runtime.
    pub fn spawn(config: Config) -> std::io::Result<(PeerConn, DispatcherThread)> {
        let (facade, dispatcher) = PeerConn::new(config);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = std::thread::Builder::new()
            .name("peerconn-dispatcher".into())
            .spawn(move || runtime.block_on(dispatcher.run()))?;
        Ok((facade, handle))
    }

    /// Register a new connection and return its id. Takes effect immediately.
    pub fn create_peer_socket(&self, custom_id: Option<&str>) -> Result<String, PeerConnError> {
        self.shared.registry.create(custom_id)
    }

    /// Set the address a connection listens on (server) or dials (client).
    pub fn set_peersocket(&self, id: &str, endpoint: PeerDescriptor) -> Result<(), PeerConnError> {
        self.shared.registry.get(id)?.set_endpoint(endpoint);
        Ok(())
    }

    fn enqueue(&self, command: Command) -> Result<(), PeerConnError> {
        self.commands
            .send(command)
            .map_err(|_| PeerConnError::DispatcherStopped)
    }

    pub fn set_server(&self, id: &str) -> Result<(), PeerConnError> {
        self.enqueue(Command::SetServer(id.to_string()))
    }

    pub fn connect(&self, id: &str) -> Result<(), PeerConnError> {
        self.enqueue(Command::Connect(id.to_string()))
    }

    pub fn send_message(&self, id: &str, text: &str) -> Result<(), PeerConnError> {
        self.enqueue(Command::SendMessage(id.to_string(), text.to_string()))
    }

    pub fn send_file(&self, id: &str, path: impl Into<PathBuf>) -> Result<(), PeerConnError> {
        self.enqueue(Command::SendFile(id.to_string(), path.into()))
    }

    pub fn cancel_file(&self, id: &str) -> Result<(), PeerConnError> {
        self.enqueue(Command::CancelFile(id.to_string()))
    }

    pub fn change_download_dir(&self, dir: impl Into<PathBuf>) -> Result<(), PeerConnError> {
        self.enqueue(Command::ChangeDownloadDir(dir.into()))
    }

    /// `true` writes the config file, `false` reloads it.
    pub fn save_config(&self, save: bool) -> Result<(), PeerConnError> {
        self.enqueue(Command::SaveConfig(save))
    }

    pub fn close(&self, id: &str) -> Result<(), PeerConnError> {
        self.enqueue(Command::Close(id.to_string()))
    }

    pub fn close_all(&self) -> Result<(), PeerConnError> {
        self.enqueue(Command::CloseAll)
    }

    /// Close everything and stop the dispatcher.
    pub fn exit(&self) -> Result<(), PeerConnError> {
        self.enqueue(Command::Exit)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.shared.events.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<Arc<PeerConnection>> {
        self.shared.registry.lookup(id)
    }

    pub fn list_client(&self) -> Vec<Arc<PeerConnection>> {
        self.shared.registry.list_client()
    }

    pub fn list_server(&self) -> Vec<Arc<PeerConnection>> {
        self.shared.registry.list_server()
    }

    pub fn list_active(&self) -> Vec<Arc<PeerConnection>> {
        self.shared.registry.list_active()
    }

    pub fn list_inactive(&self) -> Vec<Arc<PeerConnection>> {
        self.shared.registry.list_inactive()
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Config {
        self.shared.config()
    }
}
