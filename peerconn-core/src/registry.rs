//! Registry of peer connections, in creation order.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;

use crate::connection::{PeerConnection, Role};
use crate::error::PeerConnError;
use crate::event::PeerEvent;

pub struct Registry {
    connections: RwLock<Vec<Arc<PeerConnection>>>,
    events: broadcast::Sender<PeerEvent>,
}

impl Registry {
    pub fn new(events: broadcast::Sender<PeerEvent>) -> Self {
        Self {
            connections: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Register a new connection. The id is a fresh UUID unless `custom_id` is given.
    pub fn create(&self, custom_id: Option<&str>) -> Result<String, PeerConnError> {
        let id = match custom_id {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let mut conns = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if conns.iter().any(|c| c.id() == id) {
            return Err(PeerConnError::DuplicateId(id));
        }
        conns.push(Arc::new(PeerConnection::new(id.clone(), self.events.clone())));
        tracing::info!(id = %id, "peer connection created");
        Ok(id)
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<PeerConnection>> {
        self.read().iter().find(|c| c.id() == id).cloned()
    }

    pub fn get(&self, id: &str) -> Result<Arc<PeerConnection>, PeerConnError> {
        self.lookup(id)
            .ok_or_else(|| PeerConnError::NotFound(id.to_string()))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<PeerConnection>> {
        let mut conns = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let pos = conns.iter().position(|c| c.id() == id)?;
        Some(conns.remove(pos))
    }

    pub fn all(&self) -> Vec<Arc<PeerConnection>> {
        self.read().clone()
    }

    pub fn list_client(&self) -> Vec<Arc<PeerConnection>> {
        self.filter(|c| c.role() == Role::Dialing)
    }

    pub fn list_server(&self) -> Vec<Arc<PeerConnection>> {
        self.filter(|c| c.role() == Role::Listening)
    }

    /// Both channels connected.
    pub fn list_active(&self) -> Vec<Arc<PeerConnection>> {
        self.filter(|c| c.message_connected() && c.file_connected())
    }

    /// Neither channel connected.
    pub fn list_inactive(&self) -> Vec<Arc<PeerConnection>> {
        self.filter(|c| !c.message_connected() && !c.file_connected())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn filter(&self, pred: impl Fn(&PeerConnection) -> bool) -> Vec<Arc<PeerConnection>> {
        self.read().iter().filter(|c| pred(c)).cloned().collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<PeerConnection>>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
