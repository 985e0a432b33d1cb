//! Command dispatcher: the single consumer that executes queued commands in FIFO order.
//!
//! Every command is awaited before the next one is pulled, except `SendFile`, which is
//! spawned and left running so a long transfer never blocks other commands.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::channel;
use crate::cipher::Side;
use crate::config::Config;
use crate::connection::{ChannelState, PeerConnection, Role};
use crate::error::PeerConnError;
use crate::event::{Channel, EventKind, PeerEvent};
use crate::peerconn::Shared;
use crate::protocol::PeerDescriptor;
use crate::transfer::{self, ReceiveSettings, SendSlot};

/// A queued intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetServer(String),
    Connect(String),
    SendMessage(String, String),
    SendFile(String, PathBuf),
    CancelFile(String),
    ChangeDownloadDir(PathBuf),
    /// `true` writes the config file, `false` reloads it.
    SaveConfig(bool),
    Close(String),
    CloseAll,
    Exit,
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<Shared>, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        Self { shared, commands }
    }

    /// Run until `Exit` (or until every facade handle is dropped), then close all connections.
    pub async fn run(mut self) -> Result<(), PeerConnError> {
        tracing::info!("dispatcher started");
        while let Some(command) = self.commands.recv().await {
            tracing::debug!(?command, "dispatching");
            match command {
                Command::Exit => break,
                Command::SendFile(id, path) => self.spawn_send_file(&id, path),
                other => {
                    if let Err(e) = self.execute(other).await {
                        tracing::warn!(error = %e, "command failed");
                    }
                }
            }
        }
        let result = self.close_all().await;
        tracing::info!("dispatcher stopped");
        result
    }

    async fn execute(&self, command: Command) -> Result<(), PeerConnError> {
        match command {
            Command::SetServer(id) => self.set_server(&id).await,
            Command::Connect(id) => self.connect(&id).await,
            Command::SendMessage(id, text) => self.send_message(&id, &text).await,
            Command::CancelFile(id) => self.cancel_file(&id),
            Command::ChangeDownloadDir(dir) => {
                tracing::info!(dir = %dir.display(), "download directory changed");
                self.shared.config_mut().download_dir = dir;
                Ok(())
            }
            Command::SaveConfig(save) => self.config_file(save),
            Command::Close(id) => self.close(&id).await,
            Command::CloseAll => self.close_all().await,
            Command::SendFile(..) | Command::Exit => Ok(()),
        }
    }

    /// Look up a connection; an unknown id is reported to subscribers.
    fn connection(&self, id: &str) -> Result<Arc<PeerConnection>, PeerConnError> {
        self.shared.registry.get(id).map_err(|e| {
            let _ = self.shared.events.send(PeerEvent {
                id: id.to_string(),
                kind: EventKind::Rejected(e.to_string()),
            });
            e
        })
    }

    fn reject(conn: &PeerConnection, reason: &str) -> PeerConnError {
        conn.warn(reason);
        PeerConnError::CommandRejected(format!("{}: {reason}", conn.id()))
    }

    async fn set_server(&self, id: &str) -> Result<(), PeerConnError> {
        let conn = self.connection(id)?;
        match conn.role() {
            Role::Dialing => {
                return Err(Self::reject(&conn, "This connection dials out and cannot listen."))
            }
            Role::Listening => {
                return Err(Self::reject(&conn, "This connection is already listening."))
            }
            Role::Unassigned => {}
        }
        let Some(endpoint) = conn.endpoint() else {
            return Err(Self::reject(&conn, "No address set for this connection."));
        };
        conn.regenerate_key_share();

        let message_listener = bind(&conn, &endpoint.message_addr()).await?;
        let file_listener = bind(&conn, &endpoint.file_addr()).await?;
        let message_port = message_listener.local_addr()?.port();
        let file_port = file_listener.local_addr()?.port();
        let config = self.shared.config();
        let bound = PeerDescriptor {
            name: config.display_name.clone(),
            message_port,
            file_port,
            ..endpoint
        };
        conn.set_endpoint(bound.clone());
        conn.set_role(Role::Listening);
        conn.emit(EventKind::Listening {
            message_port,
            file_port,
        });
        tracing::info!(id = %id, message_port, file_port, "listening");

        let handshake_timeout = config.handshake_timeout();
        let task_conn = conn.clone();
        conn.track_task(tokio::spawn(async move {
            let Some(stream) = accept_one(&task_conn, &message_listener, Channel::Message).await
            else {
                return;
            };
            let side = Side::Listener;
            channel::run_message_channel(task_conn, stream, side, bound, handshake_timeout).await;
            drop(message_listener);
        }));
        let task_conn = conn.clone();
        let shared = self.shared.clone();
        conn.track_task(tokio::spawn(async move {
            let Some(stream) = accept_one(&task_conn, &file_listener, Channel::File).await else {
                return;
            };
            transfer::run_file_channel(task_conn, stream, move || shared.receive_settings()).await;
            drop(file_listener);
        }));
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<(), PeerConnError> {
        let conn = self.connection(id)?;
        if conn.role() == Role::Listening {
            return Err(Self::reject(&conn, "This connection is listening and cannot dial."));
        }
        let Some(endpoint) = conn.endpoint() else {
            return Err(Self::reject(&conn, "No address set for this connection."));
        };
        if !conn.mark_dialed() {
            return Err(Self::reject(
                &conn,
                "This connection has already dialed; close it and create a new one.",
            ));
        }
        conn.set_role(Role::Dialing);
        conn.set_peerdata(endpoint.clone());
        conn.regenerate_key_share();

        let config = self.shared.config();
        let message_stream = dial(&conn, &endpoint.message_addr(), &config).await?;
        let file_stream = dial(&conn, &endpoint.file_addr(), &config).await?;
        let local_ip = message_stream
            .local_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_default();
        let local = PeerDescriptor {
            name: config.display_name.clone(),
            local_address: local_ip,
            message_port: message_stream.local_addr().map(|a| a.port()).unwrap_or(0),
            file_port: file_stream.local_addr().map(|a| a.port()).unwrap_or(0),
        };
        tracing::info!(id = %id, peer = %endpoint, "dialed both channels");

        let handshake_timeout = config.handshake_timeout();
        conn.track_task(tokio::spawn(channel::run_message_channel(
            conn.clone(),
            message_stream,
            Side::Dialer,
            local,
            handshake_timeout,
        )));
        let shared = self.shared.clone();
        conn.track_task(tokio::spawn(transfer::run_file_channel(
            conn.clone(),
            file_stream,
            move || shared.receive_settings(),
        )));
        Ok(())
    }

    async fn send_message(&self, id: &str, text: &str) -> Result<(), PeerConnError> {
        let conn = self.connection(id)?;
        if text.is_empty() {
            return Ok(());
        }
        if !conn.message_connected() {
            conn.warn("No connection");
            return Ok(());
        }
        if let Err(e) = channel::send_message(&conn, text).await {
            tracing::warn!(id = %id, error = %e, "message not sent");
            conn.warn(format!("Message could not be sent: {e}"));
        }
        Ok(())
    }

    /// Claim the transfer slot here so commands queued behind this one (a cancel) see it.
    fn spawn_send_file(&self, id: &str, path: PathBuf) {
        let conn = match self.connection(id) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "send_file rejected");
                return;
            }
        };
        let Some(slot) = SendSlot::claim(conn) else {
            tracing::debug!(id = %id, "send_file rejected by connection state");
            return;
        };
        tracing::debug!(id = %id, path = %path.display(), "spawning file send");
        tokio::spawn(transfer::send_file(slot, path));
    }

    fn cancel_file(&self, id: &str) -> Result<(), PeerConnError> {
        let conn = self.connection(id)?;
        if !conn.is_sending_file() {
            return Err(Self::reject(&conn, "No file transfer to cancel"));
        }
        conn.request_cancel();
        Ok(())
    }

    fn config_file(&self, save: bool) -> Result<(), PeerConnError> {
        if save {
            self.shared.config().save()?;
            tracing::info!("config saved");
        } else {
            let path = self
                .shared
                .config()
                .path
                .ok_or(crate::config::ConfigError::NoPath)?;
            *self.shared.config_mut() = Config::load_from(&path)?;
            tracing::info!(path = %path.display(), "config reloaded");
        }
        Ok(())
    }

    /// Tear down both channels, wait for the receivers to record the loss, then unregister.
    async fn close(&self, id: &str) -> Result<(), PeerConnError> {
        let conn = self.connection(id)?;
        tracing::info!(id = %id, "closing");
        conn.begin_close();
        if let Some(mut sink) = conn.message_sink.lock().await.take() {
            let _ = sink.writer.shutdown().await;
        }
        if let Some(mut writer) = conn.file_writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let wait = self.shared.config().handshake_timeout();
        for mut task in conn.take_tasks() {
            if tokio::time::timeout(wait, &mut task).await.is_err() {
                tracing::warn!(id = %id, "channel task did not stop in time; aborting");
                task.abort();
            }
        }
        // Receivers that were aborted above never recorded their exit.
        for channel in [Channel::Message, Channel::File] {
            match conn.channel_state(channel) {
                ChannelState::Closed => {}
                ChannelState::Unconnected => conn.set_channel_state(channel, ChannelState::Closed),
                ChannelState::Handshaking | ChannelState::Connected | ChannelState::Closing => {
                    conn.finish_channel(channel, Some("receiver stopped during close".into()))
                }
            }
        }
        self.shared.registry.remove(id);
        conn.emit(EventKind::Closed);
        tracing::info!(id = %id, "closed");
        Ok(())
    }

    async fn close_all(&self) -> Result<(), PeerConnError> {
        tracing::info!(count = self.shared.registry.len(), "closing all connections");
        let mut first_err = None;
        for conn in self.shared.registry.all() {
            if let Err(e) = self.close(conn.id()).await {
                tracing::error!(id = %conn.id(), error = %e, "close failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn bind(conn: &PeerConnection, addr: &str) -> Result<TcpListener, PeerConnError> {
    TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(id = %conn.id(), addr, error = %e, "bind failed");
        conn.warn(format!("Could not listen on {addr}: {e}"));
        PeerConnError::Io(e)
    })
}

async fn dial(
    conn: &PeerConnection,
    addr: &str,
    config: &Config,
) -> Result<TcpStream, PeerConnError> {
    let connect = TcpStream::connect(addr);
    let result = match tokio::time::timeout(config.connect_timeout(), connect).await {
        Ok(r) => r,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connect timed out",
        )),
    };
    result.map_err(|e| {
        tracing::error!(id = %conn.id(), addr, error = %e, "dial failed");
        conn.warn(format!("Could not connect to {addr}: {e}"));
        PeerConnError::Io(e)
    })
}

/// Accept a single stream, or `None` if the connection shuts down first.
async fn accept_one(
    conn: &PeerConnection,
    listener: &TcpListener,
    channel: Channel,
) -> Option<TcpStream> {
    let shutdown = conn.shutdown_token();
    tokio::select! {
        r = listener.accept() => match r {
            Ok((stream, addr)) => {
                tracing::info!(id = %conn.id(), %channel, %addr, "accepted");
                Some(stream)
            }
            Err(e) => {
                tracing::error!(id = %conn.id(), %channel, error = %e, "accept failed");
                conn.finish_channel(channel, Some(e.to_string()));
                None
            }
        },
        _ = shutdown.cancelled() => None,
    }
}

impl Shared {
    pub(crate) fn receive_settings(&self) -> ReceiveSettings {
        let config = self.config();
        ReceiveSettings {
            download_dir: config.download_dir.clone(),
            chunk_timeout: config.chunk_timeout(),
        }
    }
}
