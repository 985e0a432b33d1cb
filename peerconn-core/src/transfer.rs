//! File channel: receiver loop writing incoming files to disk, and the chunked sender.
//!
//! Wire layout per file: `bincode(FileDescriptor) ‖ FILE_DELIMITER ‖ raw bytes`. File bytes are
//! not encrypted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::connection::{ChannelState, PeerConnection};
use crate::error::ChannelError;
use crate::event::Channel;
use crate::history::MessageKind;
use crate::protocol::FileDescriptor;
use crate::wire::{self, FrameDecodeError};

/// Chunk size for both sending and receiving.
pub const CHUNK_SIZE: usize = 4096;

/// Integer percentage of `done` out of `total`; an empty file is complete.
pub fn percentage(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as u128 * 100) / total as u128) as u8
}

/// Settings the receiver reads once per connection.
#[derive(Debug, Clone)]
pub(crate) struct ReceiveSettings {
    pub download_dir: PathBuf,
    pub chunk_timeout: Duration,
}

/// Own one file stream for the lifetime of the channel.
pub(crate) async fn run_file_channel(
    conn: Arc<PeerConnection>,
    stream: TcpStream,
    settings: impl Fn() -> ReceiveSettings,
) {
    let shutdown = conn.shutdown_token();
    let (reader, writer) = stream.into_split();
    *conn.file_writer.lock().await = Some(writer);
    if shutdown.is_cancelled() {
        conn.finish_channel(Channel::File, Some("closed before connecting".into()));
        return;
    }
    conn.set_channel_state(Channel::File, ChannelState::Connected);
    conn.notify(MessageKind::ConnectionEstablished, "File channel connected.");
    tracing::info!(id = %conn.id(), "file channel connected");

    let mut reader = BufReader::new(reader);
    match receive_files(&conn, &mut reader, &settings, &shutdown).await {
        Ok(()) => tracing::info!(id = %conn.id(), "file channel closed"),
        Err(ChannelError::AbruptDisconnect(e)) => {
            tracing::warn!(id = %conn.id(), error = %e, "file channel closed abruptly")
        }
        Err(ChannelError::NetworkUnreachable(e)) => {
            tracing::warn!(id = %conn.id(), error = %e, "network unreachable, file channel lost")
        }
        Err(e) => tracing::error!(id = %conn.id(), error = %e, "file channel failed"),
    }

    if let Some(mut writer) = conn.file_writer.lock().await.take() {
        let _ = writer.shutdown().await;
    }
    conn.finish_channel(Channel::File, None);
}

/// Read file after file until the stream ends. Returns `Ok` on a clean close.
pub(crate) async fn receive_files<R, F>(
    conn: &PeerConnection,
    reader: &mut R,
    settings: &F,
    shutdown: &CancellationToken,
) -> Result<(), ChannelError>
where
    R: AsyncBufRead + Unpin,
    F: Fn() -> ReceiveSettings,
{
    loop {
        let header = tokio::select! {
            h = wire::read_file_header(reader) => h,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let descriptor = match header {
            Ok(Some(d)) => d,
            Ok(None) => return Ok(()),
            Err(e @ FrameDecodeError::Decode(_)) => {
                // Whatever follows is payload of unknown length; framing cannot be recovered.
                conn.warn("Received a malformed file header; closing the file channel.");
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        conn.begin_receive();
        let outcome = receive_one(conn, reader, &descriptor, &settings(), shutdown).await;
        conn.end_receive();
        match outcome {
            Ok(()) | Err(ChannelError::FileIntegrityTimeout) => {}
            Err(ChannelError::StreamClosed) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Receive one file body. `FileIntegrityTimeout` leaves the channel usable,
/// `StreamClosed` means the stream ended or the connection shut down.
async fn receive_one<R: AsyncRead + Unpin>(
    conn: &PeerConnection,
    reader: &mut R,
    descriptor: &FileDescriptor,
    settings: &ReceiveSettings,
    shutdown: &CancellationToken,
) -> Result<(), ChannelError> {
    let file_name = descriptor.file_name();
    let size = descriptor.size_bytes;
    conn.set_file_percentage(0);
    conn.notify(
        MessageKind::FileNotifyStart,
        format!("Receiving {file_name} ({size} bytes)."),
    );

    let mut target = match open_destination(&settings.download_dir, descriptor).await {
        Ok((path, file)) => {
            tracing::info!(id = %conn.id(), path = %path.display(), size, "receiving file");
            Some(file)
        }
        Err(e) => {
            tracing::error!(id = %conn.id(), error = %e, "cannot create destination file");
            conn.warn(format!("Cannot save {file_name}: {e}. Incoming bytes are discarded."));
            None
        }
    };

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut received = 0u64;
    let outcome = loop {
        if received >= size {
            break Ok(());
        }
        let want = (size - received).min(CHUNK_SIZE as u64) as usize;
        let read = tokio::select! {
            r = tokio::time::timeout(settings.chunk_timeout, reader.read(&mut buf[..want])) => r,
            _ = shutdown.cancelled() => break Err(ChannelError::StreamClosed),
        };
        let n = match read {
            Err(_) => break Err(ChannelError::FileIntegrityTimeout),
            Ok(Ok(0)) => break Err(ChannelError::StreamClosed),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => break Err(ChannelError::from_io(e)),
        };
        if let Some(file) = target.as_mut() {
            if let Err(e) = file.write_all(&buf[..n]).await {
                tracing::error!(id = %conn.id(), error = %e, "write to destination failed");
                conn.warn(format!(
                    "Writing {file_name} failed: {e}. Incoming bytes are discarded."
                ));
                target = None;
            }
        }
        received += n as u64;
        conn.set_file_percentage(percentage(received, size));
    };
    if let Some(mut file) = target {
        let _ = file.flush().await;
    }

    match &outcome {
        Ok(()) => conn.notify(
            MessageKind::FileNotifyEnd,
            format!("{file_name} completely received."),
        ),
        Err(ChannelError::FileIntegrityTimeout) => {
            tracing::warn!(id = %conn.id(), received, size, "file chunk timed out");
            conn.notify(
                MessageKind::FileNotifyEnd,
                format!(
                    "{file_name} could not be received: timed out after {received} of {size} bytes."
                ),
            )
        }
        Err(_) => conn.notify(
            MessageKind::FileNotifyEnd,
            format!(
                "{file_name} could not be received: stream ended after {received} of {size} bytes."
            ),
        ),
    }
    outcome
}

/// Create `<download_dir>/<YYYY-MM-DD>/<name>`, adding ` (n)` to the stem if it exists.
async fn open_destination(
    download_dir: &Path,
    descriptor: &FileDescriptor,
) -> std::io::Result<(PathBuf, tokio::fs::File)> {
    let day = chrono::Local::now().format("%Y-%m-%d").to_string();
    let dir = download_dir.join(day);
    tokio::fs::create_dir_all(&dir).await?;

    let stem = sanitize(&descriptor.name).unwrap_or_else(|| "file".to_string());
    let ext = sanitize(&descriptor.extension);
    let name_for = |n: u32| {
        let stem = if n == 0 {
            stem.clone()
        } else {
            format!("{stem} ({n})")
        };
        match &ext {
            Some(ext) => format!("{stem}.{ext}"),
            None => stem,
        }
    };
    let mut n = 0;
    loop {
        let path = dir.join(name_for(n));
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Keep only the final path component; reject empty and dot names.
fn sanitize(name: &str) -> Option<String> {
    let last = name.rsplit(|c: char| c == '/' || c == '\\').next()?.trim();
    if last.is_empty() || last == "." || last == ".." {
        return None;
    }
    Some(last.to_string())
}

/// The connection's outbound transfer slot. Released when dropped.
pub(crate) struct SendSlot(Arc<PeerConnection>);

impl SendSlot {
    /// Claim the slot, or record why a send cannot start.
    pub(crate) fn claim(conn: Arc<PeerConnection>) -> Option<SendSlot> {
        if !conn.file_connected() {
            conn.warn("No connection");
            return None;
        }
        if !conn.try_begin_send() {
            conn.warn("A file transfer is already in progress.");
            return None;
        }
        Some(SendSlot(conn))
    }
}

impl Drop for SendSlot {
    fn drop(&mut self) {
        self.0.end_send();
    }
}

/// Send one file on a claimed slot. Spawned by the dispatcher and never joined.
pub(crate) async fn send_file(slot: SendSlot, path: PathBuf) {
    let conn = &slot.0;
    let descriptor = match describe(&path).await {
        Ok(d) => d,
        Err(e) => {
            conn.warn(format!("File not found: {} ({e})", path.display()));
            return;
        }
    };

    let file_name = descriptor.file_name();
    let shutdown = conn.shutdown_token();
    let result = {
        let mut writer = conn.file_writer.lock().await;
        match writer.as_mut() {
            Some(writer) => write_file(conn, writer, &path, &descriptor, &shutdown).await,
            None => Err(ChannelError::StreamClosed),
        }
    };
    match result {
        Ok(()) => {
            tracing::info!(id = %conn.id(), file = %file_name, "file sent");
            conn.notify(MessageKind::FileNotifyEnd, format!("{file_name} sent."));
        }
        Err(ChannelError::TransferCancelled) => {
            tracing::info!(id = %conn.id(), file = %file_name, "file transfer cancelled");
            conn.notify(MessageKind::FileNotifyEnd, format!("{file_name} cancelled."));
        }
        Err(e) => {
            tracing::warn!(id = %conn.id(), file = %file_name, error = %e, "file transfer failed");
            conn.notify(
                MessageKind::FileNotifyEnd,
                format!("{file_name} could not be sent: {e}"),
            );
        }
    }
}

async fn describe(path: &Path) -> std::io::Result<FileDescriptor> {
    let meta = tokio::fs::metadata(path).await?;
    if !meta.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(FileDescriptor {
        name,
        extension,
        size_bytes: meta.len(),
    })
}

/// Header then chunks; checks the cancel flag between chunks.
pub(crate) async fn write_file<W: AsyncWrite + Unpin>(
    conn: &PeerConnection,
    writer: &mut W,
    path: &Path,
    descriptor: &FileDescriptor,
    shutdown: &CancellationToken,
) -> Result<(), ChannelError> {
    let size = descriptor.size_bytes;
    let mut file = tokio::fs::File::open(path).await?;
    conn.set_file_percentage(0);
    conn.notify(
        MessageKind::FileNotifyStart,
        format!("Sending {} ({size} bytes).", descriptor.file_name()),
    );

    let header = wire::encode_file_header(descriptor)?;
    write_chunk(writer, &header, shutdown).await?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    while sent < size {
        if conn.take_cancel() {
            return Err(ChannelError::TransferCancelled);
        }
        let want = (size - sent).min(CHUNK_SIZE as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "file shrank while sending",
            )));
        }
        write_chunk(writer, &buf[..n], shutdown).await?;
        sent += n as u64;
        conn.set_file_percentage(percentage(sent, size));
    }
    Ok(())
}

async fn write_chunk<W: AsyncWrite + Unpin>(
    writer: &mut W,
    chunk: &[u8],
    shutdown: &CancellationToken,
) -> Result<(), ChannelError> {
    tokio::select! {
        r = async {
            writer.write_all(chunk).await?;
            writer.flush().await
        } => Ok(r?),
        _ = shutdown.cancelled() => Err(ChannelError::StreamClosed),
    }
}
