//! Message channel receiver: handshake, then decrypt and record every incoming chat packet.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::cipher::{Opener, Side};
use crate::connection::{ChannelState, MessageSink, PeerConnection};
use crate::error::ChannelError;
use crate::event::Channel;
use crate::handshake::{self, LocalHello};
use crate::history::{Message, MessageKind};
use crate::protocol::{ChatPacket, PeerDescriptor};
use crate::wire;

/// Own one message stream for the lifetime of the channel.
pub(crate) async fn run_message_channel(
    conn: Arc<PeerConnection>,
    stream: TcpStream,
    side: Side,
    local: PeerDescriptor,
    handshake_timeout: Duration,
) {
    let shutdown = conn.shutdown_token();
    let observed_address = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let (mut reader, mut writer) = stream.into_split();
    conn.set_channel_state(Channel::Message, ChannelState::Handshaking);

    let share = conn.ensure_key_share();
    let hello = LocalHello {
        descriptor: &local,
        share: &share,
        observed_address,
    };
    let outcome = tokio::select! {
        r = handshake::exchange(side, &mut reader, &mut writer, hello, handshake_timeout) => r,
        _ = shutdown.cancelled() => Err(ChannelError::StreamClosed),
    };
    let outcome = match outcome {
        Ok(o) if !shutdown.is_cancelled() => o,
        Ok(_) => {
            conn.finish_channel(Channel::Message, Some("closed during handshake".into()));
            return;
        }
        Err(e) => {
            tracing::warn!(id = %conn.id(), error = %e, "handshake failed");
            let _ = writer.shutdown().await;
            conn.finish_channel(Channel::Message, Some(e.to_string()));
            return;
        }
    };

    let peer_name = outcome.peer.name.clone();
    conn.set_local(local);
    conn.set_peerdata(outcome.peer);
    if !outcome.observed_address.is_empty() {
        conn.set_observed_address(outcome.observed_address);
    }
    conn.set_cipher(outcome.key, outcome.suite.clone());
    let (sealer, opener) = outcome.suite.split();
    *conn.message_sink.lock().await = Some(MessageSink { writer, sealer });
    conn.set_channel_state(Channel::Message, ChannelState::Connected);
    conn.notify(
        MessageKind::ConnectionEstablished,
        format!("Message channel connected to {peer_name}."),
    );
    tracing::info!(id = %conn.id(), peer = %peer_name, "message channel connected");

    match receive_messages(&conn, &mut reader, opener, &shutdown).await {
        Ok(()) => tracing::info!(id = %conn.id(), "message channel closed"),
        Err(ChannelError::AbruptDisconnect(e)) => {
            tracing::warn!(id = %conn.id(), error = %e, "message channel closed abruptly")
        }
        Err(ChannelError::NetworkUnreachable(e)) => {
            tracing::warn!(id = %conn.id(), error = %e, "network unreachable, message channel lost")
        }
        Err(e) => tracing::error!(id = %conn.id(), error = %e, "message channel failed"),
    }

    if let Some(mut sink) = conn.message_sink.lock().await.take() {
        let _ = sink.writer.shutdown().await;
    }
    conn.finish_channel(Channel::Message, None);
}

/// Read frames until the peer closes, the connection shuts down or an error occurs.
async fn receive_messages<R: AsyncRead + Unpin>(
    conn: &PeerConnection,
    reader: &mut R,
    mut opener: Opener,
    shutdown: &CancellationToken,
) -> Result<(), ChannelError> {
    loop {
        let frame = tokio::select! {
            f = wire::read_frame(reader) => f?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let Some(ciphertext) = frame else {
            return Ok(());
        };
        let plain = opener.open(&ciphertext)?;
        let packet: ChatPacket = wire::decode_packet(&plain)?;
        tracing::debug!(id = %conn.id(), bytes = plain.len(), "message received");
        conn.push(Message::new(
            packet.sender.name,
            packet.message.content,
            MessageKind::Peer,
        ));
    }
}

/// Encrypt and write one chat message, then record it as sent.
pub(crate) async fn send_message(conn: &PeerConnection, text: &str) -> Result<(), ChannelError> {
    let local = conn.local().unwrap_or_else(|| PeerDescriptor::new("ME", "", 0, 0));
    let message = Message::new(local.name.clone(), text, MessageKind::SelfSent);
    let packet = ChatPacket {
        sender: local,
        message: message.clone(),
    };
    let plain = wire::encode_packet(&packet)?;
    {
        let mut guard = conn.message_sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(ChannelError::StreamClosed);
        };
        let ciphertext = sink.sealer.seal(&plain)?;
        wire::write_frame(&mut sink.writer, &ciphertext).await?;
    }
    conn.push(message);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{CipherSuite, KeyShare, SharedKey};
    use tokio::sync::broadcast;

    fn suites() -> (CipherSuite, CipherSuite) {
        let shared = SharedKey::combine(&KeyShare::generate(), &KeyShare::generate());
        (
            CipherSuite::derive(&shared, Side::Listener),
            CipherSuite::derive(&shared, Side::Dialer),
        )
    }

    fn frames(suite: &CipherSuite, texts: &[&str]) -> Vec<u8> {
        let (mut seal, _) = suite.split();
        let sender = PeerDescriptor::new("bob", "127.0.0.1", 1, 2);
        let mut out = Vec::new();
        for text in texts {
            let packet = ChatPacket {
                sender: sender.clone(),
                message: Message::new("bob", *text, MessageKind::SelfSent),
            };
            let c = seal.seal(&wire::encode_packet(&packet).unwrap()).unwrap();
            out.extend_from_slice(&wire::encode_frame(&c).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn peer_messages_land_in_history() {
        let (tx, _) = broadcast::channel(16);
        let conn = PeerConnection::new("c1".into(), tx);
        let (listener, dialer) = suites();
        let bytes = frames(&dialer, &["hello", "again"]);
        let (_, opener) = listener.split();
        let mut reader = bytes.as_slice();
        receive_messages(&conn, &mut reader, opener, &CancellationToken::new())
            .await
            .unwrap();
        let history = conn.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[0].kind, MessageKind::Peer);
        assert_eq!(history[0].sender, "bob");
        assert_eq!(conn.unread(), 2);
    }

    #[tokio::test]
    async fn truncated_frame_is_abrupt() {
        let (tx, _) = broadcast::channel(16);
        let conn = PeerConnection::new("c1".into(), tx);
        let (listener, dialer) = suites();
        let bytes = frames(&dialer, &["hello"]);
        let (_, opener) = listener.split();
        let mut reader = &bytes[..bytes.len() - 3];
        let r = receive_messages(&conn, &mut reader, opener, &CancellationToken::new()).await;
        assert!(matches!(r, Err(ChannelError::AbruptDisconnect(_))));
    }

    #[tokio::test]
    async fn undecryptable_frame_ends_loop() {
        let (tx, _) = broadcast::channel(16);
        let conn = PeerConnection::new("c1".into(), tx);
        let (_, dialer) = suites();
        let (other, _) = suites();
        let bytes = frames(&dialer, &["hello"]);
        let (_, opener) = other.split();
        let mut reader = bytes.as_slice();
        let r = receive_messages(&conn, &mut reader, opener, &CancellationToken::new()).await;
        assert!(matches!(r, Err(ChannelError::Cipher(_))));
        assert!(conn.history().is_empty());
    }

    #[tokio::test]
    async fn send_without_sink_is_rejected() {
        let (tx, _) = broadcast::channel(16);
        let conn = PeerConnection::new("c1".into(), tx);
        assert!(matches!(
            send_message(&conn, "hi").await,
            Err(ChannelError::StreamClosed)
        ));
        assert!(conn.history().is_empty());
    }
}
