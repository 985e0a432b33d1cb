//! One-shot key exchange at the start of the message channel.
//!
//! The listener waits for the dialer's share, then answers with its own; the dialer sends
//! first, then waits. Both ends combine listener share ++ dialer share.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::cipher::{CipherSuite, KeyShare, SharedKey, Side};
use crate::error::ChannelError;
use crate::protocol::{HandshakePacket, PeerDescriptor, PROTOCOL_VERSION};
use crate::wire::{self, FrameDecodeError};

/// Result of a completed handshake.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub peer: PeerDescriptor,
    /// Address the peer observed for us.
    pub observed_address: String,
    pub key: SharedKey,
    pub suite: CipherSuite,
}

/// What this side contributes to the exchange.
pub struct LocalHello<'a> {
    pub descriptor: &'a PeerDescriptor,
    pub share: &'a KeyShare,
    /// Remote address of the stream as we see it.
    pub observed_address: String,
}

pub async fn exchange<R, W>(
    side: Side,
    reader: &mut R,
    writer: &mut W,
    local: LocalHello<'_>,
    timeout: Duration,
) -> Result<HandshakeOutcome, ChannelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hello = HandshakePacket {
        protocol_version: PROTOCOL_VERSION,
        sender: local.descriptor.clone(),
        key_share: local.share.clone(),
        observed_address: local.observed_address,
    };
    let received = match side {
        Side::Listener => {
            let received = receive(reader, timeout).await?;
            send(writer, &hello).await?;
            received
        }
        Side::Dialer => {
            send(writer, &hello).await?;
            receive(reader, timeout).await?
        }
    };
    let key = SharedKey::from_exchange(side, local.share, &received.key_share);
    let suite = CipherSuite::derive(&key, side);
    tracing::debug!(peer = %received.sender, ?side, "key exchange complete");
    Ok(HandshakeOutcome {
        peer: received.sender,
        observed_address: received.observed_address,
        key,
        suite,
    })
}

async fn send<W: AsyncWrite + Unpin>(
    writer: &mut W,
    hello: &HandshakePacket,
) -> Result<(), ChannelError> {
    let payload = wire::encode_packet(hello)?;
    wire::write_frame(writer, &payload).await?;
    Ok(())
}

async fn receive<R: AsyncRead + Unpin>(
    reader: &mut R,
    timeout: Duration,
) -> Result<HandshakePacket, ChannelError> {
    let frame = match tokio::time::timeout(timeout, wire::read_frame(reader)).await {
        Err(_) => return Err(ChannelError::HandshakeTimeout),
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => {
            return Err(ChannelError::HandshakeProtocol(
                "peer closed the stream during the handshake".into(),
            ))
        }
        Ok(Err(FrameDecodeError::Io(e))) => return Err(ChannelError::from_io(e)),
        Ok(Err(e)) => return Err(ChannelError::HandshakeProtocol(e.to_string())),
    };
    let packet: HandshakePacket = wire::decode_packet(&frame)
        .map_err(|e| ChannelError::HandshakeProtocol(e.to_string()))?;
    if packet.protocol_version != PROTOCOL_VERSION {
        return Err(ChannelError::HandshakeProtocol(format!(
            "unsupported protocol version {}",
            packet.protocol_version
        )));
    }
    Ok(packet)
}
