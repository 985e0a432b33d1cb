//! Key shares, the paired key they combine into, and the message-channel cipher suite.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const KEY_SHARE_LEN: usize = 32;

/// Which end of the handshake this side played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Listener,
    Dialer,
}

/// Random key material generated by one side before accepting or dialing.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShare(#[serde(with = "bytes_32")] [u8; KEY_SHARE_LEN]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl KeyShare {
    pub fn generate() -> Self {
        let mut share = [0u8; KEY_SHARE_LEN];
        OsRng.fill_bytes(&mut share);
        KeyShare(share)
    }

    pub fn from_bytes(bytes: [u8; KEY_SHARE_LEN]) -> Self {
        KeyShare(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SHARE_LEN] {
        &self.0
    }
}

// Key material stays out of logs.
impl std::fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyShare(..)")
    }
}

/// Final key of one connection pair: the listener's share followed by the dialer's.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey(Vec<u8>);

impl SharedKey {
    /// Both ends must call this with the same argument order or they derive different keys.
    pub fn combine(listener: &KeyShare, dialer: &KeyShare) -> Self {
        let mut key = Vec::with_capacity(KEY_SHARE_LEN * 2);
        key.extend_from_slice(listener.as_bytes());
        key.extend_from_slice(dialer.as_bytes());
        SharedKey(key)
    }

    /// Combine from one side's point of view.
    pub fn from_exchange(side: Side, own: &KeyShare, received: &KeyShare) -> Self {
        match side {
            Side::Listener => Self::combine(own, received),
            Side::Dialer => Self::combine(received, own),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedKey({} bytes)", self.0.len())
    }
}

/// Symmetric context derived from a [`SharedKey`]. Owned by exactly one connection.
#[derive(Clone)]
pub struct CipherSuite {
    key: [u8; 32],
    side: Side,
}

impl CipherSuite {
    pub fn derive(shared: &SharedKey, side: Side) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"peerconn-cipher-v1");
        hasher.update(shared.as_bytes());
        Self {
            key: hasher.finalize().into(),
            side,
        }
    }

    /// Split into the outbound sealer and inbound opener for this side.
    pub fn split(&self) -> (Sealer, Opener) {
        let (out_dir, in_dir) = match self.side {
            Side::Listener => (DIR_FROM_LISTENER, DIR_FROM_DIALER),
            Side::Dialer => (DIR_FROM_DIALER, DIR_FROM_LISTENER),
        };
        (
            Sealer {
                key: self.key,
                direction: out_dir,
                counter: 0,
            },
            Opener {
                key: self.key,
                direction: in_dir,
                counter: 0,
            },
        )
    }
}

impl std::fmt::Debug for CipherSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherSuite")
            .field("cipher", &"chacha20poly1305")
            .field("side", &self.side)
            .finish()
    }
}

const DIR_FROM_LISTENER: u8 = 0;
const DIR_FROM_DIALER: u8 = 1;

/// Encrypts frames in one direction. Nonce: direction byte + 64-bit frame counter; never reused.
pub struct Sealer {
    key: [u8; 32],
    direction: u8,
    counter: u64,
}

impl Sealer {
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let out = encrypt(&self.key, self.direction, self.counter, plaintext)?;
        self.counter = self.counter.checked_add(1).ok_or(CipherError::Exhausted)?;
        Ok(out)
    }
}

/// Decrypts frames coming from the other direction, in arrival order.
pub struct Opener {
    key: [u8; 32],
    direction: u8,
    counter: u64,
}

impl Opener {
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let out = decrypt(&self.key, self.direction, self.counter, ciphertext)?;
        self.counter = self.counter.checked_add(1).ok_or(CipherError::Exhausted)?;
        Ok(out)
    }
}

fn nonce_bytes(direction: u8, counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[0] = direction;
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

fn encrypt(
    key: &[u8; 32],
    direction: u8,
    counter: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, CipherError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CipherError::Key)?;
    let nonce = nonce_bytes(direction, counter);
    cipher
        .encrypt(
            chacha20poly1305::aead::Nonce::<ChaCha20Poly1305>::from_slice(&nonce),
            plaintext,
        )
        .map_err(|_| CipherError::Encrypt)
}

fn decrypt(
    key: &[u8; 32],
    direction: u8,
    counter: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CipherError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CipherError::Key)?;
    let nonce = nonce_bytes(direction, counter);
    cipher
        .decrypt(
            chacha20poly1305::aead::Nonce::<ChaCha20Poly1305>::from_slice(&nonce),
            ciphertext,
        )
        .map_err(|_| CipherError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("nonce space exhausted")]
    Exhausted,
}
