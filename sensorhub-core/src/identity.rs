//! Transport identity and crypto: keypairs, handshake, session keys, frame encryption.

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::protocol::PROTOCOL_VERSION;

/// Public key (32 bytes, X25519). Sent in the handshake and the discovery beacon.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

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

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `PublicKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        bytes.try_into().ok().map(PublicKey)
    }
}

/// X25519 keypair. Keep secret key private; expose only public key.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Shared secret with another device's public key. Used to derive session key.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }

    /// Directional keys for the channel to `other_public`. Both ends derive the same pair,
    /// mirrored: our `send` is the peer's `recv`.
    pub fn session_keys(&self, other_public: &PublicKey) -> SessionKeys {
        let shared = self.shared_secret(other_public);
        SessionKeys {
            send: derive_session_key(&shared, &self.public, other_public),
            recv: derive_session_key(&shared, other_public, &self.public),
        }
    }
}

/// One ChaCha20-Poly1305 key per direction, so the two nonce counters never collide.
#[derive(Clone)]
pub struct SessionKeys {
    pub send: [u8; 32],
    pub recv: [u8; 32],
}

/// Derive the 32-byte key for frames sent from `sender` to `receiver`.
pub fn derive_session_key(
    shared_secret: &[u8; 32],
    sender: &PublicKey,
    receiver: &PublicKey,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"sensorhub-session-v1");
    hasher.update(shared_secret);
    hasher.update(sender.as_bytes());
    hasher.update(receiver.as_bytes());
    hasher.finalize().into()
}

/// Device ids name directories on disk: no separators, no dot segments, no control chars.
pub fn is_valid_device_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.chars().any(|c| c == '/' || c == '\\' || c.is_control())
}

fn nonce_bytes(nonce: u64) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[4..12].copy_from_slice(&nonce.to_le_bytes());
    out
}

/// Wire encryption: ChaCha20-Poly1305. `key` is the sender's direction key from
/// [`SessionKeys`]; `nonce` counts frames in that direction from 0.
pub fn encrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce = nonce_bytes(nonce);
    let nonce_arr =
        chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(&nonce);
    cipher
        .encrypt(nonce_arr, plaintext)
        .map_err(|_| WireCryptoError::Encrypt)
}

/// Wire decryption.
pub fn decrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce = nonce_bytes(nonce);
    let nonce_arr =
        chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(&nonce);
    cipher
        .decrypt(nonce_arr, ciphertext)
        .map_err(|_| WireCryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

/// Fixed part of the handshake: version + public key + device id length.
pub const HANDSHAKE_HEADER_SIZE: usize = 1 + 32 + 1;

/// Plaintext hello exchanged by both sides before any encrypted frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub public_key: PublicKey,
    pub device_id: String,
}

/// Parsed fixed header; `id_len` bytes of device id follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeHeader {
    pub public_key: PublicKey,
    pub id_len: usize,
}

impl Handshake {
    pub fn new(public_key: PublicKey, device_id: impl Into<String>) -> Self {
        Self {
            public_key,
            device_id: device_id.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, HandshakeError> {
        let id = self.device_id.as_bytes();
        if id.is_empty() || id.len() > u8::MAX as usize {
            return Err(HandshakeError::InvalidDeviceId);
        }
        let mut out = Vec::with_capacity(HANDSHAKE_HEADER_SIZE + id.len());
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(self.public_key.as_bytes());
        out.push(id.len() as u8);
        out.extend_from_slice(id);
        Ok(out)
    }

    pub fn decode_header(
        buf: &[u8; HANDSHAKE_HEADER_SIZE],
    ) -> Result<HandshakeHeader, HandshakeError> {
        if buf[0] != PROTOCOL_VERSION {
            return Err(HandshakeError::UnsupportedVersion(buf[0]));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&buf[1..33]);
        let id_len = buf[33] as usize;
        if id_len == 0 {
            return Err(HandshakeError::InvalidDeviceId);
        }
        Ok(HandshakeHeader {
            public_key: PublicKey(key),
            id_len,
        })
    }

    pub fn from_parts(header: HandshakeHeader, id: &[u8]) -> Result<Self, HandshakeError> {
        if id.len() != header.id_len {
            return Err(HandshakeError::Truncated);
        }
        let device_id = std::str::from_utf8(id)
            .map_err(|_| HandshakeError::InvalidDeviceId)?
            .to_string();
        if !is_valid_device_id(&device_id) {
            return Err(HandshakeError::InvalidDeviceId);
        }
        Ok(Self {
            public_key: header.public_key,
            device_id,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HandshakeError> {
        let header: &[u8; HANDSHAKE_HEADER_SIZE] = bytes
            .get(..HANDSHAKE_HEADER_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(HandshakeError::Truncated)?;
        let header = Self::decode_header(header)?;
        let id = bytes
            .get(HANDSHAKE_HEADER_SIZE..HANDSHAKE_HEADER_SIZE + header.id_len)
            .ok_or(HandshakeError::Truncated)?;
        Self::from_parts(header, id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("handshake truncated")]
    Truncated,
    #[error("invalid device id")]
    InvalidDeviceId,
}
