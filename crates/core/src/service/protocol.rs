/// Hidden-service protocol frames
///
/// A ProtocolMessage is the plaintext unit exchanged between two service
/// endpoints over a conversation; a ProtocolFrame is its sealed form as it
/// rides a path. The first frame of a conversation carries an ephemeral
/// x25519 key; both sides cache the derived secret under the ConvoTag.

use super::address::{Address, ConvoTag};
use super::introset::Introduction;
use crate::identity::{Identity, PublicKey};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// What the payload of a message is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolType {
    Control,
    TrafficV4,
    TrafficV6,
    Auth,
    Exit,
}

/// Plaintext conversation message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub tag: ConvoTag,
    pub proto: ProtocolType,

    /// Monotone per-conversation sequence number
    pub seqno: u64,

    /// Sender's service address and signing key
    pub sender: Address,
    pub sender_key: PublicKey,

    /// Where replies should enter the sender's service
    pub reply_intro: Option<Introduction>,

    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl ProtocolMessage {
    /// Sender address must derive from the embedded key
    pub fn sender_is_consistent(&self) -> bool {
        self.sender.verify_public_key(&self.sender_key)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(bytes).map_err(|e| ProtocolError::Encoding(e.to_string()))
    }
}

/// Sealed message as it travels a path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolFrame {
    pub tag: ConvoTag,

    /// Present on the first frame of a conversation
    pub ephemeral_key: Option<[u8; 32]>,

    pub nonce: [u8; 12],

    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

impl ProtocolFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(bytes).map_err(|e| ProtocolError::Encoding(e.to_string()))
    }

    /// Seal `message` with an already-established conversation secret
    pub fn seal_with_secret(
        message: &ProtocolMessage,
        secret: &SharedSecret,
    ) -> Result<Self, ProtocolError> {
        let nonce = random_nonce();
        let ciphertext = seal(&secret.0, &nonce, &message.encode()?)?;
        Ok(Self {
            tag: message.tag,
            ephemeral_key: None,
            nonce,
            ciphertext,
        })
    }

    /// Seal the first frame of a conversation to the recipient's convo key
    ///
    /// Returns the frame and the shared secret to cache for the tag.
    pub fn seal_handshake(
        message: &ProtocolMessage,
        recipient: &X25519Public,
    ) -> Result<(Self, SharedSecret), ProtocolError> {
        let ephemeral = StaticSecret::random_from_rng(rand::thread_rng());
        let ephemeral_pub = X25519Public::from(&ephemeral);
        let secret = SharedSecret::derive(&ephemeral, recipient);

        let nonce = random_nonce();
        let ciphertext = seal(&secret.0, &nonce, &message.encode()?)?;
        Ok((
            Self {
                tag: message.tag,
                ephemeral_key: Some(ephemeral_pub.to_bytes()),
                nonce,
                ciphertext,
            },
            secret,
        ))
    }

    /// Open with a cached conversation secret
    pub fn open_with_secret(&self, secret: &SharedSecret) -> Result<ProtocolMessage, ProtocolError> {
        let plaintext = open(&secret.0, &self.nonce, &self.ciphertext)?;
        let message = ProtocolMessage::decode(&plaintext)?;
        if !message.sender_is_consistent() {
            return Err(ProtocolError::SenderMismatch);
        }
        Ok(message)
    }

    /// Open a handshake frame with our convo keys
    ///
    /// Returns the message and the secret to cache for the tag.
    pub fn open_handshake(
        &self,
        keys: &ConvoKeys,
    ) -> Result<(ProtocolMessage, SharedSecret), ProtocolError> {
        let ephemeral = self
            .ephemeral_key
            .ok_or(ProtocolError::MissingHandshake)?;
        let secret = SharedSecret::derive(&keys.secret, &X25519Public::from(ephemeral));
        let message = self.open_with_secret(&secret)?;
        Ok((message, secret))
    }
}

/// Cached conversation secret
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    fn derive(secret: &StaticSecret, public: &X25519Public) -> Self {
        let dh = secret.diffie_hellman(public);
        Self(blake3::derive_key("veilnet convo v1", dh.as_bytes()))
    }

    #[cfg(test)]
    pub fn for_tests(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedSecret(<redacted>)")
    }
}

/// Conversation key exchange keys, derived from the service identity
#[derive(Clone)]
pub struct ConvoKeys {
    secret: StaticSecret,
}

impl ConvoKeys {
    pub fn from_identity(identity: &Identity) -> Self {
        let seed = blake3::derive_key("veilnet convo keys v1", &identity.keypair().secret_bytes());
        Self {
            secret: StaticSecret::from(seed),
        }
    }

    pub fn public(&self) -> X25519Public {
        X25519Public::from(&self.secret)
    }
}

fn random_nonce() -> [u8; 12] {
    use rand::RngCore;
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

fn seal(key: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| ProtocolError::SealFailed)
}

fn open(key: &[u8; 32], nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| ProtocolError::OpenFailed)
}

/// Errors sealing or opening protocol frames
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame encoding error: {0}")]
    Encoding(String),

    #[error("seal failed")]
    SealFailed,

    #[error("open failed")]
    OpenFailed,

    #[error("frame has no handshake but the tag is unknown")]
    MissingHandshake,

    #[error("sender address does not match its key")]
    SenderMismatch,
}
