/// Hidden-service address system
///
/// Service addresses are derived from the service's public key, like Tor's
/// .onion addresses, so holding the key proves ownership of the name.

use crate::identity::PublicKey;
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A .veil service address (e.g., "abc123...xyz.veil")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address([u8; 32]);

impl Address {
    /// Derive the address of a service public key
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(b"VEILNET-SERVICE-V1");
        hasher.update(&public_key.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to .veil hostname
    pub fn to_hostname(&self) -> String {
        format!("{}.veil", self.to_base32())
    }

    pub fn to_base32(&self) -> String {
        data_encoding::BASE32_NOPAD.encode(&self.0).to_lowercase()
    }

    /// Parse from hostname (with or without .veil suffix)
    pub fn from_hostname(hostname: &str) -> Result<Self, AddressError> {
        let hostname = hostname.trim().trim_end_matches('.').to_lowercase();

        let base32_part = hostname.strip_suffix(".veil").unwrap_or(&hostname);

        let bytes = data_encoding::BASE32_NOPAD
            .decode(base32_part.to_uppercase().as_bytes())
            .map_err(|_| AddressError::InvalidEncoding)?;

        if bytes.len() != 32 {
            return Err(AddressError::InvalidLength(bytes.len()));
        }

        let mut array = [0u8; 32];
        array.copy_from_slice(&bytes);
        Ok(Self(array))
    }

    /// Whether a hostname names a .veil service
    pub fn is_veil_address(hostname: &str) -> bool {
        hostname
            .trim()
            .trim_end_matches('.')
            .to_lowercase()
            .ends_with(".veil")
    }

    /// Verify that this address was derived from the given public key
    pub fn verify_public_key(&self, public_key: &PublicKey) -> bool {
        self == &Self::from_public_key(public_key)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hostname())
    }
}

/// Errors parsing service addresses
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid base32 encoding")]
    InvalidEncoding,

    #[error("Invalid address length: {0} bytes")]
    InvalidLength(usize),
}

/// Opaque conversation identifier
///
/// 16 random bytes, unique per (local endpoint, remote peer) pairing;
/// demultiplexes inbound protocol messages to their conversation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConvoTag([u8; 16]);

impl ConvoTag {
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for ConvoTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConvoTag({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for ConvoTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}
