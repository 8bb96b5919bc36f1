use super::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical identity of a router or hidden-service host
///
/// The raw bytes of an Ed25519 verifying key. Hashable and totally ordered
/// so it can key maps and sort deterministically.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouterId([u8; 32]);

impl RouterId {
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(public_key.as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The verifying key this id names, if the bytes are a valid point
    pub fn public_key(&self) -> Result<PublicKey, super::KeyPairError> {
        PublicKey::from_bytes(&self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, RouterIdError> {
        let bytes = hex::decode(s).map_err(|_| RouterIdError::InvalidHex)?;
        if bytes.len() != 32 {
            return Err(RouterIdError::InvalidLength);
        }
        let mut array = [0u8; 32];
        array.copy_from_slice(&bytes);
        Ok(Self(array))
    }

    /// Shortened display form (first 8 bytes as hex)
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouterId({}...)", self.short_hex())
    }
}

impl fmt::Display for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_hex())
    }
}

impl From<[u8; 32]> for RouterId {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

/// Errors related to RouterId parsing
#[derive(Debug, thiserror::Error)]
pub enum RouterIdError {
    #[error("Invalid hexadecimal string")]
    InvalidHex,

    #[error("Invalid length (expected 32 bytes)")]
    InvalidLength,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;

    #[test]
    fn test_router_id_from_public_key() {
        let keypair = KeyPair::generate();
        let id = RouterId::from_public_key(&keypair.public_key());
        assert_eq!(id.as_bytes(), &keypair.public_bytes());
    }

    #[test]
    fn test_router_id_hex_roundtrip() {
        let keypair = KeyPair::generate();
        let id = RouterId::from_public_key(&keypair.public_key());

        let restored = RouterId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, restored);
    }

    #[test]
    fn test_router_id_rejects_bad_hex() {
        assert!(matches!(
            RouterId::from_hex("zz"),
            Err(RouterIdError::InvalidHex)
        ));
        assert!(matches!(
            RouterId::from_hex("abcd"),
            Err(RouterIdError::InvalidLength)
        ));
    }

    #[test]
    fn test_router_id_ordering_is_total() {
        let a = RouterId::from_bytes([0u8; 32]);
        let b = RouterId::from_bytes([1u8; 32]);
        assert!(a < b);
        assert_eq!(a.cmp(&a), std::cmp::Ordering::Equal);
    }
}
