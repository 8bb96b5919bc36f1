/// Router contact records
///
/// A RouterContact (RC) is the signed descriptor binding a RouterId to the
/// network addresses and transports it is reachable on. RCs travel through
/// the DHT and are the only way peers learn how to dial each other.

use crate::identity::{Identity, PublicKey, RouterId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use veilnet_common::config::lookup::{MAX_RC_VERSION, MIN_RC_VERSION};
use veilnet_common::{NetworkAddress, Timestamp, TransportKind};

/// Ed25519 signature wrapper (64 bytes) with serde support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] pub [u8; 64]);

impl Signature {
    pub const ZERO: Signature = Signature([0u8; 64]);
}

/// Signed descriptor of a router's network presence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterContact {
    /// Descriptor format version
    pub version: u16,

    /// Identity of the router this RC describes
    pub router_id: RouterId,

    /// Addresses the router accepts inbound sessions on
    pub addresses: Vec<NetworkAddress>,

    /// Transports the router speaks, in preference order
    pub transports: Vec<TransportKind>,

    /// Whether the router relays for others (service node)
    pub public_router: bool,

    /// When this RC stops being valid
    pub expires_at: Timestamp,

    /// Signature by `router_id` over the rest of the record
    pub signature: Signature,
}

impl RouterContact {
    /// Default RC validity window
    pub const LIFETIME: Duration = Duration::from_secs(60 * 60);

    /// Build and sign an RC for our own identity
    pub fn create(
        identity: &Identity,
        addresses: Vec<NetworkAddress>,
        transports: Vec<TransportKind>,
        public_router: bool,
        now: Timestamp,
    ) -> Self {
        let mut rc = Self {
            version: MAX_RC_VERSION,
            router_id: identity.router_id(),
            addresses,
            transports,
            public_router,
            expires_at: now.add(Self::LIFETIME),
            signature: Signature::ZERO,
        };
        rc.signature = Signature(identity.sign(&rc.signing_data()));
        rc
    }

    /// Verify the signature under the embedded RouterId
    pub fn verify(&self) -> bool {
        let key = match PublicKey::from_bytes(self.router_id.as_bytes()) {
            Ok(key) => key,
            Err(_) => return false,
        };
        key.verify(&self.signing_data(), &self.signature.0)
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_expired(now)
    }

    /// Whether the advertised format version is one we speak
    pub fn version_in_band(&self) -> bool {
        (MIN_RC_VERSION..=MAX_RC_VERSION).contains(&self.version)
    }

    /// Full validity check: signature, expiry, version band
    pub fn is_valid(&self, now: Timestamp) -> Result<(), ContactError> {
        if !self.version_in_band() {
            return Err(ContactError::VersionOutOfBand(self.version));
        }
        if self.is_expired(now) {
            return Err(ContactError::Expired);
        }
        if !self.verify() {
            return Err(ContactError::BadSignature);
        }
        Ok(())
    }

    /// Whether `self` supersedes `other` for the same router
    pub fn is_newer_than(&self, other: &RouterContact) -> bool {
        self.router_id == other.router_id && self.expires_at > other.expires_at
    }

    /// Renegotiation check: same key, unexpired, verifiable
    pub fn renegotiate_valid(new: &RouterContact, old: &RouterContact, now: Timestamp) -> bool {
        new.router_id == old.router_id && !new.is_expired(now) && new.verify()
    }

    /// Binary wire encoding
    pub fn encode(&self) -> Result<Vec<u8>, ContactError> {
        bincode::serialize(self).map_err(|e| ContactError::Encoding(e.to_string()))
    }

    /// Decode from the binary wire encoding
    pub fn decode(bytes: &[u8]) -> Result<Self, ContactError> {
        bincode::deserialize(bytes).map_err(|e| ContactError::Encoding(e.to_string()))
    }

    /// The bytes covered by the signature
    fn signing_data(&self) -> Vec<u8> {
        let unsigned = Self {
            signature: Signature::ZERO,
            ..self.clone()
        };
        bincode::serialize(&unsigned).expect("RC serialization is infallible")
    }
}

/// Errors validating or encoding router contacts
#[derive(Debug, thiserror::Error)]
pub enum ContactError {
    #[error("RC signature check failed")]
    BadSignature,

    #[error("RC is expired")]
    Expired,

    #[error("RC version {0} outside accepted band")]
    VersionOutOfBand(u16),

    #[error("RC rejected by whitelist")]
    NotWhitelisted,

    #[error("RC encoding error: {0}")]
    Encoding(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_rc(identity: &Identity, now: Timestamp) -> RouterContact {
        RouterContact::create(
            identity,
            vec![NetworkAddress::from_socket("127.0.0.1:7000".parse().unwrap())],
            vec![TransportKind::Quic],
            true,
            now,
        )
    }

    #[test]
    fn test_rc_signature_verifies() {
        let identity = Identity::generate();
        let now = Timestamp::from_millis(1_000);
        let rc = test_rc(&identity, now);

        assert!(rc.verify());
        assert!(rc.is_valid(now).is_ok());
    }

    #[test]
    fn test_tampered_rc_fails() {
        let identity = Identity::generate();
        let now = Timestamp::from_millis(1_000);
        let mut rc = test_rc(&identity, now);
        rc.public_router = false;

        assert!(!rc.verify());
        assert!(matches!(rc.is_valid(now), Err(ContactError::BadSignature)));
    }

    #[test]
    fn test_expired_rc_rejected() {
        let identity = Identity::generate();
        let now = Timestamp::from_millis(1_000);
        let rc = test_rc(&identity, now);

        let later = rc.expires_at.add(Duration::from_secs(1));
        assert!(matches!(rc.is_valid(later), Err(ContactError::Expired)));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let identity = Identity::generate();
        let rc = test_rc(&identity, Timestamp::from_millis(1_000));

        let bytes = rc.encode().unwrap();
        let decoded = RouterContact::decode(&bytes).unwrap();
        assert_eq!(rc, decoded);
        assert_eq!(bytes, decoded.encode().unwrap());
    }

    #[test]
    fn test_renegotiate_requires_same_key() {
        let identity = Identity::generate();
        let other = Identity::generate();
        let now = Timestamp::from_millis(1_000);

        let old = test_rc(&identity, now);
        let new_same = test_rc(&identity, now.add(Duration::from_secs(5)));
        let new_other = test_rc(&other, now.add(Duration::from_secs(5)));

        assert!(RouterContact::renegotiate_valid(&new_same, &old, now));
        assert!(!RouterContact::renegotiate_valid(&new_other, &old, now));
    }
}
