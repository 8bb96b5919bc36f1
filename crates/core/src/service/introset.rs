/// IntroSets: a hidden service's published rendezvous record
///
/// An IntroSet lists the introductions (terminal router + path id) a
/// service is currently reachable through. It travels through the DHT
/// sealed to its own address, so only parties that know the address can
/// read it; version comparison works on the sealed form.

use super::address::Address;
use crate::identity::{Identity, PublicKey};
use crate::path::PathId;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::{Deserialize, Serialize};
use veilnet_common::Timestamp;

/// One usable entry point into a hidden service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Introduction {
    /// Terminal router of the service's path
    pub router: crate::identity::RouterId,

    /// Path id at that router
    pub path_id: PathId,

    pub expires_at: Timestamp,
}

impl Introduction {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_expired(now)
    }
}

/// A hidden service's current set of introduction points
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroSet {
    /// Owner address, derived from `public_key`
    pub address: Address,

    /// Key the set is signed with; binds the address
    pub public_key: PublicKey,

    /// x25519 key clients use to open conversations with the service
    pub convo_key: [u8; 32],

    pub intros: Vec<Introduction>,

    /// Monotonic version; the newer set supersedes for a given address
    pub version: u64,

    pub expires_at: Timestamp,

    pub signature: crate::router::contact::Signature,
}

impl IntroSet {
    /// Build and sign an introset for our identity
    pub fn create(
        identity: &Identity,
        convo_key: [u8; 32],
        intros: Vec<Introduction>,
        version: u64,
        expires_at: Timestamp,
    ) -> Self {
        let public_key = identity.public_key();
        let mut set = Self {
            address: Address::from_public_key(&public_key),
            public_key,
            convo_key,
            intros,
            version,
            expires_at,
            signature: crate::router::contact::Signature::ZERO,
        };
        set.signature = crate::router::contact::Signature(identity.sign(&set.signing_data()));
        set
    }

    /// Signature valid and the address actually derives from the key
    pub fn verify(&self) -> bool {
        self.address.verify_public_key(&self.public_key)
            && self.public_key.verify(&self.signing_data(), &self.signature.0)
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_expired(now)
    }

    /// Intros that are still usable at `now`
    pub fn usable_intros(&self, now: Timestamp) -> Vec<Introduction> {
        self.intros
            .iter()
            .filter(|i| !i.is_expired(now))
            .copied()
            .collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>, IntroSetError> {
        bincode::serialize(self).map_err(|e| IntroSetError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, IntroSetError> {
        bincode::deserialize(bytes).map_err(|e| IntroSetError::Encoding(e.to_string()))
    }

    /// Seal to our own address for DHT publication
    pub fn seal(&self) -> Result<EncryptedIntroSet, IntroSetError> {
        let plaintext = self.encode()?;
        let key = derive_seal_key(&self.address);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));

        use rand::RngCore;
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|_| IntroSetError::SealFailed)?;

        Ok(EncryptedIntroSet {
            address_digest: *blake3::hash(self.address.as_bytes()).as_bytes(),
            version: self.version,
            nonce: nonce_bytes,
            ciphertext,
        })
    }

    fn signing_data(&self) -> Vec<u8> {
        let unsigned = Self {
            signature: crate::router::contact::Signature::ZERO,
            ..self.clone()
        };
        bincode::serialize(&unsigned).expect("introset serialization is infallible")
    }
}

/// An IntroSet sealed to its own address
///
/// Supersession ("other is newer") is decided by the plaintext version so
/// DHT nodes never decrypt what they store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedIntroSet {
    /// BLAKE3 digest of the owner address, the DHT location
    pub address_digest: [u8; 32],

    pub version: u64,

    pub nonce: [u8; 12],

    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedIntroSet {
    /// Version comparison without decryption
    pub fn other_is_newer(&self, other: &EncryptedIntroSet) -> bool {
        self.address_digest == other.address_digest && other.version > self.version
    }

    /// Open with the owning address, validating the inner record
    pub fn open(&self, address: &Address) -> Result<IntroSet, IntroSetError> {
        if *blake3::hash(address.as_bytes()).as_bytes() != self.address_digest {
            return Err(IntroSetError::WrongAddress);
        }

        let key = derive_seal_key(address);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&self.nonce), self.ciphertext.as_slice())
            .map_err(|_| IntroSetError::OpenFailed)?;

        let set = IntroSet::decode(&plaintext)?;
        if set.address != *address {
            return Err(IntroSetError::WrongAddress);
        }
        if set.version != self.version {
            return Err(IntroSetError::VersionMismatch);
        }
        if !set.verify() {
            return Err(IntroSetError::BadSignature);
        }
        Ok(set)
    }

    pub fn encode(&self) -> Result<Vec<u8>, IntroSetError> {
        bincode::serialize(self).map_err(|e| IntroSetError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, IntroSetError> {
        bincode::deserialize(bytes).map_err(|e| IntroSetError::Encoding(e.to_string()))
    }
}

fn derive_seal_key(address: &Address) -> [u8; 32] {
    blake3::derive_key("veilnet introset seal v1", address.as_bytes())
}

/// Errors creating, sealing or opening introsets
#[derive(Debug, thiserror::Error)]
pub enum IntroSetError {
    #[error("introset signature check failed")]
    BadSignature,

    #[error("sealed introset does not belong to this address")]
    WrongAddress,

    #[error("plaintext and sealed versions disagree")]
    VersionMismatch,

    #[error("seal failed")]
    SealFailed,

    #[error("open failed")]
    OpenFailed,

    #[error("introset encoding error: {0}")]
    Encoding(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RouterId;
    use std::time::Duration;

    fn intro(b: u8, expires_at: Timestamp) -> Introduction {
        Introduction {
            router: RouterId::from_bytes([b; 32]),
            path_id: PathId::random(),
            expires_at,
        }
    }

    fn make_set(identity: &Identity, version: u64) -> IntroSet {
        let now = Timestamp::from_millis(10_000);
        IntroSet::create(
            identity,
            [3u8; 32],
            vec![
                intro(1, now.add(Duration::from_secs(600))),
                intro(2, now.add(Duration::from_secs(300))),
            ],
            version,
            now.add(Duration::from_secs(600)),
        )
    }

    #[test]
    fn test_signature_binds_contents() {
        let identity = Identity::generate();
        let set = make_set(&identity, 1);
        assert!(set.verify());

        let mut tampered = set.clone();
        tampered.version = 9;
        assert!(!tampered.verify());
    }

    #[test]
    fn test_encode_decode_encode_is_stable() {
        let identity = Identity::generate();
        let set = make_set(&identity, 1);

        let bytes = set.encode().unwrap();
        let decoded = IntroSet::decode(&bytes).unwrap();
        assert_eq!(set, decoded);
        assert_eq!(bytes, decoded.encode().unwrap());
    }

    #[test]
    fn test_seal_and_open() {
        let identity = Identity::generate();
        let set = make_set(&identity, 3);

        let sealed = set.seal().unwrap();
        let opened = sealed.open(&set.address).unwrap();
        assert_eq!(opened, set);
    }

    #[test]
    fn test_open_with_wrong_address_fails() {
        let identity = Identity::generate();
        let other = Identity::generate();
        let set = make_set(&identity, 3);
        let sealed = set.seal().unwrap();

        let wrong = Address::from_public_key(&other.public_key());
        assert!(matches!(
            sealed.open(&wrong),
            Err(IntroSetError::WrongAddress)
        ));
    }

    #[test]
    fn test_other_is_newer_by_version() {
        let identity = Identity::generate();
        let v1 = make_set(&identity, 1).seal().unwrap();
        let v2 = make_set(&identity, 2).seal().unwrap();

        assert!(v1.other_is_newer(&v2));
        assert!(!v2.other_is_newer(&v1));

        // different address never supersedes
        let stranger = make_set(&Identity::generate(), 5).seal().unwrap();
        assert!(!v1.other_is_newer(&stranger));
    }

    #[test]
    fn test_usable_intros_filters_expired() {
        let identity = Identity::generate();
        let now = Timestamp::from_millis(10_000);
        let set = IntroSet::create(
            &identity,
            [3u8; 32],
            vec![
                intro(1, now.add(Duration::from_secs(60))),
                intro(2, Timestamp::from_millis(5_000)),
            ],
            1,
            now.add(Duration::from_secs(600)),
        );

        let usable = set.usable_intros(now);
        assert_eq!(usable.len(), 1);
        assert_eq!(usable[0].router, RouterId::from_bytes([1; 32]));
    }
}
