use super::{KeyPair, KeyPairError, PublicKey, RouterId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Long-term identity of this node
///
/// Wraps the signing keypair and the RouterId derived from it. Loaded from
/// disk at startup or generated and persisted on first run.
#[derive(Clone)]
pub struct Identity {
    keypair: KeyPair,
    router_id: RouterId,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let keypair = KeyPair::generate();
        let router_id = RouterId::from_public_key(&keypair.public_key());
        Self { keypair, router_id }
    }

    /// Create an identity from a secret key
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, KeyPairError> {
        let keypair = KeyPair::from_secret_bytes(bytes)?;
        let router_id = RouterId::from_public_key(&keypair.public_key());
        Ok(Self { keypair, router_id })
    }

    /// Load the identity from `path`, generating and persisting a fresh one
    /// if the file does not exist
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            let json = std::fs::read_to_string(path)?;
            let stored: StoredIdentity = serde_json::from_str(&json)
                .map_err(|e| IdentityError::Malformed(e.to_string()))?;
            let secret = hex::decode(&stored.secret_key)
                .map_err(|e| IdentityError::Malformed(e.to_string()))?;
            let secret: [u8; 32] = secret
                .try_into()
                .map_err(|_| IdentityError::Malformed("secret key length".to_string()))?;
            Ok(Self::from_secret_bytes(&secret)?)
        } else {
            let identity = Self::generate();
            identity.save(path)?;
            Ok(identity)
        }
    }

    /// Persist the identity to `path` as JSON
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stored = StoredIdentity {
            secret_key: hex::encode(self.keypair.secret_bytes()),
        };
        let json = serde_json::to_string_pretty(&stored)
            .map_err(|e| IdentityError::Malformed(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn router_id(&self) -> RouterId {
        self.router_id
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.keypair.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        self.keypair.verify(message, signature)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("router_id", &self.router_id)
            .finish()
    }
}

/// On-disk identity format
#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    secret_key: String,
}

/// Errors loading or persisting the identity
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Malformed identity file: {0}")]
    Malformed(String),

    #[error(transparent)]
    Key(#[from] KeyPairError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_roundtrip_via_disk() {
        let dir = std::env::temp_dir().join(format!("veilnet-id-{}", std::process::id()));
        let path = dir.join("identity.json");

        let first = Identity::load_or_generate(&path).unwrap();
        let second = Identity::load_or_generate(&path).unwrap();
        assert_eq!(first.router_id(), second.router_id());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_identity_signs_for_its_router_id() {
        let identity = Identity::generate();
        let sig = identity.sign(b"payload");

        let key = identity.router_id().public_key().unwrap();
        assert!(key.verify(b"payload", &sig));
    }
}
