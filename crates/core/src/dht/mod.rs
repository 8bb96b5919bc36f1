/// DHT client seam
///
/// The DHT message codec and routing live outside this crate; the routing
/// subsystem only needs to issue lookups and publishes. Implementations
/// dispatch over paths chosen by the caller's relay order.

use crate::identity::RouterId;
use crate::router::contact::RouterContact;
use crate::service::introset::EncryptedIntroSet;
use async_trait::async_trait;

/// Keyspace location, a BLAKE3 digest of the owning address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DhtKey(pub [u8; 32]);

impl DhtKey {
    pub fn for_bytes(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }
}

#[async_trait]
pub trait DhtClient: Send + Sync {
    /// Look up candidate RCs for a router
    ///
    /// Returned contacts are unvalidated; callers run them through
    /// `RcLookupHandler::check_rc`.
    async fn find_router(&self, router: RouterId) -> Result<Vec<RouterContact>, DhtError>;

    /// Look up encrypted introsets stored at `location`
    ///
    /// `relay_order` selects which replication path carries the request so
    /// concurrent lookups spread across the redundant store set.
    async fn find_intro(
        &self,
        location: DhtKey,
        relay_order: u8,
    ) -> Result<Vec<EncryptedIntroSet>, DhtError>;

    /// Publish our encrypted introset on the replication path `relay_order`
    async fn publish_intro(
        &self,
        introset: EncryptedIntroSet,
        relay_order: u8,
    ) -> Result<(), DhtError>;

    /// Random-walk lookup used for periodic network exploration
    async fn explore(&self) -> Result<Vec<RouterId>, DhtError>;
}

/// Errors surfaced by DHT operations
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    #[error("nothing found")]
    NotFound,

    #[error("lookup timed out")]
    Timeout,

    #[error("no path available to dispatch over")]
    NoPath,

    #[error("network error: {0}")]
    Network(String),
}
