/// Source-routed path snapshots
///
/// Path building is consumed as a service: a PathBuilder implementation
/// (the daemon's) selects hops and runs the build handshake. This module
/// owns the routing state those builds feed, the per-endpoint PathSet the
/// service layer draws paths from.

use crate::identity::RouterId;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use veilnet_common::Timestamp;

/// Identifier of a path at its terminal hop
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathId(pub [u8; 16]);

impl PathId {
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Debug for PathId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PathId({})", hex::encode(&self.0[..4]))
    }
}

impl std::fmt::Display for PathId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    Building,
    Established,
    Expired,
    Failed,
}

/// A built multi-hop circuit through the overlay
#[derive(Debug, Clone)]
pub struct Path {
    pub id: PathId,

    /// Hops in dial order; the last one is the terminal router
    pub hops: Vec<RouterId>,

    pub status: PathStatus,
    pub built_at: Timestamp,
    pub expires_at: Timestamp,
}

impl Path {
    /// The router a remote would use to reach us over this path
    pub fn terminal_router(&self) -> Option<RouterId> {
        self.hops.last().copied()
    }

    pub fn is_ready(&self, now: Timestamp) -> bool {
        self.status == PathStatus::Established && !self.expires_at.is_expired(now)
    }
}

/// Errors surfaced by path builds
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("path build timed out")]
    BuildTimeout,

    #[error("not enough usable routers for hop selection")]
    NotEnoughHops,

    #[error("build rejected: {0}")]
    Rejected(String),
}

/// Builds paths on request; implemented outside this crate
#[async_trait]
pub trait PathBuilder: Send + Sync {
    /// Build a path of `hops` hops, terminating at `target` when given,
    /// never routing through a blacklisted router
    async fn build_path(
        &self,
        target: Option<RouterId>,
        hops: usize,
        blacklist: HashSet<RouterId>,
    ) -> Result<Path, PathError>;
}

/// The live paths owned by one endpoint
pub struct PathSet {
    paths: Arc<RwLock<HashMap<PathId, Path>>>,
}

impl PathSet {
    pub fn new() -> Self {
        Self {
            paths: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn add(&self, path: Path) {
        self.paths.write().await.insert(path.id, path);
    }

    pub async fn remove(&self, id: &PathId) -> Option<Path> {
        self.paths.write().await.remove(id)
    }

    pub async fn get(&self, id: &PathId) -> Option<Path> {
        self.paths.read().await.get(id).cloned()
    }

    /// Paths currently usable for traffic
    pub async fn established(&self, now: Timestamp) -> Vec<Path> {
        self.paths
            .read()
            .await
            .values()
            .filter(|p| p.is_ready(now))
            .cloned()
            .collect()
    }

    /// Uniform random pick among usable paths
    pub async fn pick_established(&self, now: Timestamp) -> Option<Path> {
        let ready = self.established(now).await;
        ready.choose(&mut rand::thread_rng()).cloned()
    }

    pub async fn len(&self) -> usize {
        self.paths.read().await.len()
    }

    pub async fn num_established(&self, now: Timestamp) -> usize {
        self.established(now).await.len()
    }

    /// Mark expired paths and drop them, returning the removed ids
    pub async fn expire_tick(&self, now: Timestamp) -> Vec<PathId> {
        let mut paths = self.paths.write().await;
        let mut removed = Vec::new();
        paths.retain(|id, path| {
            let keep = !path.expires_at.is_expired(now) && path.status != PathStatus::Failed;
            if !keep {
                debug!(path = %id, "path retired");
                removed.push(*id);
            }
            keep
        });
        removed
    }

    pub async fn clear(&self) {
        self.paths.write().await.clear();
    }
}

impl Default for PathSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn router(b: u8) -> RouterId {
        RouterId::from_bytes([b; 32])
    }

    fn path(hops: Vec<RouterId>, now: Timestamp, status: PathStatus) -> Path {
        Path {
            id: PathId::random(),
            hops,
            status,
            built_at: now,
            expires_at: now.add(Duration::from_secs(600)),
        }
    }

    #[tokio::test]
    async fn test_established_filters_by_status_and_expiry() {
        let set = PathSet::new();
        let now = Timestamp::from_millis(1_000);

        let ready = path(vec![router(1), router(2)], now, PathStatus::Established);
        let building = path(vec![router(3)], now, PathStatus::Building);
        set.add(ready.clone()).await;
        set.add(building).await;

        assert_eq!(set.num_established(now).await, 1);

        let after_expiry = ready.expires_at.add(Duration::from_secs(1));
        assert_eq!(set.num_established(after_expiry).await, 0);
    }

    #[tokio::test]
    async fn test_expire_tick_removes_dead_paths() {
        let set = PathSet::new();
        let now = Timestamp::from_millis(1_000);

        let live = path(vec![router(1)], now, PathStatus::Established);
        let failed = path(vec![router(2)], now, PathStatus::Failed);
        set.add(live.clone()).await;
        set.add(failed.clone()).await;

        let removed = set.expire_tick(now).await;
        assert_eq!(removed, vec![failed.id]);
        assert_eq!(set.len().await, 1);
        assert!(set.get(&live.id).await.is_some());
    }

    #[tokio::test]
    async fn test_terminal_router() {
        let p = path(vec![router(1), router(9)], Timestamp::ZERO, PathStatus::Established);
        assert_eq!(p.terminal_router(), Some(router(9)));
    }
}
