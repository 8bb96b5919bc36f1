/// Per-peer statistics store
///
/// Aggregates link-session deltas into long-lived per-router counters used
/// for peer selection and for the RPC stats report.

use crate::identity::RouterId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Aggregate statistics for one peer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerStats {
    /// Highest observed bandwidth, bytes per second
    pub peak_bandwidth_bytes_per_sec: u64,

    /// Packets dropped on sessions to this peer
    pub packets_dropped: u64,

    /// Packets acknowledged by this peer
    pub packets_sent: u64,

    /// Packets handed to the link layer for this peer
    pub packets_attempted: u64,
}

pub struct PeerDb {
    stats: Arc<RwLock<HashMap<RouterId, PeerStats>>>,
}

impl PeerDb {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Apply `f` to the stats entry for `router`, creating it if absent
    pub async fn modify_peer_stats<F: FnOnce(&mut PeerStats)>(&self, router: RouterId, f: F) {
        let mut stats = self.stats.write().await;
        f(stats.entry(router).or_default());
    }

    pub async fn get(&self, router: &RouterId) -> Option<PeerStats> {
        self.stats.read().await.get(router).cloned()
    }

    /// Stats for a requested set of routers, in request order
    ///
    /// Routers we have never exchanged traffic with report zeroed stats.
    pub async fn get_many(&self, routers: &[RouterId]) -> Vec<(RouterId, PeerStats)> {
        let stats = self.stats.read().await;
        routers
            .iter()
            .map(|r| (*r, stats.get(r).cloned().unwrap_or_default()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.stats.read().await.len()
    }
}

impl Default for PeerDb {
    fn default() -> Self {
        Self::new()
    }
}
