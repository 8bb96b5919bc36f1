/// Local store of validated router contacts
///
/// Backs the RC lookup handler: lookups hit this store before going to the
/// DHT, and every RC that passes validation lands here. Optionally persisted
/// to a directory of per-router files.

use super::contact::RouterContact;
use crate::identity::RouterId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use veilnet_common::Timestamp;

pub struct NodeDb {
    contacts: Arc<RwLock<HashMap<RouterId, RouterContact>>>,

    /// Where RCs are persisted, when set
    store_dir: Option<PathBuf>,
}

impl NodeDb {
    pub fn new() -> Self {
        Self {
            contacts: Arc::new(RwLock::new(HashMap::new())),
            store_dir: None,
        }
    }

    pub fn with_store_dir(dir: PathBuf) -> Self {
        Self {
            contacts: Arc::new(RwLock::new(HashMap::new())),
            store_dir: Some(dir),
        }
    }

    /// Fetch an RC if present and unexpired
    pub async fn get(&self, router: &RouterId, now: Timestamp) -> Option<RouterContact> {
        let contacts = self.contacts.read().await;
        contacts
            .get(router)
            .filter(|rc| !rc.is_expired(now))
            .cloned()
    }

    /// Insert an RC, keeping whichever of old and new expires later
    ///
    /// Returns true if the stored entry changed.
    pub async fn put(&self, rc: RouterContact) -> bool {
        let mut contacts = self.contacts.write().await;
        match contacts.get(&rc.router_id) {
            Some(existing) if !rc.is_newer_than(existing) => false,
            _ => {
                contacts.insert(rc.router_id, rc);
                true
            }
        }
    }

    pub async fn remove(&self, router: &RouterId) -> Option<RouterContact> {
        self.contacts.write().await.remove(router)
    }

    /// Drop every RC failing `keep`; returns the removed RouterIds
    pub async fn retain<F: FnMut(&RouterContact) -> bool>(&self, mut keep: F) -> Vec<RouterId> {
        let mut contacts = self.contacts.write().await;
        let mut removed = Vec::new();
        contacts.retain(|id, rc| {
            let ok = keep(rc);
            if !ok {
                removed.push(*id);
            }
            ok
        });
        removed
    }

    pub async fn len(&self) -> usize {
        self.contacts.read().await.len()
    }

    pub async fn all(&self) -> Vec<RouterContact> {
        self.contacts.read().await.values().cloned().collect()
    }

    /// Load persisted RCs, skipping unparseable or expired files
    pub async fn load_from_disk(&self, now: Timestamp) -> std::io::Result<usize> {
        let Some(dir) = self.store_dir.clone() else {
            return Ok(0);
        };
        if !dir.exists() {
            return Ok(0);
        }

        let mut loaded = 0;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let bytes = match tokio::fs::read(entry.path()).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %entry.path().display(), "unreadable RC file: {}", e);
                    continue;
                }
            };
            match RouterContact::decode(&bytes) {
                Ok(rc) if rc.is_valid(now).is_ok() => {
                    self.put(rc).await;
                    loaded += 1;
                }
                Ok(rc) => {
                    debug!(router = %rc.router_id, "skipping stale persisted RC");
                }
                Err(e) => {
                    warn!(path = %entry.path().display(), "malformed RC file: {}", e);
                }
            }
        }
        Ok(loaded)
    }

    /// Persist every stored RC to the store directory
    pub async fn flush_to_disk(&self) -> std::io::Result<usize> {
        let Some(dir) = self.store_dir.clone() else {
            return Ok(0);
        };
        tokio::fs::create_dir_all(&dir).await?;

        let contacts = self.all().await;
        let mut written = 0;
        for rc in contacts {
            let Ok(bytes) = rc.encode() else { continue };
            let path = Self::rc_path(&dir, &rc.router_id);
            tokio::fs::write(path, bytes).await?;
            written += 1;
        }
        Ok(written)
    }

    fn rc_path(dir: &Path, router: &RouterId) -> PathBuf {
        dir.join(format!("{}.signed", router.to_hex()))
    }
}

impl Default for NodeDb {
    fn default() -> Self {
        Self::new()
    }
}
