/// Router-contact lookup handler
///
/// Supplies validated RouterContacts for any RouterId, asynchronously, with
/// coalescing of concurrent requests: at most one DHT lookup is in flight
/// per router, and every caller registered while it runs receives the same
/// result in registration order.

use super::contact::RouterContact;
use super::nodedb::NodeDb;
use crate::dht::{DhtClient, DhtError};
use crate::identity::RouterId;
use rand::seq::IteratorRandom;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use veilnet_common::config::lookup::{LOOKUP_TIMEOUT, RC_REFRESH_INTERVAL};
use veilnet_common::Timestamp;

/// Outcome delivered to a lookup callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    Success,
    NotFound,
    Timeout,
    Cancelled,
}

pub type RcCallback = Box<dyn FnOnce(RouterId, Option<RouterContact>, LookupResult) + Send>;

#[derive(Clone)]
pub struct RcLookupHandler {
    inner: Arc<Inner>,
}

struct Inner {
    nodedb: Arc<NodeDb>,
    dht: Arc<dyn DhtClient>,

    /// Explicit always-allowed peers (client mode)
    strict_connect: HashSet<RouterId>,

    /// Routers we bootstrapped from, always dialable
    bootstrap: HashSet<RouterId>,

    use_whitelist: bool,
    is_service_node: bool,

    /// Callback queues keyed by router, one DHT lookup per key
    pending: Mutex<HashMap<RouterId, Vec<RcCallback>>>,

    /// Whitelist plus the received-at-least-once latch
    whitelist: Mutex<WhitelistState>,

    /// When each router was last looked up on the DHT
    lookup_times: Mutex<HashMap<RouterId, Timestamp>>,
}

#[derive(Default)]
struct WhitelistState {
    routers: HashSet<RouterId>,
    received: bool,
}

impl RcLookupHandler {
    pub fn new(
        nodedb: Arc<NodeDb>,
        dht: Arc<dyn DhtClient>,
        strict_connect: HashSet<RouterId>,
        bootstrap: HashSet<RouterId>,
        use_whitelist: bool,
        is_service_node: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                nodedb,
                dht,
                strict_connect,
                bootstrap,
                use_whitelist,
                is_service_node,
                pending: Mutex::new(HashMap::new()),
                whitelist: Mutex::new(WhitelistState::default()),
                lookup_times: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Obtain an RC for `router`, from the local store when fresh, else via
    /// a coalesced DHT lookup
    pub async fn get_rc(&self, router: RouterId, callback: RcCallback, force: bool) {
        if !self.remote_is_allowed(&router) {
            debug!(%router, "lookup denied by policy");
            callback(router, None, LookupResult::NotFound);
            return;
        }

        let now = Timestamp::now();
        if !force {
            if let Some(rc) = self.inner.nodedb.get(&router, now).await {
                callback(router, Some(rc), LookupResult::Success);
                return;
            }
        }

        let dispatch = {
            let mut pending = self.inner.pending.lock().expect("pending lock");
            let queue = pending.entry(router).or_default();
            queue.push(callback);
            queue.len() == 1
        };

        if dispatch {
            self.inner
                .lookup_times
                .lock()
                .expect("lookup_times lock")
                .insert(router, now);

            let handler = self.clone();
            tokio::spawn(async move {
                handler.run_lookup(router).await;
            });
        }
    }

    /// Whether a lookup for `router` is currently in flight
    pub fn has_pending_lookup(&self, router: &RouterId) -> bool {
        self.inner
            .pending
            .lock()
            .expect("pending lock")
            .contains_key(router)
    }

    async fn run_lookup(&self, router: RouterId) {
        match timeout(LOOKUP_TIMEOUT, self.inner.dht.find_router(router)).await {
            Ok(Ok(results)) => self.handle_dht_result(router, results).await,
            Ok(Err(DhtError::NotFound)) => {
                self.finalize(router, None, LookupResult::NotFound);
            }
            Ok(Err(e)) => {
                debug!(%router, "dht lookup failed: {}", e);
                self.finalize(router, None, LookupResult::NotFound);
            }
            Err(_) => {
                debug!(%router, "dht lookup timed out");
                self.finalize(router, None, LookupResult::Timeout);
            }
        }
    }

    /// Select the newest verifiable RC among the results and finalize
    pub async fn handle_dht_result(&self, router: RouterId, results: Vec<RouterContact>) {
        let now = Timestamp::now();
        let mut best: Option<RouterContact> = None;
        for rc in results {
            if rc.router_id != router {
                warn!(%router, "dht result for wrong router, skipping");
                continue;
            }
            if !self.check_rc(&rc, now) {
                continue;
            }
            match &best {
                Some(current) if !rc.is_newer_than(current) => {}
                _ => best = Some(rc),
            }
        }

        match best {
            Some(rc) => {
                self.inner.nodedb.put(rc.clone()).await;
                self.finalize(router, Some(rc), LookupResult::Success);
            }
            None => self.finalize(router, None, LookupResult::NotFound),
        }
    }

    /// Drain and invoke every pending callback for `router`
    fn finalize(&self, router: RouterId, rc: Option<RouterContact>, result: LookupResult) {
        let callbacks = {
            let mut pending = self.inner.pending.lock().expect("pending lock");
            pending.remove(&router).unwrap_or_default()
        };
        for cb in callbacks {
            cb(router, rc.clone(), result);
        }
    }

    /// Cancel every in-flight lookup, delivering `Cancelled`
    pub fn cancel_all(&self) {
        let drained: Vec<(RouterId, Vec<RcCallback>)> = {
            let mut pending = self.inner.pending.lock().expect("pending lock");
            pending.drain().collect()
        };
        for (router, callbacks) in drained {
            for cb in callbacks {
                cb(router, None, LookupResult::Cancelled);
            }
        }
    }

    /// Validate an RC: signature, expiry, version band, whitelist policy
    pub fn check_rc(&self, rc: &RouterContact, now: Timestamp) -> bool {
        if rc.is_valid(now).is_err() {
            return false;
        }
        if self.inner.is_service_node && self.inner.use_whitelist {
            let whitelist = self.inner.whitelist.lock().expect("whitelist lock");
            if whitelist.received && !whitelist.routers.contains(&rc.router_id) {
                debug!(router = %rc.router_id, "RC rejected by whitelist");
                return false;
            }
        }
        true
    }

    /// Renegotiation check: pubkey unchanged, unexpired, signature valid
    pub fn check_renegotiate_valid(
        &self,
        new: &RouterContact,
        old: &RouterContact,
        now: Timestamp,
    ) -> bool {
        RouterContact::renegotiate_valid(new, old, now)
    }

    /// Whether we may hold sessions with `remote`
    ///
    /// Service nodes accept whitelisted and bootstrap peers. Clients accept
    /// strict-connect, bootstrap and whitelisted peers; with nothing
    /// configured the mesh is permissive.
    pub fn remote_is_allowed(&self, remote: &RouterId) -> bool {
        if self.inner.bootstrap.contains(remote) {
            return true;
        }

        let whitelist = self.inner.whitelist.lock().expect("whitelist lock");
        if self.inner.use_whitelist {
            return whitelist.routers.contains(remote);
        }

        if !self.inner.strict_connect.is_empty() {
            return self.inner.strict_connect.contains(remote)
                || whitelist.routers.contains(remote);
        }

        true
    }

    /// Uniform random pick from the whitelist
    pub fn get_random_whitelist_router(&self) -> Option<RouterId> {
        let whitelist = self.inner.whitelist.lock().expect("whitelist lock");
        whitelist.routers.iter().choose(&mut rand::thread_rng()).copied()
    }

    /// Atomic whitelist replace; flips the received latch
    pub fn set_router_whitelist(&self, routers: &[RouterId]) {
        let mut whitelist = self.inner.whitelist.lock().expect("whitelist lock");
        whitelist.routers = routers.iter().copied().collect();
        whitelist.received = true;
        info!(count = whitelist.routers.len(), "router whitelist updated");
    }

    pub fn have_received_whitelist(&self) -> bool {
        self.inner.whitelist.lock().expect("whitelist lock").received
    }

    pub fn num_strict_connect_routers(&self) -> usize {
        self.inner.strict_connect.len()
    }

    /// Re-verify stored RCs not looked up within the refresh interval,
    /// dropping those that no longer validate
    pub async fn periodic_update(&self, now: Timestamp) {
        let contacts = self.inner.nodedb.all().await;
        let stale: Vec<RouterId> = {
            let lookup_times = self.inner.lookup_times.lock().expect("lookup_times lock");
            contacts
                .iter()
                .filter(|rc| match lookup_times.get(&rc.router_id) {
                    Some(last) => now.since(*last) >= RC_REFRESH_INTERVAL,
                    None => true,
                })
                .map(|rc| rc.router_id)
                .collect()
        };

        let dropped = self
            .inner
            .nodedb
            .retain(|rc| rc.is_valid(now).is_ok())
            .await;
        for router in &dropped {
            debug!(%router, "dropped invalid stored RC");
        }

        for router in stale {
            self.get_rc(router, Box::new(|_, _, _| {}), true).await;
        }
    }

    /// Periodic DHT random-walk to discover peers
    pub async fn explore_network(&self) {
        match self.inner.dht.explore().await {
            Ok(found) => {
                debug!(count = found.len(), "network exploration found routers");
                for router in found {
                    if self.remote_is_allowed(&router) {
                        self.get_rc(router, Box::new(|_, _, _| {}), false).await;
                    }
                }
            }
            Err(e) => debug!("network exploration failed: {}", e),
        }
    }
}
