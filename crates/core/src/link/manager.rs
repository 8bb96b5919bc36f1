/// Link manager
///
/// Inventory of transport links and their live sessions. Multiplexes sends
/// to a remote router across the best live session, tracks keep-alive
/// commitments, and feeds session deltas into the peer db.

use super::session::{CompletionHandler, DeliveryStatus, LinkSession, SessionStats};
use super::Link;
use crate::identity::RouterId;
use crate::router::contact::RouterContact;
use crate::router::peer_db::PeerDb;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use veilnet_common::Timestamp;

/// Creates outbound sessions on demand
///
/// Implemented by the daemon; the manager only requests sessions, it never
/// dials by itself.
#[async_trait]
pub trait SessionMaker: Send + Sync {
    async fn create_session_to(&self, router: RouterId);
}

pub struct LinkManager {
    state: Mutex<ManagerState>,
}

struct ManagerState {
    stopping: bool,
    inbound_links: Vec<Arc<dyn Link>>,
    outbound_links: Vec<Arc<dyn Link>>,

    /// Keep-alive commitments: keep a session to the peer until the deadline
    persisting: HashMap<RouterId, Timestamp>,

    /// Last observed stats per peer, for peer-db diffing
    last_stats: HashMap<RouterId, SessionStats>,

    session_maker: Option<Arc<dyn SessionMaker>>,
}

impl LinkManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManagerState {
                stopping: false,
                inbound_links: Vec::new(),
                outbound_links: Vec::new(),
                persisting: HashMap::new(),
                last_stats: HashMap::new(),
                session_maker: None,
            }),
        }
    }

    pub async fn set_session_maker(&self, maker: Arc<dyn SessionMaker>) {
        self.state.lock().await.session_maker = Some(maker);
    }

    pub async fn add_link(&self, link: Arc<dyn Link>, inbound: bool) {
        let mut state = self.state.lock().await;
        if inbound {
            state.inbound_links.push(link);
        } else {
            state.outbound_links.push(link);
        }
    }

    /// Start every link; aborts on the first failure
    pub async fn start(&self) -> Result<(), super::LinkError> {
        let (outbound, inbound) = self.snapshot_links().await;

        info!(count = outbound.len(), "starting outbound links");
        for link in &outbound {
            link.start().await.map_err(|e| {
                warn!(link = link.name(), "outbound link failed to start");
                e
            })?;
            debug!(link = link.name(), "outbound link started");
        }

        if !inbound.is_empty() {
            info!(count = inbound.len(), "starting inbound links");
            for link in &inbound {
                link.start().await.map_err(|e| {
                    warn!(link = link.name(), "inbound link failed to start");
                    e
                })?;
                debug!(link = link.name(), "inbound link started");
            }
        }

        Ok(())
    }

    /// Idempotent: sets the stopping flag and stops every link
    pub async fn stop(&self) {
        let (outbound, inbound) = {
            let mut state = self.state.lock().await;
            if state.stopping {
                return;
            }
            info!("stopping links");
            state.stopping = true;
            (state.outbound_links.clone(), state.inbound_links.clone())
        };

        for link in outbound.iter().chain(inbound.iter()) {
            link.stop().await;
        }
    }

    pub async fn is_stopping(&self) -> bool {
        self.state.lock().await.stopping
    }

    /// First outbound link whose transport can dial the RC
    pub async fn get_compatible_link(&self, rc: &RouterContact) -> Option<Arc<dyn Link>> {
        let state = self.state.lock().await;
        if state.stopping {
            return None;
        }
        state
            .outbound_links
            .iter()
            .find(|link| link.is_compatible(rc))
            .cloned()
    }

    /// First link holding an established session to `remote`
    ///
    /// Outbound links are preferred because our keep-alive authority is
    /// over outbound sessions.
    pub async fn get_link_with_session_to(&self, remote: &RouterId) -> Option<Arc<dyn Link>> {
        let (outbound, inbound) = {
            let state = self.state.lock().await;
            if state.stopping {
                return None;
            }
            (state.outbound_links.clone(), state.inbound_links.clone())
        };

        for link in outbound.iter().chain(inbound.iter()) {
            if let Some(session) = link.session_to(remote).await {
                if session.is_established() {
                    return Some(link.clone());
                }
            }
        }
        None
    }

    pub async fn has_session_to(&self, remote: &RouterId) -> bool {
        self.get_link_with_session_to(remote).await.is_some()
    }

    /// Whether `remote` is a client: an inbound session tells us directly,
    /// an outbound session implies a relay (we only dial relays)
    pub async fn session_is_client(&self, remote: &RouterId) -> Option<bool> {
        let (outbound, inbound) = self.snapshot_links().await;

        for link in &inbound {
            if let Some(session) = link.session_to(remote).await {
                return Some(!session.is_relay());
            }
        }
        for link in &outbound {
            if link.session_to(remote).await.is_some() {
                return Some(false);
            }
        }
        None
    }

    /// Send `buf` to `remote` over the best live session
    ///
    /// When no session exists (or we are stopping) the completion fires with
    /// `Dropped` and false is returned. The completion is called exactly
    /// once either way.
    pub async fn send_to(
        &self,
        remote: RouterId,
        buf: Vec<u8>,
        completed: Option<CompletionHandler>,
    ) -> bool {
        if self.state.lock().await.stopping {
            if let Some(cb) = completed {
                cb(DeliveryStatus::Dropped);
            }
            return false;
        }

        let Some(link) = self.get_link_with_session_to(&remote).await else {
            if let Some(cb) = completed {
                cb(DeliveryStatus::Dropped);
            }
            return false;
        };

        match link.session_to(&remote).await {
            Some(session) => session.send(buf, completed).await,
            None => {
                if let Some(cb) = completed {
                    cb(DeliveryStatus::Dropped);
                }
                false
            }
        }
    }

    /// Drive I/O on every link
    pub async fn pump(&self) {
        let (outbound, inbound) = self.snapshot_links().await;
        for link in inbound.iter().chain(outbound.iter()) {
            link.pump().await;
        }
    }

    /// Purge the persisting entry and close all sessions to `remote`
    pub async fn deregister_peer(&self, remote: RouterId) {
        {
            let mut state = self.state.lock().await;
            state.persisting.remove(&remote);
        }
        let (outbound, inbound) = self.snapshot_links().await;
        for link in inbound.iter().chain(outbound.iter()) {
            link.close_session_to(&remote).await;
        }
        info!(%remote, "peer de-registered");
    }

    /// Commit to keeping a session to `remote` until at least `until`
    pub async fn persist_session_until(&self, remote: RouterId, until: Timestamp) {
        let mut state = self.state.lock().await;
        if state.stopping {
            return;
        }
        let entry = state.persisting.entry(remote).or_insert(until);
        if until > *entry {
            *entry = until;
        }
        debug!(%remote, until = %entry, "session persistence committed");
    }

    /// Enforce keep-alive commitments
    ///
    /// Live committed sessions get a keepalive; committed peers without a
    /// session are handed to the session maker after the lock is released;
    /// expired commitments are evicted and their sessions closed.
    pub async fn check_persisting_sessions(&self, now: Timestamp) {
        if self.state.lock().await.stopping {
            return;
        }

        let entries: Vec<(RouterId, Timestamp)> = {
            let state = self.state.lock().await;
            state.persisting.iter().map(|(r, t)| (*r, *t)).collect()
        };

        let mut sessions_needed = Vec::new();
        let mut expired = Vec::new();

        for (remote, deadline) in entries {
            if now < deadline {
                match self.get_link_with_session_to(&remote).await {
                    Some(link) => {
                        if let Some(session) = link.session_to(&remote).await {
                            session.send_keepalive().await;
                        }
                    }
                    None => sessions_needed.push(remote),
                }
            } else {
                expired.push(remote);
            }
        }

        if !expired.is_empty() {
            let (outbound, _) = self.snapshot_links().await;
            let mut state = self.state.lock().await;
            for remote in &expired {
                info!(%remote, "session persistence expired");
                state.persisting.remove(remote);
            }
            drop(state);
            for remote in &expired {
                for link in &outbound {
                    link.close_session_to(remote).await;
                }
            }
        }

        let maker = self.state.lock().await.session_maker.clone();
        if let Some(maker) = maker {
            for remote in sessions_needed {
                maker.create_session_to(remote).await;
            }
        }
    }

    /// Visit every session; outbound sessions are flagged true
    ///
    /// `randomize` shuffles within each link, not across links.
    pub async fn for_each_peer<F: FnMut(&dyn LinkSession, bool)>(
        &self,
        mut visit: F,
        randomize: bool,
    ) {
        let (outbound, inbound) = {
            let state = self.state.lock().await;
            if state.stopping {
                return;
            }
            (state.outbound_links.clone(), state.inbound_links.clone())
        };

        for link in &outbound {
            let mut sessions = link.sessions().await;
            if randomize {
                sessions.shuffle(&mut rand::thread_rng());
            }
            for session in &sessions {
                visit(session.as_ref(), true);
            }
        }
        for link in &inbound {
            let mut sessions = link.sessions().await;
            if randomize {
                sessions.shuffle(&mut rand::thread_rng());
            }
            for session in &sessions {
                visit(session.as_ref(), false);
            }
        }
    }

    /// Unique established peers whose RC marks them a public router
    pub async fn num_connected_routers(&self) -> usize {
        self.count_established(|rc| rc.public_router).await
    }

    /// Unique established peers whose RC does not mark them a public router
    pub async fn num_connected_clients(&self) -> usize {
        self.count_established(|rc| !rc.public_router).await
    }

    async fn count_established<F: Fn(&RouterContact) -> bool>(&self, pred: F) -> usize {
        let mut connected: HashSet<RouterId> = HashSet::new();
        self.for_each_peer(
            |session, _| {
                if session.is_established() {
                    let rc = session.remote_rc();
                    if pred(&rc) {
                        connected.insert(rc.router_id);
                    }
                }
            },
            false,
        )
        .await;
        connected.len()
    }

    pub async fn num_pending_connections(&self) -> usize {
        let (outbound, inbound) = self.snapshot_links().await;
        let mut pending = 0;
        for link in inbound.iter().chain(outbound.iter()) {
            pending += link.num_pending().await;
        }
        pending
    }

    /// Uniform-random pick among unique established peers
    pub async fn get_random_connected_router(&self) -> Option<RouterContact> {
        let mut connected: HashMap<RouterId, RouterContact> = HashMap::new();
        self.for_each_peer(
            |session, _| {
                if session.is_established() {
                    connected.insert(session.remote_id(), session.remote_rc());
                }
            },
            false,
        )
        .await;

        if connected.is_empty() {
            return None;
        }
        let ids: Vec<RouterId> = connected.keys().copied().collect();
        let picked = ids.choose(&mut rand::thread_rng())?;
        connected.remove(picked)
    }

    /// Fold session deltas since the last call into the peer db
    ///
    /// Rates take the max of current and last observation; totals
    /// accumulate the per-interval difference.
    pub async fn update_peer_db(&self, peer_db: &PeerDb) {
        let mut observed: Vec<(RouterId, SessionStats)> = Vec::new();
        self.for_each_peer(
            |session, _| {
                observed.push((session.remote_id(), session.stats()));
            },
            false,
        )
        .await;

        let mut updates: Vec<(RouterId, SessionStats, SessionStats)> = Vec::new();
        {
            let mut state = self.state.lock().await;
            for (remote, current) in observed {
                let last = state.last_stats.get(&remote).copied().unwrap_or_default();
                let diff = SessionStats {
                    rx_rate: current.rx_rate.max(last.rx_rate),
                    tx_rate: current.tx_rate.max(last.tx_rate),
                    rx_packets: current.rx_packets.saturating_sub(last.rx_packets),
                    acked_tx: current.acked_tx.saturating_sub(last.acked_tx),
                    dropped_tx: current.dropped_tx.saturating_sub(last.dropped_tx),
                    in_flight_tx: current.in_flight_tx.saturating_sub(last.in_flight_tx),
                };
                state.last_stats.insert(remote, current);
                updates.push((remote, diff, current));
            }
        }

        for (remote, diff, _) in updates {
            peer_db
                .modify_peer_stats(remote, |stats| {
                    stats.peak_bandwidth_bytes_per_sec = stats
                        .peak_bandwidth_bytes_per_sec
                        .max(diff.rx_rate.max(diff.tx_rate));
                    stats.packets_dropped += diff.dropped_tx;
                    stats.packets_sent += diff.acked_tx;
                    stats.packets_attempted +=
                        diff.acked_tx + diff.dropped_tx + diff.in_flight_tx;
                })
                .await;
        }
    }

    async fn snapshot_links(&self) -> (Vec<Arc<dyn Link>>, Vec<Arc<dyn Link>>) {
        let state = self.state.lock().await;
        (state.outbound_links.clone(), state.inbound_links.clone())
    }
}

impl Default for LinkManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::link::session::{SessionDirection, SessionState};
    use crate::link::LinkError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use veilnet_common::{NetworkAddress, TransportKind};

    fn make_rc(identity: &Identity, public_router: bool) -> RouterContact {
        RouterContact::create(
            identity,
            vec![NetworkAddress::from_socket("127.0.0.1:7000".parse().unwrap())],
            vec![TransportKind::Quic],
            public_router,
            Timestamp::now(),
        )
    }

    struct MemSession {
        rc: RouterContact,
        direction: SessionDirection,
        state: StdMutex<SessionState>,
        relay: bool,
        stats: StdMutex<SessionStats>,
        keepalives: AtomicUsize,
    }

    impl MemSession {
        fn established(rc: RouterContact, direction: SessionDirection, relay: bool) -> Arc<Self> {
            Arc::new(Self {
                rc,
                direction,
                state: StdMutex::new(SessionState::Established),
                relay,
                stats: StdMutex::new(SessionStats::default()),
                keepalives: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LinkSession for MemSession {
        fn remote_id(&self) -> RouterId {
            self.rc.router_id
        }

        fn remote_rc(&self) -> RouterContact {
            self.rc.clone()
        }

        fn direction(&self) -> SessionDirection {
            self.direction
        }

        fn state(&self) -> SessionState {
            *self.state.lock().unwrap()
        }

        fn is_relay(&self) -> bool {
            self.relay
        }

        fn stats(&self) -> SessionStats {
            *self.stats.lock().unwrap()
        }

        async fn send(&self, _buf: Vec<u8>, completed: Option<CompletionHandler>) -> bool {
            let mut stats = self.stats.lock().unwrap();
            stats.acked_tx += 1;
            drop(stats);
            if let Some(cb) = completed {
                cb(DeliveryStatus::Delivered);
            }
            true
        }

        async fn send_keepalive(&self) -> bool {
            self.keepalives.fetch_add(1, Ordering::SeqCst);
            true
        }

        async fn close(&self) {
            *self.state.lock().unwrap() = SessionState::Closed;
        }
    }

    struct MemLink {
        name: String,
        sessions: StdMutex<HashMap<RouterId, Arc<MemSession>>>,
        started: AtomicBool,
        stopped: AtomicBool,
        fail_start: bool,
    }

    impl MemLink {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                sessions: StdMutex::new(HashMap::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                fail_start: false,
            })
        }

        fn add_session(&self, session: Arc<MemSession>) {
            self.sessions
                .lock()
                .unwrap()
                .insert(session.remote_id(), session);
        }
    }

    #[async_trait]
    impl Link for MemLink {
        fn name(&self) -> &str {
            &self.name
        }

        fn transport(&self) -> TransportKind {
            TransportKind::Quic
        }

        fn is_compatible(&self, rc: &RouterContact) -> bool {
            rc.transports.contains(&TransportKind::Quic)
        }

        async fn start(&self) -> Result<(), LinkError> {
            if self.fail_start {
                return Err(LinkError::StartFailed {
                    name: self.name.clone(),
                    reason: "refused".to_string(),
                });
            }
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
            for session in self.sessions.lock().unwrap().values() {
                *session.state.lock().unwrap() = SessionState::Closed;
            }
        }

        async fn pump(&self) {}

        async fn session_to(&self, remote: &RouterId) -> Option<Arc<dyn LinkSession>> {
            self.sessions
                .lock()
                .unwrap()
                .get(remote)
                .cloned()
                .map(|s| s as Arc<dyn LinkSession>)
        }

        async fn sessions(&self) -> Vec<Arc<dyn LinkSession>> {
            self.sessions
                .lock()
                .unwrap()
                .values()
                .cloned()
                .map(|s| s as Arc<dyn LinkSession>)
                .collect()
        }

        async fn close_session_to(&self, remote: &RouterId) {
            if let Some(session) = self.sessions.lock().unwrap().remove(remote) {
                *session.state.lock().unwrap() = SessionState::Closed;
            }
        }

        async fn num_pending(&self) -> usize {
            0
        }
    }

    struct RecordingMaker {
        requested: StdMutex<Vec<RouterId>>,
    }

    #[async_trait]
    impl SessionMaker for RecordingMaker {
        async fn create_session_to(&self, router: RouterId) {
            self.requested.lock().unwrap().push(router);
        }
    }

    #[tokio::test]
    async fn test_send_with_no_session_drops_once() {
        let manager = LinkManager::new();
        manager.add_link(MemLink::new("out0"), false).await;

        let drops = Arc::new(AtomicUsize::new(0));
        let drops2 = drops.clone();
        let remote = Identity::generate().router_id();
        let sent = manager
            .send_to(
                remote,
                b"hello".to_vec(),
                Some(Box::new(move |status| {
                    assert_eq!(status, DeliveryStatus::Dropped);
                    drops2.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .await;

        assert!(!sent);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_delivers_over_established_session() {
        let manager = LinkManager::new();
        let link = MemLink::new("out0");
        let relay = Identity::generate();
        link.add_session(MemSession::established(
            make_rc(&relay, true),
            SessionDirection::Outbound,
            true,
        ));
        manager.add_link(link, false).await;

        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered2 = delivered.clone();
        let sent = manager
            .send_to(
                relay.router_id(),
                b"payload".to_vec(),
                Some(Box::new(move |status| {
                    assert_eq!(status, DeliveryStatus::Delivered);
                    delivered2.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .await;

        assert!(sent);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_semantics() {
        let manager = LinkManager::new();
        let link = MemLink::new("out0");
        let a = Identity::generate();
        let b = Identity::generate();
        link.add_session(MemSession::established(
            make_rc(&a, true),
            SessionDirection::Outbound,
            true,
        ));
        link.add_session(MemSession::established(
            make_rc(&b, true),
            SessionDirection::Outbound,
            true,
        ));
        manager.add_link(link, false).await;

        assert_eq!(manager.num_connected_routers().await, 2);

        manager.stop().await;
        manager.stop().await; // idempotent

        let drops = Arc::new(AtomicUsize::new(0));
        let drops2 = drops.clone();
        let sent = manager
            .send_to(
                a.router_id(),
                b"late".to_vec(),
                Some(Box::new(move |status| {
                    assert_eq!(status, DeliveryStatus::Dropped);
                    drops2.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .await;
        assert!(!sent);
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        // stopping hides sessions from every read path
        assert_eq!(manager.num_connected_routers().await, 0);
        assert!(!manager.has_session_to(&b.router_id()).await);
    }

    #[tokio::test]
    async fn test_session_is_client_tristate() {
        let manager = LinkManager::new();
        let inbound = MemLink::new("in0");
        let outbound = MemLink::new("out0");

        let client = Identity::generate();
        let relay = Identity::generate();
        inbound.add_session(MemSession::established(
            make_rc(&client, false),
            SessionDirection::Inbound,
            false,
        ));
        outbound.add_session(MemSession::established(
            make_rc(&relay, true),
            SessionDirection::Outbound,
            true,
        ));

        manager.add_link(inbound, true).await;
        manager.add_link(outbound, false).await;

        assert_eq!(manager.session_is_client(&client.router_id()).await, Some(true));
        assert_eq!(manager.session_is_client(&relay.router_id()).await, Some(false));
        let unknown = Identity::generate().router_id();
        assert_eq!(manager.session_is_client(&unknown).await, None);
    }

    #[tokio::test]
    async fn test_persisting_sessions() {
        let manager = LinkManager::new();
        let link = MemLink::new("out0");
        let connected = Identity::generate();
        let session = MemSession::established(
            make_rc(&connected, true),
            SessionDirection::Outbound,
            true,
        );
        link.add_session(session.clone());
        manager.add_link(link.clone(), false).await;

        let maker = Arc::new(RecordingMaker {
            requested: StdMutex::new(Vec::new()),
        });
        manager.set_session_maker(maker.clone()).await;

        let now = Timestamp::from_millis(10_000);
        let deadline = now.add(Duration::from_secs(10));
        let absent = Identity::generate().router_id();

        manager.persist_session_until(connected.router_id(), deadline).await;
        manager.persist_session_until(absent, deadline).await;

        // live committed session gets a keepalive, absent one is requested
        manager.check_persisting_sessions(now).await;
        assert_eq!(session.keepalives.load(Ordering::SeqCst), 1);
        assert_eq!(*maker.requested.lock().unwrap(), vec![absent]);

        // past the deadline the entries are evicted and the session closed
        let later = deadline.add(Duration::from_secs(1));
        manager.check_persisting_sessions(later).await;
        assert!(!manager.has_session_to(&connected.router_id()).await);

        // a second sweep finds nothing left to do
        manager.check_persisting_sessions(later).await;
        assert_eq!(maker.requested.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persist_until_keeps_max_deadline() {
        let manager = LinkManager::new();
        let remote = Identity::generate().router_id();
        let early = Timestamp::from_millis(5_000);
        let late = Timestamp::from_millis(9_000);

        manager.persist_session_until(remote, late).await;
        manager.persist_session_until(remote, early).await;

        let state = manager.state.lock().await;
        assert_eq!(state.persisting[&remote], late);
    }

    #[tokio::test]
    async fn test_deregister_peer_idempotent() {
        let manager = LinkManager::new();
        let link = MemLink::new("out0");
        let peer = Identity::generate();
        link.add_session(MemSession::established(
            make_rc(&peer, true),
            SessionDirection::Outbound,
            true,
        ));
        manager.add_link(link, false).await;
        manager
            .persist_session_until(peer.router_id(), Timestamp::from_millis(99_000))
            .await;

        manager.deregister_peer(peer.router_id()).await;
        assert!(!manager.has_session_to(&peer.router_id()).await);

        manager.deregister_peer(peer.router_id()).await;
        assert!(!manager.has_session_to(&peer.router_id()).await);
        assert!(manager.state.lock().await.persisting.is_empty());
    }

    #[tokio::test]
    async fn test_random_connected_router_empty() {
        let manager = LinkManager::new();
        assert!(manager.get_random_connected_router().await.is_none());
    }

    #[tokio::test]
    async fn test_counts_split_routers_and_clients() {
        let manager = LinkManager::new();
        let inbound = MemLink::new("in0");
        let client = Identity::generate();
        let relay = Identity::generate();
        inbound.add_session(MemSession::established(
            make_rc(&client, false),
            SessionDirection::Inbound,
            false,
        ));
        inbound.add_session(MemSession::established(
            make_rc(&relay, true),
            SessionDirection::Inbound,
            true,
        ));
        manager.add_link(inbound, true).await;

        assert_eq!(manager.num_connected_routers().await, 1);
        assert_eq!(manager.num_connected_clients().await, 1);
    }

    #[tokio::test]
    async fn test_update_peer_db_accumulates() {
        let manager = LinkManager::new();
        let link = MemLink::new("out0");
        let peer = Identity::generate();
        let session = MemSession::established(
            make_rc(&peer, true),
            SessionDirection::Outbound,
            true,
        );
        link.add_session(session.clone());
        manager.add_link(link, false).await;

        let peer_db = PeerDb::new();

        {
            let mut stats = session.stats.lock().unwrap();
            stats.acked_tx = 10;
            stats.dropped_tx = 2;
            stats.tx_rate = 512;
        }
        manager.update_peer_db(&peer_db).await;

        {
            let mut stats = session.stats.lock().unwrap();
            stats.acked_tx = 25;
            stats.dropped_tx = 3;
            stats.tx_rate = 128;
        }
        manager.update_peer_db(&peer_db).await;

        let stats = peer_db.get(&peer.router_id()).await.unwrap();
        assert_eq!(stats.packets_sent, 25);
        assert_eq!(stats.packets_dropped, 3);
        assert_eq!(stats.peak_bandwidth_bytes_per_sec, 512);
        // attempted counts acked + dropped deltas
        assert_eq!(stats.packets_attempted, 28);
    }
}
