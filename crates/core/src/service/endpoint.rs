/// Service endpoint: the per-hidden-service local client
///
/// Owns the service identity and path set, publishes our introset, looks up
/// remote services, runs conversations and plumbs packets in both
/// directions. The TUN handler sits on top through the PacketHandler
/// capability; sealed frames leave through the FrameTransport seam, which
/// the daemon wires to the link manager.

use super::address::{Address, ConvoTag};
use super::auth::{AuthPolicy, AuthResult};
use super::introset::{IntroSet, Introduction};
use super::lookup::LookupTracker;
use super::outbound_context::{ContextState, OutboundContext};
use super::protocol::{ConvoKeys, ProtocolFrame, ProtocolMessage, ProtocolType, SharedSecret};
use crate::dht::{DhtClient, DhtKey};
use crate::identity::{Identity, PublicKey, RouterId};
use crate::path::{Path, PathBuilder, PathId, PathSet};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use veilnet_common::config::service::{
    CONVO_TAG_IDLE_TIMEOUT, DEFAULT_PATH_LIFETIME, INTROSET_PUBLISH_INTERVAL,
    INTROSET_PUBLISH_RETRY_INTERVAL, INTROSET_RELAY_REDUNDANCY, MAX_OUTBOUND_CONTEXT_COUNT,
    MIN_INTROS_FOR_PUBLISH,
};
use veilnet_common::Timestamp;

/// Oldest pending buffers are shed past this depth, per address
const MAX_PENDING_TRAFFIC: usize = 32;

/// In-flight introset lookups time out after this long
const LOOKUP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Paths the endpoint keeps built
    pub num_paths: usize,

    /// Hops per path
    pub hops: usize,

    /// Whether we publish an introset (hidden services do, clients may not)
    pub publish_introset: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            num_paths: 4,
            hops: 3,
            publish_introset: true,
        }
    }
}

/// Capability the TUN (or other) handler supplies for inbound payloads
#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn handle_inbound_packet(
        &self,
        tag: ConvoTag,
        buf: Vec<u8>,
        proto: ProtocolType,
        seqno: u64,
    );
}

/// Sends sealed frames out over a path; wired to the link manager
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Deliver `frame` over `path`, entering the remote service at `intro`
    async fn send_frame(&self, path: &Path, intro: Introduction, frame: ProtocolFrame) -> bool;

    /// Deliver raw exit traffic to a service node
    async fn send_exit_frame(&self, router: RouterId, buf: Vec<u8>) -> bool;
}

/// Resolves LNS names to service addresses; wired to the RPC bridge
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Option<Address>;
}

/// Hook invoked when a path to a service becomes (or fails to become) ready
pub type PathEnsureHook = Box<dyn FnOnce(Address, bool) + Send + Sync>;

/// State for a running conversation
pub struct Session {
    pub remote: Address,
    pub remote_key: PublicKey,
    pub secret: SharedSecret,

    /// Last known introduction of the remote
    pub remote_intro: Option<Introduction>,

    /// Where the remote wants replies
    pub reply_intro: Option<Introduction>,

    pub seqno: u64,
    pub last_used: Timestamp,
    pub inbound: bool,
}

/// Decrypted message awaiting dispatch to the packet handler
struct RecvDataEvent {
    tag: ConvoTag,
    proto: ProtocolType,
    seqno: u64,
    payload: Vec<u8>,
}

struct PendingBuffer {
    proto: ProtocolType,
    payload: Vec<u8>,
}

struct EndpointState {
    outbound_contexts: HashMap<Address, Vec<OutboundContext>>,
    sessions: HashMap<ConvoTag, Session>,
    pending_traffic: HashMap<Address, VecDeque<PendingBuffer>>,
    pending_hooks: HashMap<Address, Vec<PathEnsureHook>>,
    lookups: LookupTracker,
    lns_cache: HashMap<String, (Address, Timestamp)>,
    snode_blacklist: HashSet<RouterId>,
    inbound_queue: VecDeque<RecvDataEvent>,

    introset_version: u64,
    last_publish: Timestamp,
    last_publish_attempt: Timestamp,
    publish_fails: u32,
}

pub struct Endpoint {
    identity: Identity,
    convo_keys: ConvoKeys,
    address: Address,
    config: EndpointConfig,

    pub paths: PathSet,
    path_builder: Arc<dyn PathBuilder>,
    dht: Arc<dyn DhtClient>,
    transport: Arc<dyn FrameTransport>,

    state: RwLock<EndpointState>,
    packet_handler: RwLock<Option<Arc<dyn PacketHandler>>>,
    auth_policy: RwLock<Option<Arc<dyn AuthPolicy>>>,
    name_resolver: RwLock<Option<Arc<dyn NameResolver>>>,

    builds_in_flight: AtomicUsize,
    stopping: AtomicBool,
}

impl Endpoint {
    pub fn new(
        identity: Identity,
        config: EndpointConfig,
        dht: Arc<dyn DhtClient>,
        path_builder: Arc<dyn PathBuilder>,
        transport: Arc<dyn FrameTransport>,
    ) -> Arc<Self> {
        let convo_keys = ConvoKeys::from_identity(&identity);
        let address = Address::from_public_key(&identity.public_key());
        info!(%address, "service endpoint created");
        Arc::new(Self {
            identity,
            convo_keys,
            address,
            config,
            paths: PathSet::new(),
            path_builder,
            dht,
            transport,
            state: RwLock::new(EndpointState {
                outbound_contexts: HashMap::new(),
                sessions: HashMap::new(),
                pending_traffic: HashMap::new(),
                pending_hooks: HashMap::new(),
                lookups: LookupTracker::new(),
                lns_cache: HashMap::new(),
                snode_blacklist: HashSet::new(),
                inbound_queue: VecDeque::new(),
                introset_version: 0,
                last_publish: Timestamp::ZERO,
                last_publish_attempt: Timestamp::ZERO,
                publish_fails: 0,
            }),
            packet_handler: RwLock::new(None),
            auth_policy: RwLock::new(None),
            name_resolver: RwLock::new(None),
            builds_in_flight: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub async fn set_packet_handler(&self, handler: Arc<dyn PacketHandler>) {
        *self.packet_handler.write().await = Some(handler);
    }

    pub async fn set_auth_policy(&self, policy: Arc<dyn AuthPolicy>) {
        *self.auth_policy.write().await = Some(policy);
    }

    pub async fn set_name_resolver(&self, resolver: Arc<dyn NameResolver>) {
        *self.name_resolver.write().await = Some(resolver);
    }

    pub async fn blacklist_snode(&self, router: RouterId) {
        self.state.write().await.snode_blacklist.insert(router);
    }

    /// Per-tick maintenance, called every ~100 ms
    pub async fn tick(self: &Arc<Self>, now: Timestamp) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }

        self.paths.expire_tick(now).await;
        self.maintain_paths().await;

        if self.config.publish_introset && self.should_publish(now).await {
            self.publish_introset(now).await;
        }

        self.pump_contexts(now).await;
        self.expire_lookups(now).await;
        self.flush_recv_data().await;
        self.evict_idle_convo_tags(now).await;
    }

    /// Cooperative stop: cancel lookups, fail pending hooks, drop paths
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let (hooks, lookups) = {
            let mut state = self.state.write().await;
            let hooks: Vec<(Address, Vec<PathEnsureHook>)> =
                state.pending_hooks.drain().collect();
            let lookups = state.lookups.clear();
            state.pending_traffic.clear();
            state.inbound_queue.clear();
            (hooks, lookups)
        };
        for (addr, callbacks) in hooks {
            for hook in callbacks {
                hook(addr, false);
            }
        }
        debug!(count = lookups.len(), "cancelled pending lookups");
        self.paths.clear().await;
        info!(address = %self.address, "endpoint stopped");
    }

    // ------------------------------------------------------------------
    // path upkeep + introset publication

    async fn maintain_paths(self: &Arc<Self>) {
        let have = self.paths.len().await;
        let want = self.config.num_paths;
        let in_flight = self.builds_in_flight.load(Ordering::SeqCst);
        if have + in_flight >= want {
            return;
        }

        let blacklist = self.state.read().await.snode_blacklist.clone();
        for _ in 0..(want - have - in_flight) {
            let endpoint = self.clone();
            let blacklist = blacklist.clone();
            self.builds_in_flight.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let result = endpoint
                    .path_builder
                    .build_path(None, endpoint.config.hops, blacklist)
                    .await;
                endpoint.builds_in_flight.fetch_sub(1, Ordering::SeqCst);
                match result {
                    Ok(path) => {
                        debug!(path = %path.id, "endpoint path built");
                        endpoint.paths.add(path).await;
                    }
                    Err(e) => debug!("endpoint path build failed: {}", e),
                }
            });
        }
    }

    async fn should_publish(&self, now: Timestamp) -> bool {
        let state = self.state.read().await;
        let ready = self.paths.num_established(now).await;
        if ready < MIN_INTROS_FOR_PUBLISH {
            return false;
        }
        if state.publish_fails > 0 {
            return now.since(state.last_publish_attempt) >= INTROSET_PUBLISH_RETRY_INTERVAL;
        }
        now.since(state.last_publish) >= INTROSET_PUBLISH_INTERVAL
    }

    /// Build a fresh introset from the current paths and push it to the
    /// DHT over the replication paths
    pub async fn publish_introset(&self, now: Timestamp) -> bool {
        let introset = {
            let mut state = self.state.write().await;
            state.introset_version += 1;
            state.last_publish_attempt = now;
            let intros: Vec<Introduction> = self
                .paths
                .established(now)
                .await
                .iter()
                .filter_map(|p| {
                    Some(Introduction {
                        router: p.terminal_router()?,
                        path_id: p.id,
                        expires_at: p.expires_at,
                    })
                })
                .collect();
            IntroSet::create(
                &self.identity,
                self.convo_keys.public().to_bytes(),
                intros,
                state.introset_version,
                now.add(DEFAULT_PATH_LIFETIME),
            )
        };

        let sealed = match introset.seal() {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("introset seal failed: {}", e);
                return false;
            }
        };

        let mut ok = true;
        for relay_order in 0..INTROSET_RELAY_REDUNDANCY as u8 {
            if let Err(e) = self.dht.publish_intro(sealed.clone(), relay_order).await {
                debug!(relay_order, "introset publish failed: {}", e);
                ok = false;
            }
        }

        let mut state = self.state.write().await;
        if ok {
            state.last_publish = now;
            state.publish_fails = 0;
            info!(version = introset.version, "introset published");
        } else {
            state.publish_fails += 1;
        }
        ok
    }

    // ------------------------------------------------------------------
    // remote lookup + outbound contexts

    /// Ensure a context to `addr` is building; `hook` fires when it is
    /// ready or when the attempt fails
    ///
    /// Returns false while the address is in lookup cooldown.
    pub fn ensure_path_to_service<'a>(
        self: &'a Arc<Self>,
        addr: Address,
        hook: PathEnsureHook,
        now: Timestamp,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(self.ensure_path_to_service_impl(addr, hook, now))
    }

    async fn ensure_path_to_service_impl(
        self: &Arc<Self>,
        addr: Address,
        hook: PathEnsureHook,
        now: Timestamp,
    ) -> bool {
        if self.stopping.load(Ordering::SeqCst) {
            hook(addr, false);
            return false;
        }

        {
            let state = self.state.read().await;
            if let Some(contexts) = state.outbound_contexts.get(&addr) {
                if contexts.iter().any(|c| c.ready_to_send(now)) {
                    drop(state);
                    hook(addr, true);
                    return true;
                }
            }
        }

        let txid = {
            let mut state = self.state.write().await;
            let relay_order =
                (state.lookups.pending_count() % INTROSET_RELAY_REDUNDANCY) as u8;
            match state.lookups.begin(addr, relay_order, now) {
                Some(txid) => {
                    state.pending_hooks.entry(addr).or_default().push(hook);
                    Some((txid, relay_order))
                }
                None => {
                    // in cooldown; keep the hook if a lookup is still in
                    // flight, otherwise report failure
                    if state.lookups.pending_for(&addr) > 0 {
                        state.pending_hooks.entry(addr).or_default().push(hook);
                        None
                    } else {
                        drop(state);
                        hook(addr, false);
                        return false;
                    }
                }
            }
        };

        if let Some((txid, relay_order)) = txid {
            let endpoint = self.clone();
            tokio::spawn(async move {
                let location = DhtKey::for_bytes(addr.as_bytes());
                let result = tokio::time::timeout(
                    LOOKUP_TIMEOUT,
                    endpoint.dht.find_intro(location, relay_order),
                )
                .await;
                match result {
                    Ok(Ok(found)) => {
                        endpoint
                            .handle_intro_lookup_result(txid, addr, found, Timestamp::now())
                            .await;
                    }
                    Ok(Err(e)) => {
                        debug!(%addr, "introset lookup failed: {}", e);
                        endpoint.fail_lookup(txid, addr).await;
                    }
                    Err(_) => {
                        debug!(%addr, "introset lookup timed out");
                        endpoint.fail_lookup(txid, addr).await;
                    }
                }
            });
        }
        true
    }

    /// Pick the newest sealed introset, open it and feed the context table
    pub async fn handle_intro_lookup_result(
        self: &Arc<Self>,
        txid: u64,
        addr: Address,
        results: Vec<super::introset::EncryptedIntroSet>,
        now: Timestamp,
    ) {
        {
            let mut state = self.state.write().await;
            state.lookups.complete(txid);
        }

        let newest = results.into_iter().fold(None, |best, candidate| match best {
            None => Some(candidate),
            Some(current) if current.other_is_newer(&candidate) => Some(candidate),
            Some(current) => Some(current),
        });

        let Some(sealed) = newest else {
            self.fail_hooks(addr).await;
            return;
        };

        match sealed.open(&addr) {
            Ok(introset) if !introset.is_expired(now) => {
                self.put_new_outbound_context(introset, now).await;
            }
            Ok(_) => {
                debug!(%addr, "lookup returned an expired introset");
                self.fail_hooks(addr).await;
            }
            Err(e) => {
                warn!(%addr, "introset failed to open: {}", e);
                self.fail_hooks(addr).await;
            }
        }
    }

    async fn fail_lookup(self: &Arc<Self>, txid: u64, addr: Address) {
        {
            let mut state = self.state.write().await;
            state.lookups.complete(txid);
            if let Some(contexts) = state.outbound_contexts.get_mut(&addr) {
                for ctx in contexts {
                    ctx.lookup_fails = ctx.lookup_fails.saturating_add(1);
                }
            }
        }
        self.fail_hooks(addr).await;
    }

    async fn fail_hooks(&self, addr: Address) {
        let hooks = {
            let mut state = self.state.write().await;
            state.pending_hooks.remove(&addr).unwrap_or_default()
        };
        for hook in hooks {
            hook(addr, false);
        }
    }

    /// Update an existing context with the introset (preserves conversation
    /// keys) or create a fresh one, evicting the oldest past the cap
    pub async fn put_new_outbound_context(
        self: &Arc<Self>,
        introset: IntroSet,
        now: Timestamp,
    ) {
        let addr = introset.address;
        {
            let mut state = self.state.write().await;
            let contexts = state.outbound_contexts.entry(addr).or_default();

            let mut updated = false;
            for ctx in contexts.iter_mut() {
                if ctx.update_introset(introset.clone(), now) {
                    updated = true;
                    break;
                }
            }
            if !updated {
                contexts.push(OutboundContext::new(introset, now));
                if contexts.len() > MAX_OUTBOUND_CONTEXT_COUNT {
                    // oldest goes first
                    contexts.sort_by_key(|c| c.created_at());
                    let dropped = contexts.remove(0);
                    debug!(target = %dropped.target, "outbound context cap reached, evicted oldest");
                }
            }
        }
        // kick a build immediately rather than waiting a full tick
        self.pump_contexts(now).await;
    }

    pub async fn num_outbound_contexts_for(&self, addr: &Address) -> usize {
        self.state
            .read()
            .await
            .outbound_contexts
            .get(addr)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub async fn num_pending_lookups_for(&self, addr: &Address) -> usize {
        self.state.read().await.lookups.pending_for(addr)
    }

    async fn pump_contexts(self: &Arc<Self>, now: Timestamp) {
        let mut builds: Vec<(Address, Introduction)> = Vec::new();
        {
            let mut state = self.state.write().await;
            for (addr, contexts) in state.outbound_contexts.iter_mut() {
                contexts.retain_mut(|ctx| {
                    let dead = ctx.pump(now);
                    if dead {
                        debug!(target = %addr, "dropping dead outbound context");
                        return false;
                    }
                    if ctx.should_build(now) {
                        if let Some(intro) = ctx.build_target() {
                            ctx.build_started(now);
                            builds.push((*addr, intro));
                        }
                    }
                    true
                });
            }
            state
                .outbound_contexts
                .retain(|_, contexts| !contexts.is_empty());
        }

        for (addr, intro) in builds {
            let endpoint = self.clone();
            tokio::spawn(async move {
                let blacklist = endpoint.state.read().await.snode_blacklist.clone();
                let result = endpoint
                    .path_builder
                    .build_path(Some(intro.router), endpoint.config.hops, blacklist)
                    .await;
                let now = Timestamp::now();
                let mut ready = false;
                {
                    let mut state = endpoint.state.write().await;
                    if let Some(contexts) = state.outbound_contexts.get_mut(&addr) {
                        for ctx in contexts.iter_mut() {
                            if ctx.state() == ContextState::Building {
                                match &result {
                                    Ok(_) => {
                                        ctx.handle_path_built();
                                        ready = true;
                                    }
                                    Err(_) => ctx.handle_build_failed(now),
                                }
                            }
                        }
                    }
                }
                if let Ok(path) = result {
                    endpoint.paths.add(path).await;
                }
                if ready {
                    endpoint.context_became_ready(addr, now).await;
                }
            });
        }
    }

    /// Fire hooks and flush queued traffic once a context can send
    async fn context_became_ready(self: &Arc<Self>, addr: Address, now: Timestamp) {
        let (hooks, queued) = {
            let mut state = self.state.write().await;
            let hooks = state.pending_hooks.remove(&addr).unwrap_or_default();
            let queued = state.pending_traffic.remove(&addr).unwrap_or_default();
            (hooks, queued)
        };
        for hook in hooks {
            hook(addr, true);
        }
        for buffer in queued {
            self.send_to_service_or_queue(addr, buffer.payload, buffer.proto, now)
                .await;
        }
    }

    // ------------------------------------------------------------------
    // sending

    /// Send to a remote service, queueing and arranging a lookup + build
    /// when no context is ready yet
    pub async fn send_to_service_or_queue(
        self: &Arc<Self>,
        addr: Address,
        payload: Vec<u8>,
        proto: ProtocolType,
        now: Timestamp,
    ) -> bool {
        if self.stopping.load(Ordering::SeqCst) {
            return false;
        }

        let frame_info = {
            let mut state = self.state.write().await;
            let Some(contexts) = state.outbound_contexts.get_mut(&addr) else {
                drop(state);
                self.queue_traffic(addr, payload, proto, now).await;
                return true;
            };
            let Some(ctx) = contexts.iter_mut().find(|c| c.ready_to_send(now)) else {
                drop(state);
                self.queue_traffic(addr, payload, proto, now).await;
                return true;
            };

            let Some(intro) = ctx.current_intro() else {
                drop(state);
                self.queue_traffic(addr, payload, proto, now).await;
                return true;
            };
            let tag = ctx.tag;
            let seqno = ctx.next_seqno();
            let reply_intro = self.best_reply_intro(now).await;
            let message = ProtocolMessage {
                tag,
                proto,
                seqno,
                sender: self.address,
                sender_key: self.identity.public_key(),
                reply_intro,
                payload,
            };

            match &ctx.shared_secret {
                Some(secret) => match ProtocolFrame::seal_with_secret(&message, secret) {
                    Ok(frame) => Some((intro, frame, tag, None)),
                    Err(e) => {
                        warn!(%addr, "frame seal failed: {}", e);
                        None
                    }
                },
                None => {
                    let convo_key =
                        x25519_dalek::PublicKey::from(ctx.introset().convo_key);
                    match ProtocolFrame::seal_handshake(&message, &convo_key) {
                        Ok((frame, secret)) => {
                            ctx.shared_secret = Some(secret.clone());
                            Some((intro, frame, tag, Some((message, secret))))
                        }
                        Err(e) => {
                            warn!(%addr, "handshake seal failed: {}", e);
                            None
                        }
                    }
                }
            }
        };

        let Some((intro, frame, tag, session_seed)) = frame_info else {
            return false;
        };

        // record the conversation for inbound demultiplexing
        if let Some((message, secret)) = session_seed {
            let mut state = self.state.write().await;
            state.sessions.insert(
                tag,
                Session {
                    remote: addr,
                    remote_key: message.sender_key,
                    secret,
                    remote_intro: Some(intro),
                    reply_intro: None,
                    seqno: 0,
                    last_used: now,
                    inbound: false,
                },
            );
        }

        let Some(path) = self.paths.pick_established(now).await else {
            warn!(%addr, "no path to carry frame, dropped");
            return false;
        };

        let sent = self.transport.send_frame(&path, intro, frame).await;
        if !sent {
            debug!(%addr, "frame transport refused send");
        }
        sent
    }

    /// Send raw exit traffic toward a service node
    pub async fn send_to_snode_or_queue(
        self: &Arc<Self>,
        router: RouterId,
        payload: Vec<u8>,
    ) -> bool {
        if self.stopping.load(Ordering::SeqCst) {
            return false;
        }
        self.transport.send_exit_frame(router, payload).await
    }

    async fn queue_traffic(
        self: &Arc<Self>,
        addr: Address,
        payload: Vec<u8>,
        proto: ProtocolType,
        now: Timestamp,
    ) {
        {
            let mut state = self.state.write().await;
            let queue = state.pending_traffic.entry(addr).or_default();
            queue.push_back(PendingBuffer { proto, payload });
            while queue.len() > MAX_PENDING_TRAFFIC {
                queue.pop_front();
                debug!(%addr, "pending traffic overflow, oldest dropped");
            }
        }
        self.ensure_path_to_service(addr, Box::new(|_, _| {}), now)
            .await;
    }

    /// The freshest introduction a remote can reply to us through
    async fn best_reply_intro(&self, now: Timestamp) -> Option<Introduction> {
        self.paths
            .established(now)
            .await
            .iter()
            .filter_map(|p| {
                Some(Introduction {
                    router: p.terminal_router()?,
                    path_id: p.id,
                    expires_at: p.expires_at,
                })
            })
            .max_by_key(|i| i.expires_at)
    }

    // ------------------------------------------------------------------
    // inbound

    /// A protocol frame arrived on one of our paths
    pub async fn handle_inbound_frame(
        self: &Arc<Self>,
        path_id: PathId,
        frame: ProtocolFrame,
        now: Timestamp,
    ) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }

        let known_secret = {
            let state = self.state.read().await;
            state.sessions.get(&frame.tag).map(|s| s.secret.clone())
        };

        match known_secret {
            Some(secret) => match frame.open_with_secret(&secret) {
                Ok(message) => self.accept_message(message, now).await,
                Err(e) => warn!(tag = %frame.tag, "frame failed to open: {}", e),
            },
            None => match frame.open_handshake(&self.convo_keys) {
                Ok((message, secret)) => {
                    self.accept_new_convo(message, secret, now).await;
                }
                Err(e) => {
                    warn!(path = %path_id, "unreadable frame on path: {}", e);
                }
            },
        }
    }

    async fn accept_new_convo(
        self: &Arc<Self>,
        message: ProtocolMessage,
        secret: SharedSecret,
        now: Timestamp,
    ) {
        let verdict = {
            let policy = self.auth_policy.read().await.clone();
            match policy {
                Some(policy) => policy.authenticate(message.sender, &message).await,
                None => AuthResult::Accepted,
            }
        };

        if !verdict.allowed() {
            info!(remote = %message.sender, ?verdict, "inbound conversation rejected");
            self.send_auth_result(&message, &secret, verdict, now).await;
            return;
        }

        {
            let mut state = self.state.write().await;
            state.sessions.insert(
                message.tag,
                Session {
                    remote: message.sender,
                    remote_key: message.sender_key,
                    secret,
                    remote_intro: message.reply_intro,
                    reply_intro: message.reply_intro,
                    seqno: 0,
                    last_used: now,
                    inbound: true,
                },
            );
        }
        debug!(remote = %message.sender, tag = %message.tag, "conversation accepted");
        self.accept_message(message, now).await;
    }

    async fn accept_message(self: &Arc<Self>, message: ProtocolMessage, now: Timestamp) {
        {
            let mut state = self.state.write().await;
            if let Some(session) = state.sessions.get_mut(&message.tag) {
                session.last_used = now;
                if message.reply_intro.is_some() {
                    session.reply_intro = message.reply_intro;
                }
            }
            state.inbound_queue.push_back(RecvDataEvent {
                tag: message.tag,
                proto: message.proto,
                seqno: message.seqno,
                payload: message.payload,
            });
        }

        // inbound traffic keeps the matching outbound context alive
        let remote = message.sender;
        let mut state = self.state.write().await;
        if let Some(contexts) = state.outbound_contexts.get_mut(&remote) {
            for ctx in contexts.iter_mut() {
                ctx.record_inbound_traffic(now);
            }
        }
    }

    /// Synthesize an Auth reply for a rejected conversation
    async fn send_auth_result(
        self: &Arc<Self>,
        message: &ProtocolMessage,
        secret: &SharedSecret,
        verdict: AuthResult,
        now: Timestamp,
    ) {
        let Some(reply_intro) = message.reply_intro else {
            return;
        };
        let payload = match serde_json::to_vec(&verdict) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        let reply = ProtocolMessage {
            tag: message.tag,
            proto: ProtocolType::Auth,
            seqno: 0,
            sender: self.address,
            sender_key: self.identity.public_key(),
            reply_intro: self.best_reply_intro(now).await,
            payload,
        };
        let Ok(frame) = ProtocolFrame::seal_with_secret(&reply, secret) else {
            return;
        };
        if let Some(path) = self.paths.pick_established(now).await {
            self.transport.send_frame(&path, reply_intro, frame).await;
        }
    }

    /// Drain decrypted messages into the packet handler
    pub async fn flush_recv_data(&self) {
        let handler = self.packet_handler.read().await.clone();
        let events: Vec<RecvDataEvent> = {
            let mut state = self.state.write().await;
            state.inbound_queue.drain(..).collect()
        };
        let Some(handler) = handler else {
            if !events.is_empty() {
                debug!(count = events.len(), "no packet handler, inbound dropped");
            }
            return;
        };
        for event in events {
            handler
                .handle_inbound_packet(event.tag, event.payload, event.proto, event.seqno)
                .await;
        }
    }

    // ------------------------------------------------------------------
    // conversation tags

    /// The most recently active conversation with `addr`
    pub async fn get_best_convo_tag_for(&self, addr: &Address) -> Option<ConvoTag> {
        let state = self.state.read().await;
        state
            .sessions
            .iter()
            .filter(|(_, s)| s.remote == *addr)
            .max_by_key(|(_, s)| s.last_used)
            .map(|(tag, _)| *tag)
    }

    pub async fn remove_all_convo_tags_for(&self, addr: &Address) {
        let mut state = self.state.write().await;
        state.sessions.retain(|_, s| s.remote != *addr);
    }

    async fn evict_idle_convo_tags(&self, now: Timestamp) {
        let mut state = self.state.write().await;
        state.sessions.retain(|tag, s| {
            let keep = now.since(s.last_used) <= CONVO_TAG_IDLE_TIMEOUT;
            if !keep {
                debug!(%tag, "evicting idle conversation");
            }
            keep
        });
    }

    pub async fn num_sessions(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    /// Remote address a conversation belongs to
    pub async fn session_remote(&self, tag: &ConvoTag) -> Option<Address> {
        self.state.read().await.sessions.get(tag).map(|s| s.remote)
    }

    // ------------------------------------------------------------------
    // lookup expiry + LNS

    async fn expire_lookups(self: &Arc<Self>, now: Timestamp) {
        let expired = {
            let mut state = self.state.write().await;
            state.lookups.expire(now, LOOKUP_TIMEOUT)
        };
        for lookup in expired {
            self.fail_hooks(lookup.target).await;
        }
    }

    /// Resolve an LNS name through the resolver, with caching
    pub async fn resolve_name(&self, name: &str, now: Timestamp) -> Option<Address> {
        {
            let state = self.state.read().await;
            if let Some((addr, expiry)) = state.lns_cache.get(name) {
                if !expiry.is_expired(now) {
                    return Some(*addr);
                }
            }
        }

        let resolver = self.name_resolver.read().await.clone()?;
        let addr = resolver.resolve(name).await?;
        self.state.write().await.lns_cache.insert(
            name.to_string(),
            (addr, now.add(std::time::Duration::from_secs(60 * 10))),
        );
        Some(addr)
    }
}
