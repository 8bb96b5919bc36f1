/// Router wiring
///
/// Builds the component graph: identity, node db, RC lookup, link manager,
/// service endpoint and TUN handler, and drives their maintenance from one
/// tick task. The DHT messaging layer and path-build handshake are consumed
/// as services; the implementations here stand at those seams.

use crate::rpc::{ChainRpc, HttpChainRpc, RpcBridge, RpcNameResolver};
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use veilnet_common::config::tick;
use veilnet_common::{RouterConfig, Timestamp, TransportKind};
use veilnet_core::dht::{DhtClient, DhtError, DhtKey};
use veilnet_core::handlers::{TunConfig, TunEndpoint};
use veilnet_core::identity::{Identity, RouterId};
use veilnet_core::link::quic::MessageSink;
use veilnet_core::link::{LinkManager, QuicLink, SessionMaker};
use veilnet_core::path::{Path, PathBuilder, PathError, PathId, PathStatus};
use veilnet_core::router::contact::RouterContact;
use veilnet_core::service::endpoint::{Endpoint, EndpointConfig, FrameTransport};
use veilnet_core::service::introset::{EncryptedIntroSet, Introduction};
use veilnet_core::service::protocol::ProtocolFrame;
use veilnet_core::{NodeDb, PeerDb, RcLookupHandler};

pub struct Router {
    pub identity: Identity,
    pub config: RouterConfig,
    pub nodedb: Arc<NodeDb>,
    pub peer_db: Arc<PeerDb>,
    pub rc_lookup: RcLookupHandler,
    pub link_manager: Arc<LinkManager>,
    pub endpoint: Arc<Endpoint>,
    pub tun: Arc<TunEndpoint>,
    pub rpc_bridge: Option<Arc<RpcBridge>>,
    outbound_link: Arc<QuicLink>,

    stopping: AtomicBool,
}

impl Router {
    /// Build the component graph from a parsed configuration
    pub async fn configure(config: RouterConfig) -> Result<Arc<Self>> {
        let identity = Identity::load_or_generate(&config.data_dir.join("identity.json"))
            .context("identity key unreadable")?;
        info!(router_id = %identity.router_id(), "identity loaded");

        let nodedb = Arc::new(NodeDb::with_store_dir(config.data_dir.join("nodedb")));
        let now = Timestamp::now();
        let loaded = nodedb.load_from_disk(now).await.unwrap_or(0);
        debug!(count = loaded, "node db loaded");

        let peer_db = Arc::new(PeerDb::new());

        // bootstrap RCs come from files named in the config
        let mut bootstrap: HashSet<RouterId> = HashSet::new();
        for path in &config.bootstrap {
            match tokio::fs::read(path).await {
                Ok(bytes) => match RouterContact::decode(&bytes) {
                    Ok(rc) if rc.is_valid(now).is_ok() => {
                        bootstrap.insert(rc.router_id);
                        nodedb.put(rc).await;
                    }
                    Ok(_) => warn!(path = %path.display(), "stale bootstrap RC skipped"),
                    Err(e) => warn!(path = %path.display(), "bad bootstrap RC: {}", e),
                },
                Err(e) => warn!(path = %path.display(), "unreadable bootstrap RC: {}", e),
            }
        }

        let strict_connect: HashSet<RouterId> = config
            .strict_connect
            .iter()
            .filter_map(|hex| match RouterId::from_hex(hex) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(router = %hex, "bad strict-connect entry: {}", e);
                    None
                }
            })
            .collect();

        let link_manager = Arc::new(LinkManager::new());

        let our_rc = RouterContact::create(
            &identity,
            vec![veilnet_common::NetworkAddress::from_socket(config.bind_addr)],
            vec![TransportKind::Quic],
            config.service_node,
            now,
        );

        // inbound frames land on the endpoint once it exists; route through
        // a late-bound sink so link construction does not depend on it
        let frame_router = Arc::new(FrameRouter::new());
        let sink: MessageSink = {
            let frame_router = frame_router.clone();
            Arc::new(move |remote, data| frame_router.route(remote, data))
        };

        let outbound_link = Arc::new(QuicLink::new(
            "quic-out",
            "0.0.0.0:0".parse().expect("static addr"),
            identity.clone(),
            our_rc.clone(),
            false,
            sink.clone(),
        )?);
        link_manager.add_link(outbound_link.clone(), false).await;

        if config.service_node {
            let inbound_link = Arc::new(QuicLink::new(
                "quic-in",
                config.bind_addr,
                identity.clone(),
                our_rc.clone(),
                true,
                sink,
            )?);
            link_manager.add_link(inbound_link, true).await;
        }

        let dht: Arc<dyn DhtClient> = Arc::new(BootstrapDht {
            nodedb: nodedb.clone(),
            bootstrap: bootstrap.iter().copied().collect(),
        });

        let rc_lookup = RcLookupHandler::new(
            nodedb.clone(),
            dht.clone(),
            strict_connect,
            bootstrap,
            config.use_whitelist,
            config.service_node,
        );

        link_manager
            .set_session_maker(Arc::new(OutboundSessionMaker {
                rc_lookup: rc_lookup.clone(),
                outbound_link: outbound_link.clone(),
            }))
            .await;

        let path_builder: Arc<dyn PathBuilder> = Arc::new(SessionPathBuilder {
            nodedb: nodedb.clone(),
            link_manager: link_manager.clone(),
        });

        let transport: Arc<dyn FrameTransport> = Arc::new(LinkFrameTransport {
            link_manager: link_manager.clone(),
        });

        let endpoint = Endpoint::new(
            identity.clone(),
            EndpointConfig {
                num_paths: config.network.hops.max(2),
                hops: 3,
                publish_introset: true,
            },
            dht,
            path_builder,
            transport,
        );
        frame_router.bind(endpoint.clone());

        // the chain daemon feeds the whitelist and resolves LNS names
        let rpc_bridge = match config.rpc_url.clone() {
            Some(url) => {
                let rpc: Arc<dyn ChainRpc> = Arc::new(HttpChainRpc::new(url));
                endpoint
                    .set_name_resolver(Arc::new(RpcNameResolver { rpc: rpc.clone() }))
                    .await;
                Some(Arc::new(RpcBridge::new(
                    rpc,
                    rc_lookup.clone(),
                    peer_db.clone(),
                )))
            }
            None => {
                if config.use_whitelist {
                    warn!("whitelist enforcement enabled without rpc_url; only bootstrap peers will be allowed");
                }
                None
            }
        };

        let tun = TunEndpoint::new(
            endpoint.clone(),
            TunConfig {
                ifname: config.network.ifname.clone(),
                ifaddr: config.network.ifaddr.clone(),
                activity_timeout: config.network.ip_activity_timeout,
            },
        )?;

        Ok(Arc::new(Self {
            identity,
            config,
            nodedb,
            peer_db,
            rc_lookup,
            link_manager,
            endpoint,
            tun,
            rpc_bridge,
            outbound_link,
            stopping: AtomicBool::new(false),
        }))
    }

    pub fn router_id(&self) -> RouterId {
        self.identity.router_id()
    }

    /// Port of the outbound UDP socket, for host socket protection
    pub fn udp_port(&self) -> u16 {
        self.outbound_link.local_addr().port()
    }

    /// Start links and run the maintenance loop until stopped
    pub async fn mainloop(self: &Arc<Self>) -> Result<()> {
        self.link_manager
            .start()
            .await
            .context("link failed to start")?;

        let rpc_task = self
            .rpc_bridge
            .clone()
            .map(|bridge| tokio::spawn(bridge.run()));

        self.resolve_startup_names().await;

        let mut interval = tokio::time::interval(tick::INTERVAL);
        let mut ticks: u64 = 0;
        info!(router_id = %self.router_id(), "router running");

        while !self.stopping.load(Ordering::SeqCst) {
            interval.tick().await;
            let now = Timestamp::now();
            ticks += 1;

            self.link_manager.pump().await;
            self.link_manager.check_persisting_sessions(now).await;
            self.endpoint.tick(now).await;
            self.tun.tick_tun(now).await;

            // slower housekeeping every ~5 s
            if ticks % 50 == 0 {
                self.link_manager.update_peer_db(&self.peer_db).await;
                self.rc_lookup.periodic_update(now).await;
            }
            // exploration every ~60 s
            if ticks % 600 == 0 {
                self.rc_lookup.explore_network().await;
            }
        }

        if let Some(task) = rpc_task {
            task.abort();
        }
        info!("router mainloop exited");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.stopping.load(Ordering::SeqCst)
    }

    /// Resolve configured startup names so their mappings exist before the
    /// first user packet
    async fn resolve_startup_names(&self) {
        let now = Timestamp::now();
        for name in &self.config.network.startup_names {
            match self.endpoint.resolve_name(name, now).await {
                Some(addr) => {
                    if let Ok(ip) = self
                        .tun
                        .obtain_ip_for_addr(*addr.as_bytes(), false, now)
                        .await
                    {
                        self.tun.mark_ip_active_forever(ip).await;
                        info!(%name, %addr, "startup name mapped");
                    }
                }
                None => warn!(%name, "startup name did not resolve"),
            }
        }
    }

    /// Cooperative shutdown: endpoint drains first, then links close
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("router stopping");
        self.endpoint.stop().await;
        self.link_manager.stop().await;
        if let Err(e) = self.nodedb.flush_to_disk().await {
            warn!("node db flush failed: {}", e);
        }
    }
}

/// Routes inbound link messages to the endpoint once it is bound
struct FrameRouter {
    endpoint: std::sync::RwLock<Option<Arc<Endpoint>>>,
}

impl FrameRouter {
    fn new() -> Self {
        Self {
            endpoint: std::sync::RwLock::new(None),
        }
    }

    fn bind(&self, endpoint: Arc<Endpoint>) {
        *self.endpoint.write().expect("frame router lock") = Some(endpoint);
    }

    fn route(&self, remote: RouterId, data: Vec<u8>) {
        let endpoint = self
            .endpoint
            .read()
            .expect("frame router lock")
            .clone();
        let Some(endpoint) = endpoint else {
            debug!(%remote, "frame before endpoint bind, dropped");
            return;
        };
        match bincode::deserialize::<(PathId, ProtocolFrame)>(&data) {
            Ok((path_id, frame)) => {
                tokio::spawn(async move {
                    endpoint
                        .handle_inbound_frame(path_id, frame, Timestamp::now())
                        .await;
                });
            }
            Err(e) => debug!(%remote, "undecodable link message: {}", e),
        }
    }
}

/// Serves router lookups from the local store and bootstrap set
///
/// Stands at the DHT seam; a mesh-connected DHT client replaces it when the
/// embedder provides one.
struct BootstrapDht {
    nodedb: Arc<NodeDb>,
    bootstrap: Vec<RouterId>,
}

#[async_trait]
impl DhtClient for BootstrapDht {
    async fn find_router(&self, router: RouterId) -> Result<Vec<RouterContact>, DhtError> {
        match self.nodedb.get(&router, Timestamp::now()).await {
            Some(rc) => Ok(vec![rc]),
            None => Err(DhtError::NotFound),
        }
    }

    async fn find_intro(
        &self,
        _location: DhtKey,
        _relay_order: u8,
    ) -> Result<Vec<EncryptedIntroSet>, DhtError> {
        Err(DhtError::NotFound)
    }

    async fn publish_intro(
        &self,
        _introset: EncryptedIntroSet,
        _relay_order: u8,
    ) -> Result<(), DhtError> {
        Err(DhtError::NoPath)
    }

    async fn explore(&self) -> Result<Vec<RouterId>, DhtError> {
        Ok(self.bootstrap.clone())
    }
}

/// Creates outbound sessions for the link manager's persistence sweep
struct OutboundSessionMaker {
    rc_lookup: RcLookupHandler,
    outbound_link: Arc<QuicLink>,
}

#[async_trait]
impl SessionMaker for OutboundSessionMaker {
    async fn create_session_to(&self, router: RouterId) {
        let link = self.outbound_link.clone();
        self.rc_lookup
            .get_rc(
                router,
                Box::new(move |router, rc, result| {
                    let Some(rc) = rc else {
                        debug!(%router, ?result, "no RC, session not created");
                        return;
                    };
                    let Some(addr) = rc.addresses.iter().find_map(|a| a.socket_addr()) else {
                        debug!(%router, "RC has no dialable address");
                        return;
                    };
                    tokio::spawn(async move {
                        if let Err(e) = link.connect(addr, &rc).await {
                            debug!(%router, "session dial failed: {}", e);
                        }
                    });
                }),
                false,
            )
            .await;
    }
}

/// Selects hops from the node db and stands in for the build handshake
///
/// The real build (per-hop key exchange over the wire) is an external
/// service; this keeps the routing state honest about hop selection and
/// first-hop reachability.
struct SessionPathBuilder {
    nodedb: Arc<NodeDb>,
    link_manager: Arc<LinkManager>,
}

#[async_trait]
impl PathBuilder for SessionPathBuilder {
    async fn build_path(
        &self,
        target: Option<RouterId>,
        hops: usize,
        blacklist: HashSet<RouterId>,
    ) -> Result<Path, PathError> {
        let now = Timestamp::now();
        let mut candidates: Vec<RouterId> = self
            .nodedb
            .all()
            .await
            .into_iter()
            .filter(|rc| rc.public_router && !rc.is_expired(now))
            .map(|rc| rc.router_id)
            .filter(|id| !blacklist.contains(id) && Some(*id) != target)
            .collect();

        if candidates.len() < hops {
            return Err(PathError::NotEnoughHops);
        }
        candidates.shuffle(&mut rand::thread_rng());
        let mut selected: Vec<RouterId> = candidates.into_iter().take(hops).collect();
        if let Some(target) = target {
            selected.push(target);
        }

        // the first hop must actually be reachable
        if let Some(first) = selected.first() {
            if !self.link_manager.has_session_to(first).await {
                return Err(PathError::Rejected(format!(
                    "no session to first hop {}",
                    first
                )));
            }
        }

        Ok(Path {
            id: PathId::random(),
            hops: selected,
            status: PathStatus::Established,
            built_at: now,
            expires_at: now.add(veilnet_common::config::service::DEFAULT_PATH_LIFETIME),
        })
    }
}

/// Carries sealed frames over the first hop of a path
struct LinkFrameTransport {
    link_manager: Arc<LinkManager>,
}

#[async_trait]
impl FrameTransport for LinkFrameTransport {
    async fn send_frame(&self, path: &Path, intro: Introduction, frame: ProtocolFrame) -> bool {
        let Some(first_hop) = path.hops.first().copied() else {
            return false;
        };
        let Ok(buf) = bincode::serialize(&(intro.path_id, frame)) else {
            return false;
        };
        self.link_manager.send_to(first_hop, buf, None).await
    }

    async fn send_exit_frame(&self, router: RouterId, buf: Vec<u8>) -> bool {
        self.link_manager.send_to(router, buf, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_configure_builds_component_graph() {
        let dir = std::env::temp_dir().join(format!("veilnet-router-{}", std::process::id()));
        let config = RouterConfig {
            data_dir: dir.clone(),
            ..Default::default()
        };

        let router = Router::configure(config).await.unwrap();
        assert!(router.is_running());
        assert_eq!(router.endpoint.address().to_hostname().len() > 10, true);
        // no rpc_url configured, no bridge
        assert!(router.rpc_bridge.is_none());

        router.stop().await;
        assert!(!router.is_running());
        // stop is idempotent
        router.stop().await;

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn test_rpc_bridge_wired_from_config() {
        let dir = std::env::temp_dir().join(format!("veilnet-router-rpc-{}", std::process::id()));
        let config = RouterConfig {
            data_dir: dir.clone(),
            rpc_url: Some("http://127.0.0.1:22023/json_rpc".to_string()),
            ..Default::default()
        };

        let router = Router::configure(config).await.unwrap();
        assert!(router.rpc_bridge.is_some());

        router.stop().await;
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn test_path_builder_requires_known_routers() {
        let nodedb = Arc::new(NodeDb::new());
        let builder = SessionPathBuilder {
            nodedb,
            link_manager: Arc::new(LinkManager::new()),
        };

        let err = builder.build_path(None, 3, HashSet::new()).await;
        assert!(matches!(err, Err(PathError::NotEnoughHops)));
    }
}
