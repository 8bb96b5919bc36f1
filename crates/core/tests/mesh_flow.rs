/// Cross-component scenarios: a client endpoint discovering and talking to
/// a hidden service through a shared DHT, and link-manager sends over real
/// QUIC links.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use veilnet_common::{NetworkAddress, Timestamp, TransportKind};
use veilnet_core::dht::{DhtClient, DhtError, DhtKey};
use veilnet_core::identity::{Identity, RouterId};
use veilnet_core::link::quic::MessageSink;
use veilnet_core::link::{DeliveryStatus, Link, LinkManager, QuicLink};
use veilnet_core::path::{Path, PathBuilder, PathError, PathId, PathStatus};
use veilnet_core::router::contact::RouterContact;
use veilnet_core::service::endpoint::{Endpoint, EndpointConfig, FrameTransport, PacketHandler};
use veilnet_core::service::introset::{EncryptedIntroSet, Introduction};
use veilnet_core::service::protocol::{ProtocolFrame, ProtocolType};
use veilnet_core::service::{Address, ConvoTag};

/// In-memory DHT shared by every endpoint in the test mesh
struct MemDht {
    intros: Mutex<HashMap<[u8; 32], Vec<EncryptedIntroSet>>>,
}

impl MemDht {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            intros: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl DhtClient for MemDht {
    async fn find_router(&self, _router: RouterId) -> Result<Vec<RouterContact>, DhtError> {
        Err(DhtError::NotFound)
    }

    async fn find_intro(
        &self,
        location: DhtKey,
        _relay_order: u8,
    ) -> Result<Vec<EncryptedIntroSet>, DhtError> {
        self.intros
            .lock()
            .unwrap()
            .get(&location.0)
            .cloned()
            .ok_or(DhtError::NotFound)
    }

    async fn publish_intro(
        &self,
        introset: EncryptedIntroSet,
        _relay_order: u8,
    ) -> Result<(), DhtError> {
        self.intros
            .lock()
            .unwrap()
            .entry(introset.address_digest)
            .or_default()
            .push(introset);
        Ok(())
    }

    async fn explore(&self) -> Result<Vec<RouterId>, DhtError> {
        Ok(Vec::new())
    }
}

struct InstantBuilder;

#[async_trait]
impl PathBuilder for InstantBuilder {
    async fn build_path(
        &self,
        target: Option<RouterId>,
        hops: usize,
        _blacklist: HashSet<RouterId>,
    ) -> Result<Path, PathError> {
        let now = Timestamp::now();
        let mut path_hops: Vec<RouterId> = (0..hops as u8)
            .map(|i| RouterId::from_bytes([i + 50; 32]))
            .collect();
        if let Some(target) = target {
            path_hops.push(target);
        }
        Ok(Path {
            id: PathId::random(),
            hops: path_hops,
            status: PathStatus::Established,
            built_at: now,
            expires_at: now.add(Duration::from_secs(600)),
        })
    }
}

/// Delivers frames straight into the peer endpoint, standing in for the
/// full path + link pipeline
struct WireTransport {
    peer: Mutex<Option<Arc<Endpoint>>>,
}

impl WireTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            peer: Mutex::new(None),
        })
    }

    fn connect(&self, peer: Arc<Endpoint>) {
        *self.peer.lock().unwrap() = Some(peer);
    }
}

#[async_trait]
impl FrameTransport for WireTransport {
    async fn send_frame(&self, _path: &Path, intro: Introduction, frame: ProtocolFrame) -> bool {
        let peer = self.peer.lock().unwrap().clone();
        match peer {
            Some(peer) => {
                peer.handle_inbound_frame(intro.path_id, frame, Timestamp::now())
                    .await;
                true
            }
            None => false,
        }
    }

    async fn send_exit_frame(&self, _router: RouterId, _buf: Vec<u8>) -> bool {
        true
    }
}

struct Collector {
    packets: Mutex<Vec<(ConvoTag, Vec<u8>)>>,
}

#[async_trait]
impl PacketHandler for Collector {
    async fn handle_inbound_packet(
        &self,
        tag: ConvoTag,
        buf: Vec<u8>,
        _proto: ProtocolType,
        _seqno: u64,
    ) {
        self.packets.lock().unwrap().push((tag, buf));
    }
}

async fn drive(endpoint: &Arc<Endpoint>, rounds: usize) {
    for _ in 0..rounds {
        endpoint.tick(Timestamp::now()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_client_discovers_and_reaches_hidden_service() {
    let dht = MemDht::new();

    // hidden service comes up and publishes
    let service_transport = WireTransport::new();
    let service = Endpoint::new(
        Identity::generate(),
        EndpointConfig::default(),
        dht.clone(),
        Arc::new(InstantBuilder),
        service_transport.clone(),
    );
    let collector = Arc::new(Collector {
        packets: Mutex::new(Vec::new()),
    });
    service.set_packet_handler(collector.clone()).await;
    drive(&service, 5).await;
    assert!(service.publish_introset(Timestamp::now()).await);

    // client discovers it through the DHT and sends
    let client_transport = WireTransport::new();
    client_transport.connect(service.clone());
    let client = Endpoint::new(
        Identity::generate(),
        EndpointConfig::default(),
        dht.clone(),
        Arc::new(InstantBuilder),
        client_transport,
    );
    drive(&client, 5).await;

    let now = Timestamp::now();
    let queued = client
        .send_to_service_or_queue(
            service.address(),
            b"knock knock".to_vec(),
            ProtocolType::TrafficV4,
            now,
        )
        .await;
    assert!(queued);

    // lookup resolves, a context builds, queued traffic flushes through
    for _ in 0..50 {
        client.tick(Timestamp::now()).await;
        service.flush_recv_data().await;
        if !collector.packets.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let packets = collector.packets.lock().unwrap();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].1, b"knock knock".to_vec());
    drop(packets);

    // the service holds a conversation for the client now
    assert_eq!(
        service
            .get_best_convo_tag_for(&client.address())
            .await
            .is_some(),
        true
    );

    // lookup coalescing invariant held throughout
    assert!(client.num_pending_lookups_for(&service.address()).await <= 1);
    assert!(client.num_outbound_contexts_for(&service.address()).await <= 4);
}

#[tokio::test]
async fn test_link_manager_sends_over_quic() {
    let received: Arc<Mutex<Vec<(RouterId, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();
    let server_sink: MessageSink = Arc::new(move |remote, data| {
        received2.lock().unwrap().push((remote, data));
    });
    let client_sink: MessageSink = Arc::new(|_, _| {});

    let server_identity = Identity::generate();
    let server_rc = RouterContact::create(
        &server_identity,
        vec![NetworkAddress::from_socket("127.0.0.1:0".parse().unwrap())],
        vec![TransportKind::Quic],
        true,
        Timestamp::now(),
    );
    let server_link = Arc::new(
        QuicLink::new(
            "in0",
            "127.0.0.1:0".parse().unwrap(),
            server_identity,
            server_rc.clone(),
            true,
            server_sink,
        )
        .unwrap(),
    );

    let client_identity = Identity::generate();
    let client_rc = RouterContact::create(
        &client_identity,
        vec![NetworkAddress::from_socket("127.0.0.1:0".parse().unwrap())],
        vec![TransportKind::Quic],
        false,
        Timestamp::now(),
    );
    let client_link = Arc::new(
        QuicLink::new(
            "out0",
            "127.0.0.1:0".parse().unwrap(),
            client_identity,
            client_rc,
            false,
            client_sink,
        )
        .unwrap(),
    );

    let manager = LinkManager::new();
    manager.add_link(client_link.clone(), false).await;
    manager.start().await.unwrap();
    server_link.start().await.unwrap();

    // dial and then send through the manager
    client_link
        .connect(server_link.local_addr(), &server_rc)
        .await
        .unwrap();
    assert!(manager.has_session_to(&server_rc.router_id).await);

    let delivered = Arc::new(AtomicUsize::new(0));
    let delivered2 = delivered.clone();
    let sent = manager
        .send_to(
            server_rc.router_id,
            b"relay this".to_vec(),
            Some(Box::new(move |status| {
                assert_eq!(status, DeliveryStatus::Delivered);
                delivered2.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .await;
    assert!(sent);
    assert_eq!(delivered.load(Ordering::SeqCst), 1);

    for _ in 0..50 {
        if !received.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let got = received.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].1, b"relay this".to_vec());
    drop(got);

    // stop flips every later send to a drop
    manager.stop().await;
    let drops = Arc::new(AtomicUsize::new(0));
    let drops2 = drops.clone();
    let sent = manager
        .send_to(
            server_rc.router_id,
            b"too late".to_vec(),
            Some(Box::new(move |status| {
                assert_eq!(status, DeliveryStatus::Dropped);
                drops2.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .await;
    assert!(!sent);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(manager.num_connected_routers().await, 0);
}
