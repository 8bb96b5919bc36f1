/// TUN handler: the boundary between the user's IP stack and the mesh
///
/// Specializes the service endpoint for IP traffic: allocates virtual IPs
/// for remote addresses, queues packets in both directions (CoDel out,
/// seqno-reordered in) and answers DNS for the names we own. The platform
/// device itself stays behind the PacketDevice seam; on mobile a pre-opened
/// fd is injected instead of opening one here.

use super::dns::{self, HookedName};
use crate::service::address::{Address, ConvoTag};
use crate::service::endpoint::{Endpoint, PacketHandler};
use crate::service::protocol::ProtocolType;
use crate::identity::RouterId;
use crate::util::CodelQueue;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use veilnet_common::Timestamp;

/// Queue depth before CoDel starts shedding
const QUEUE_OVERFLOW_DEPTH: usize = 256;

/// Packets older than this never reach the wire
const QUEUE_MAX_AGE: Duration = Duration::from_millis(500);

/// Writes packets into the user's IP stack
#[async_trait]
pub trait PacketDevice: Send + Sync {
    async fn write_packet(&self, pkt: Vec<u8>) -> bool;
}

#[derive(Debug, Clone)]
pub struct TunConfig {
    pub ifname: String,

    /// Interface range in CIDR form, e.g. "10.11.0.1/16"
    pub ifaddr: String,

    /// Idle time after which an allocated IP may be recycled
    pub activity_timeout: Duration,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            ifname: "veilnet0".to_string(),
            ifaddr: "10.11.0.1/16".to_string(),
            activity_timeout: Duration::from_secs(600),
        }
    }
}

/// An IP packet moving through the queues
#[derive(Debug, Clone)]
struct UserPacket {
    /// Arrival order, the egress order for user traffic
    order: u64,
    data: Vec<u8>,
}

/// A packet headed for the user, ordered by conversation seqno
#[derive(Debug, Clone)]
struct WritePacket {
    seqno: u64,
    data: Vec<u8>,
}

struct IpMapping {
    ip_to_addr: HashMap<u128, [u8; 32]>,
    addr_to_ip: HashMap<[u8; 32], u128>,
    ip_to_snode: HashMap<u128, bool>,
    ip_activity: HashMap<u128, Timestamp>,
    pinned: HashSet<u128>,
    next_ip: u128,
}

pub struct TunEndpoint {
    endpoint: Arc<Endpoint>,
    config: TunConfig,

    our_ip: u128,
    max_ip: u128,
    range_base: u128,
    range_mask: u128,

    mapping: RwLock<IpMapping>,
    user_to_net: Mutex<CodelQueue<UserPacket, fn(&UserPacket, &UserPacket) -> Ordering>>,
    net_to_user: Mutex<CodelQueue<WritePacket, fn(&WritePacket, &WritePacket) -> Ordering>>,
    device: RwLock<Option<Arc<dyn PacketDevice>>>,
    enqueue_counter: Mutex<u64>,
}

fn user_order(a: &UserPacket, b: &UserPacket) -> Ordering {
    a.order.cmp(&b.order)
}

fn write_order(a: &WritePacket, b: &WritePacket) -> Ordering {
    a.seqno.cmp(&b.seqno)
}

impl TunEndpoint {
    pub fn new(endpoint: Arc<Endpoint>, config: TunConfig) -> Result<Arc<Self>, TunError> {
        let (our_ip, range_base, range_mask, max_ip) = parse_range(&config.ifaddr)?;
        info!(ifname = %config.ifname, ifaddr = %config.ifaddr, "tun endpoint configured");

        Ok(Arc::new(Self {
            endpoint,
            config,
            our_ip,
            max_ip,
            range_base,
            range_mask,
            mapping: RwLock::new(IpMapping {
                ip_to_addr: HashMap::new(),
                addr_to_ip: HashMap::new(),
                ip_to_snode: HashMap::new(),
                ip_activity: HashMap::new(),
                pinned: HashSet::new(),
                next_ip: our_ip + 1,
            }),
            user_to_net: Mutex::new(CodelQueue::new(
                user_order as fn(&UserPacket, &UserPacket) -> Ordering,
                QUEUE_OVERFLOW_DEPTH,
                QUEUE_MAX_AGE,
            )),
            net_to_user: Mutex::new(CodelQueue::new(
                write_order as fn(&WritePacket, &WritePacket) -> Ordering,
                QUEUE_OVERFLOW_DEPTH,
                QUEUE_MAX_AGE,
            )),
            device: RwLock::new(None),
            enqueue_counter: Mutex::new(0),
        }))
    }

    pub fn our_ip(&self) -> u128 {
        self.our_ip
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Install the platform packet device
    ///
    /// Blocking half of setup; with an injected fd the daemon wraps it in a
    /// PacketDevice and hands it here.
    pub async fn setup_tun(self: &Arc<Self>, device: Arc<dyn PacketDevice>) {
        *self.device.write().await = Some(device);
        self.endpoint
            .set_packet_handler(self.clone() as Arc<dyn PacketHandler>)
            .await;
        info!(ifname = %self.config.ifname, "tun device installed");
    }

    pub fn in_range(&self, ip: u128) -> bool {
        ip & self.range_mask == self.range_base
    }

    /// Map `addr` to a virtual IP, allocating monotonically and recycling
    /// the least-recently-active IP once the range is exhausted
    pub async fn obtain_ip_for_addr(
        &self,
        addr: [u8; 32],
        snode: bool,
        now: Timestamp,
    ) -> Result<u128, TunError> {
        let mut mapping = self.mapping.write().await;

        if let Some(ip) = mapping.addr_to_ip.get(&addr).copied() {
            if mapping.ip_to_snode.get(&ip).copied() == Some(snode) {
                mapping.ip_activity.insert(ip, now);
                return Ok(ip);
            }
        }

        let ip = if mapping.next_ip <= self.max_ip {
            let ip = mapping.next_ip;
            mapping.next_ip += 1;
            ip
        } else {
            // range exhausted, reclaim the least recently active IP
            let victim = mapping
                .ip_activity
                .iter()
                .filter(|(ip, _)| !mapping.pinned.contains(ip))
                .min_by_key(|(_, at)| **at)
                .map(|(ip, _)| *ip)
                .ok_or(TunError::RangeExhausted)?;
            if let Some(old_addr) = mapping.ip_to_addr.remove(&victim) {
                mapping.addr_to_ip.remove(&old_addr);
            }
            mapping.ip_to_snode.remove(&victim);
            debug!(ip = %fmt_ip(victim), "recycled idle IP");
            victim
        };

        mapping.ip_to_addr.insert(ip, addr);
        mapping.addr_to_ip.insert(addr, ip);
        mapping.ip_to_snode.insert(ip, snode);
        mapping.ip_activity.insert(ip, now);
        Ok(ip)
    }

    pub async fn addr_for_ip(&self, ip: u128) -> Option<([u8; 32], bool)> {
        let mapping = self.mapping.read().await;
        let addr = mapping.ip_to_addr.get(&ip).copied()?;
        let snode = mapping.ip_to_snode.get(&ip).copied().unwrap_or(false);
        Some((addr, snode))
    }

    pub async fn ip_for_addr(&self, addr: &[u8; 32]) -> Option<u128> {
        self.mapping.read().await.addr_to_ip.get(addr).copied()
    }

    pub async fn mark_ip_active(&self, ip: u128, now: Timestamp) {
        self.mapping.write().await.ip_activity.insert(ip, now);
    }

    /// Exempt an IP from idle recycling
    pub async fn mark_ip_active_forever(&self, ip: u128) {
        self.mapping.write().await.pinned.insert(ip);
    }

    // ------------------------------------------------------------------
    // user -> mesh

    /// A packet arrived from the user's IP stack
    pub async fn handle_got_user_packet(&self, pkt: Vec<u8>, now: Timestamp) {
        let order = {
            let mut counter = self.enqueue_counter.lock().await;
            *counter += 1;
            *counter
        };
        self.user_to_net
            .lock()
            .await
            .enqueue(UserPacket { order, data: pkt }, now);
    }

    /// Drain the user queue into the endpoint's send path
    pub async fn flush_send(self: &Arc<Self>, now: Timestamp) {
        let packets: Vec<UserPacket> = {
            let mut queue = self.user_to_net.lock().await;
            let mut out = Vec::new();
            queue.drain_with(now, |pkt| out.push(pkt));
            out
        };

        for pkt in packets {
            let Some(dst) = packet_dst_v4(&pkt.data) else {
                debug!("unparseable user packet dropped");
                continue;
            };
            let dst_ip = dns::v4_to_ip(dst);
            let Some((addr, snode)) = self.addr_for_ip(dst_ip).await else {
                debug!(dst = %dst, "user packet to unmapped IP dropped");
                continue;
            };
            self.mark_ip_active(dst_ip, now).await;

            // the mesh never sees our interface-local source address
            let mut data = pkt.data;
            if let Some(our_v4) = dns::ip_to_v4(self.our_ip) {
                data[12..16].copy_from_slice(&our_v4.octets());
            }

            if snode {
                let router = RouterId::from_bytes(addr);
                self.endpoint.send_to_snode_or_queue(router, data).await;
            } else {
                self.endpoint
                    .send_to_service_or_queue(
                        Address::from_bytes(addr),
                        data,
                        ProtocolType::TrafficV4,
                        now,
                    )
                    .await;
            }
        }
    }

    // ------------------------------------------------------------------
    // mesh -> user

    /// Queue a packet for the user, reordered by conversation seqno
    pub async fn handle_write_ip_packet(&self, data: Vec<u8>, seqno: u64, now: Timestamp) {
        self.net_to_user
            .lock()
            .await
            .enqueue(WritePacket { seqno, data }, now);
    }

    /// Drain the write queue into the device in seqno order
    pub async fn flush_write(&self, now: Timestamp) -> Vec<Vec<u8>> {
        let packets: Vec<WritePacket> = {
            let mut queue = self.net_to_user.lock().await;
            let mut out = Vec::new();
            queue.drain_with(now, |pkt| out.push(pkt));
            out
        };

        let device = self.device.read().await.clone();
        let mut written = Vec::new();
        for pkt in packets {
            if let Some(device) = &device {
                if !device.write_packet(pkt.data.clone()).await {
                    warn!("device refused packet");
                    continue;
                }
            }
            written.push(pkt.data);
        }
        written
    }

    /// Per-tick maintenance: flush both queues, decay IP activity
    pub async fn tick_tun(self: &Arc<Self>, now: Timestamp) {
        self.flush_send(now).await;
        self.flush_write(now).await;

        let timeout = self.config.activity_timeout;
        let mut mapping = self.mapping.write().await;
        let idle: Vec<u128> = mapping
            .ip_activity
            .iter()
            .filter(|(ip, at)| {
                !mapping.pinned.contains(ip) && now.since(**at) > timeout
            })
            .map(|(ip, _)| *ip)
            .collect();
        for ip in idle {
            if let Some(addr) = mapping.ip_to_addr.remove(&ip) {
                mapping.addr_to_ip.remove(&addr);
            }
            mapping.ip_to_snode.remove(&ip);
            mapping.ip_activity.remove(&ip);
            debug!(ip = %fmt_ip(ip), "idle IP mapping released");
        }
    }

    // ------------------------------------------------------------------
    // DNS hook

    /// Whether this query is ours to answer
    pub fn should_hook_dns_message(&self, query: &[u8]) -> bool {
        dns::classify_query(query, |ip| self.in_range(ip)).is_some()
    }

    /// Answer a hooked query from the live mapping
    ///
    /// Unknown LNS names resolve asynchronously through the endpoint;
    /// unmappable names get NXDOMAIN.
    pub async fn handle_hooked_dns_message(
        self: &Arc<Self>,
        query: &[u8],
        now: Timestamp,
    ) -> Option<Vec<u8>> {
        let (qname, _qtype, hooked) =
            dns::classify_query(query, |ip| self.in_range(ip))?;

        match hooked {
            HookedName::Service(addr) => {
                match self.obtain_ip_for_addr(*addr.as_bytes(), false, now).await {
                    Ok(ip) => dns::build_address_reply(query, &qname, ip),
                    Err(_) => dns::build_nxdomain(query),
                }
            }
            HookedName::Snode(router) => {
                match self.obtain_ip_for_addr(*router.as_bytes(), true, now).await {
                    Ok(ip) => dns::build_address_reply(query, &qname, ip),
                    Err(_) => dns::build_nxdomain(query),
                }
            }
            HookedName::Reverse(ip) => match self.addr_for_ip(ip).await {
                Some((addr, snode)) => {
                    let hostname = if snode {
                        format!("{}.snode", RouterId::from_bytes(addr).to_hex())
                    } else {
                        Address::from_bytes(addr).to_hostname()
                    };
                    dns::build_ptr_reply(query, &qname, &hostname)
                }
                None => dns::build_nxdomain(query),
            },
            HookedName::Lns(name) => match self.endpoint.resolve_name(&name, now).await {
                Some(addr) => {
                    match self.obtain_ip_for_addr(*addr.as_bytes(), false, now).await {
                        Ok(ip) => dns::build_address_reply(query, &qname, ip),
                        Err(_) => dns::build_nxdomain(query),
                    }
                }
                None => dns::build_nxdomain(query),
            },
        }
    }
}

#[async_trait]
impl PacketHandler for TunEndpoint {
    async fn handle_inbound_packet(
        &self,
        tag: ConvoTag,
        buf: Vec<u8>,
        proto: ProtocolType,
        seqno: u64,
    ) {
        if !matches!(proto, ProtocolType::TrafficV4 | ProtocolType::TrafficV6) {
            return;
        }
        let now = Timestamp::now();

        // rewrite src to the sender's mapped IP and dst to ours so the
        // user's stack sees interface-local addresses
        let mut buf = buf;
        if buf.len() >= 20 && buf[0] >> 4 == 4 {
            if let Some(remote) = self.endpoint.session_remote(&tag).await {
                if let Ok(src_ip) = self
                    .obtain_ip_for_addr(*remote.as_bytes(), false, now)
                    .await
                {
                    if let Some(src_v4) = dns::ip_to_v4(src_ip) {
                        buf[12..16].copy_from_slice(&src_v4.octets());
                    }
                }
            }
            if let Some(our_v4) = dns::ip_to_v4(self.our_ip) {
                buf[16..20].copy_from_slice(&our_v4.octets());
            }
        }

        self.handle_write_ip_packet(buf, seqno, now).await;
    }
}

/// Parse "a.b.c.d/prefix" into (our ip, range base, mask, highest host ip)
fn parse_range(cidr: &str) -> Result<(u128, u128, u128, u128), TunError> {
    let (ip_part, prefix_part) = cidr
        .split_once('/')
        .ok_or_else(|| TunError::BadRange(cidr.to_string()))?;
    let v4: Ipv4Addr = ip_part
        .parse()
        .map_err(|_| TunError::BadRange(cidr.to_string()))?;
    let prefix: u32 = prefix_part
        .parse()
        .map_err(|_| TunError::BadRange(cidr.to_string()))?;
    if prefix > 30 {
        return Err(TunError::BadRange(cidr.to_string()));
    }

    let our_ip = dns::v4_to_ip(v4);
    let host_bits = 32 - prefix;
    let v4_value: u32 = v4.into();
    let base_v4 = v4_value & (u32::MAX << host_bits);
    let broadcast_v4 = base_v4 | (u32::MAX >> prefix);

    let range_base = dns::v4_to_ip(Ipv4Addr::from(base_v4));
    let max_ip = dns::v4_to_ip(Ipv4Addr::from(broadcast_v4 - 1));
    let range_mask = u128::MAX << host_bits;

    Ok((our_ip, range_base, range_mask, max_ip))
}

/// Destination address of an IPv4 packet
fn packet_dst_v4(data: &[u8]) -> Option<Ipv4Addr> {
    if data.len() < 20 || data[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(data[16], data[17], data[18], data[19]))
}

fn fmt_ip(ip: u128) -> String {
    match dns::ip_to_v4(ip) {
        Some(v4) => v4.to_string(),
        None => std::net::Ipv6Addr::from(ip).to_string(),
    }
}

/// Errors from TUN configuration and IP allocation
#[derive(Debug, thiserror::Error)]
pub enum TunError {
    #[error("bad interface range: {0}")]
    BadRange(String),

    #[error("interface range exhausted")]
    RangeExhausted,

    #[error("no packet device installed")]
    NoDevice,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::{DhtClient, DhtError, DhtKey};
    use crate::identity::Identity;
    use crate::path::{Path, PathBuilder, PathError};
    use crate::router::contact::RouterContact;
    use crate::service::endpoint::{EndpointConfig, FrameTransport};
    use crate::service::introset::{EncryptedIntroSet, Introduction};
    use crate::service::protocol::ProtocolFrame;

    struct NullDht;

    #[async_trait]
    impl DhtClient for NullDht {
        async fn find_router(&self, _r: RouterId) -> Result<Vec<RouterContact>, DhtError> {
            Err(DhtError::NotFound)
        }
        async fn find_intro(
            &self,
            _l: DhtKey,
            _o: u8,
        ) -> Result<Vec<EncryptedIntroSet>, DhtError> {
            Err(DhtError::NotFound)
        }
        async fn publish_intro(
            &self,
            _i: EncryptedIntroSet,
            _o: u8,
        ) -> Result<(), DhtError> {
            Ok(())
        }
        async fn explore(&self) -> Result<Vec<RouterId>, DhtError> {
            Ok(Vec::new())
        }
    }

    struct NullBuilder;

    #[async_trait]
    impl PathBuilder for NullBuilder {
        async fn build_path(
            &self,
            _t: Option<RouterId>,
            _h: usize,
            _b: HashSet<RouterId>,
        ) -> Result<Path, PathError> {
            Err(PathError::NotEnoughHops)
        }
    }

    struct NullTransport;

    #[async_trait]
    impl FrameTransport for NullTransport {
        async fn send_frame(&self, _p: &Path, _i: Introduction, _f: ProtocolFrame) -> bool {
            true
        }
        async fn send_exit_frame(&self, _r: RouterId, _b: Vec<u8>) -> bool {
            true
        }
    }

    fn make_tun() -> Arc<TunEndpoint> {
        let endpoint = Endpoint::new(
            Identity::generate(),
            EndpointConfig {
                publish_introset: false,
                ..Default::default()
            },
            Arc::new(NullDht),
            Arc::new(NullBuilder),
            Arc::new(NullTransport),
        );
        TunEndpoint::new(endpoint, TunConfig::default()).unwrap()
    }

    fn make_small_tun() -> Arc<TunEndpoint> {
        let endpoint = Endpoint::new(
            Identity::generate(),
            EndpointConfig {
                publish_introset: false,
                ..Default::default()
            },
            Arc::new(NullDht),
            Arc::new(NullBuilder),
            Arc::new(NullTransport),
        );
        TunEndpoint::new(
            endpoint,
            TunConfig {
                // /30 leaves exactly one allocatable host after our own
                ifaddr: "10.99.0.1/30".to_string(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_ip_mapping_is_a_bijection() {
        let tun = make_tun();
        let now = Timestamp::from_millis(1_000);

        let a = [1u8; 32];
        let b = [2u8; 32];
        let ip_a = tun.obtain_ip_for_addr(a, false, now).await.unwrap();
        let ip_b = tun.obtain_ip_for_addr(b, false, now).await.unwrap();
        assert_ne!(ip_a, ip_b);

        // repeated mapping returns the same IP
        assert_eq!(tun.obtain_ip_for_addr(a, false, now).await.unwrap(), ip_a);

        // inverse holds for both entries
        assert_eq!(tun.addr_for_ip(ip_a).await.unwrap().0, a);
        assert_eq!(tun.ip_for_addr(&a).await.unwrap(), ip_a);
        assert_eq!(tun.addr_for_ip(ip_b).await.unwrap().0, b);
    }

    #[tokio::test]
    async fn test_exhaustion_recycles_lru_then_errors() {
        let tun = make_small_tun();

        let first = tun
            .obtain_ip_for_addr([1u8; 32], false, Timestamp::from_millis(1_000))
            .await
            .unwrap();

        // range is full now; the next allocation recycles the only entry
        let second = tun
            .obtain_ip_for_addr([2u8; 32], false, Timestamp::from_millis(2_000))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert!(tun.ip_for_addr(&[1u8; 32]).await.is_none());

        // pinning the sole mapping leaves nothing to recycle
        tun.mark_ip_active_forever(second).await;
        let err = tun
            .obtain_ip_for_addr([3u8; 32], false, Timestamp::from_millis(3_000))
            .await;
        assert!(matches!(err, Err(TunError::RangeExhausted)));
    }

    #[tokio::test]
    async fn test_write_queue_reorders_by_seqno() {
        let tun = make_tun();
        let now = Timestamp::from_millis(1_000);

        tun.handle_write_ip_packet(b"A".to_vec(), 3, now).await;
        tun.handle_write_ip_packet(b"B".to_vec(), 1, now).await;
        tun.handle_write_ip_packet(b"C".to_vec(), 2, now).await;

        let written = tun.flush_write(now).await;
        assert_eq!(written, vec![b"B".to_vec(), b"C".to_vec(), b"A".to_vec()]);
    }

    #[tokio::test]
    async fn test_idle_ips_recycled_on_tick() {
        let tun = make_tun();
        let now = Timestamp::from_millis(1_000);

        let ip = tun.obtain_ip_for_addr([1u8; 32], false, now).await.unwrap();
        let pinned = tun.obtain_ip_for_addr([2u8; 32], false, now).await.unwrap();
        tun.mark_ip_active_forever(pinned).await;

        let idle = now.add(TunConfig::default().activity_timeout + Duration::from_secs(1));
        tun.tick_tun(idle).await;

        assert!(tun.addr_for_ip(ip).await.is_none());
        assert!(tun.addr_for_ip(pinned).await.is_some());
    }

    #[tokio::test]
    async fn test_dns_hook_answers_service_names() {
        use simple_dns::{Name, Packet, CLASS, TYPE};

        let tun = make_tun();
        let now = Timestamp::from_millis(1_000);
        let identity = Identity::generate();
        let addr = Address::from_public_key(&identity.public_key());

        let mut packet = Packet::new_query(7);
        packet.questions.push(simple_dns::Question::new(
            Name::new_unchecked(&addr.to_hostname()).into_owned(),
            TYPE::A.into(),
            CLASS::IN.into(),
            false,
        ));
        let query = packet.build_bytes_vec_compressed().unwrap();

        assert!(tun.should_hook_dns_message(&query));
        let reply = tun.handle_hooked_dns_message(&query, now).await.unwrap();
        let parsed = Packet::parse(&reply).unwrap();
        assert_eq!(parsed.answers.len(), 1);

        // the answer is the same IP the mapping now holds
        let mapped = tun.ip_for_addr(addr.as_bytes()).await.unwrap();
        match &parsed.answers[0].rdata {
            simple_dns::rdata::RData::A(a) => {
                assert_eq!(dns::v4_to_ip(Ipv4Addr::from(a.address)), mapped);
            }
            other => panic!("unexpected rdata {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unrelated_dns_not_hooked() {
        use simple_dns::{Name, Packet, CLASS, TYPE};

        let tun = make_tun();
        let mut packet = Packet::new_query(7);
        packet.questions.push(simple_dns::Question::new(
            Name::new_unchecked("example.com").into_owned(),
            TYPE::A.into(),
            CLASS::IN.into(),
            false,
        ));
        let query = packet.build_bytes_vec_compressed().unwrap();
        assert!(!tun.should_hook_dns_message(&query));
    }
}
