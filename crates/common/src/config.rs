use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Link-layer constants
pub mod link {
    use std::time::Duration;

    /// Maximum size of a single link message
    pub const MAX_LINK_MSG_SIZE: usize = 8192;

    /// Default lifetime of an idle link session
    pub const DEFAULT_SESSION_LIFETIME: Duration = Duration::from_secs(60);

    /// Maximum per-session send queue depth
    pub const MAX_SEND_QUEUE_SIZE: usize = 1024;
}

/// Hidden-service constants
pub mod service {
    use std::time::Duration;

    /// Lifetime of a built path before rotation
    pub const DEFAULT_PATH_LIFETIME: Duration = Duration::from_secs(600);

    /// How often we republish our introset
    pub const INTROSET_PUBLISH_INTERVAL: Duration =
        Duration::from_millis(DEFAULT_PATH_LIFETIME.as_millis() as u64 / 4);

    /// Retry delay after a failed introset publish
    pub const INTROSET_PUBLISH_RETRY_INTERVAL: Duration = Duration::from_secs(5);

    /// Cooldown between introset lookups for the same address
    pub const INTROSET_LOOKUP_RETRY_COOLDOWN: Duration = Duration::from_secs(3);

    /// Minimum interval between introduction shifts
    pub const MIN_SHIFT_INTERVAL: Duration = Duration::from_secs(5);

    /// Hard cap on outbound contexts per remote address
    pub const MAX_OUTBOUND_CONTEXT_COUNT: usize = 4;

    /// Idle timeout after which a conversation tag is evicted
    pub const CONVO_TAG_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 5);

    /// Paths required before we publish an introset
    pub const MIN_INTROS_FOR_PUBLISH: usize = 2;

    /// Replication fan-out for introset publishes
    pub const INTROSET_RELAY_REDUNDANCY: usize = 2;
}

/// Router-contact lookup constants
pub mod lookup {
    use std::time::Duration;

    /// Timeout for a single RC lookup
    pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

    /// Re-verify stored RCs not looked up within this interval
    pub const RC_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 5);

    /// Lowest RC format version we accept
    pub const MIN_RC_VERSION: u16 = 1;

    /// Highest RC format version we accept
    pub const MAX_RC_VERSION: u16 = 1;
}

/// Maintenance cadence
pub mod tick {
    use std::time::Duration;

    /// Main maintenance tick driving every component
    pub const INTERVAL: Duration = Duration::from_millis(100);

    /// RPC ping cadence
    pub const RPC_PING_INTERVAL: Duration = Duration::from_secs(30);
}

/// Router (daemon) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// UDP bind address for the link layer
    pub bind_addr: SocketAddr,

    /// Directory holding identity keys and the node database
    pub data_dir: PathBuf,

    /// Run as a public relay (service node)
    pub service_node: bool,

    /// Enforce the RPC-provided router whitelist
    pub use_whitelist: bool,

    /// Routers we always allow and prefer to dial (client mode)
    pub strict_connect: Vec<String>,

    /// Bootstrap router contacts, hex-encoded files or inline
    pub bootstrap: Vec<PathBuf>,

    /// Network (hidden-service + TUN) configuration
    pub network: NetworkConfig,

    /// Embedded DNS configuration
    pub dns: DnsConfig,

    /// Status API bind address, disabled when absent
    pub api_addr: Option<SocketAddr>,

    /// RPC bridge URL of the blockchain daemon, disabled when absent
    pub rpc_url: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".parse().expect("static addr"),
            data_dir: PathBuf::from("."),
            service_node: false,
            use_whitelist: false,
            strict_connect: Vec::new(),
            bootstrap: Vec::new(),
            network: NetworkConfig::default(),
            dns: DnsConfig::default(),
            api_addr: None,
            rpc_url: None,
        }
    }
}

/// Hidden-service endpoint + TUN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Interface name for the TUN device
    pub ifname: String,

    /// IPv4 range owned by the interface, CIDR form
    pub ifaddr: String,

    /// Enable IPv6 on the interface
    pub enable_ipv6: bool,

    /// Number of paths the endpoint keeps built
    pub hops: usize,

    /// Idle time after which an allocated IP may be recycled
    pub ip_activity_timeout: Duration,

    /// Startup name mappings: LNS name -> optional pinned range
    pub startup_names: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ifname: "veilnet0".to_string(),
            ifaddr: "10.11.0.1/16".to_string(),
            enable_ipv6: true,
            hops: 4,
            ip_activity_timeout: Duration::from_secs(60 * 10),
            startup_names: Vec::new(),
        }
    }
}

/// Embedded DNS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Address the resolver listens on
    pub bind_addr: SocketAddr,

    /// Upstream resolvers for queries we do not hook
    pub upstream: Vec<SocketAddr>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::new(127, 3, 2, 1), 53)),
            upstream: vec!["9.9.9.9:53".parse().expect("static addr")],
        }
    }
}
