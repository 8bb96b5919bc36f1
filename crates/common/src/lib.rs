pub mod config;
pub mod error;
pub mod types;

pub use config::{DnsConfig, NetworkConfig, RouterConfig};
pub use error::{Result, VeilnetError};
pub use types::{Bandwidth, NetworkAddress, Timestamp, TransportKind};
