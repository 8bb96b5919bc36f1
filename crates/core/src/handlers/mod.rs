pub mod dns;
pub mod tun;

pub use tun::{TunConfig, TunEndpoint, TunError};
