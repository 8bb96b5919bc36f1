/// Link session contract
///
/// A LinkSession is one live transport connection to a remote router. The
/// concrete transport lives behind this trait so the link manager can treat
/// QUIC sessions and anything else uniformly.

use crate::identity::RouterId;
use crate::router::contact::RouterContact;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Lifecycle of a link session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Established,
    Closing,
    Closed,
}

/// Who initiated the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDirection {
    Inbound,
    Outbound,
}

/// Outcome reported to a send completion handler, exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    Dropped,
}

pub type CompletionHandler = Box<dyn FnOnce(DeliveryStatus) + Send>;

/// Per-session traffic counters
///
/// Rates are per-second gauges, totals are monotone counters the peer-db
/// diffing relies on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub rx_rate: u64,
    pub tx_rate: u64,
    pub rx_packets: u64,
    pub acked_tx: u64,
    pub dropped_tx: u64,
    pub in_flight_tx: u64,
}

#[async_trait]
pub trait LinkSession: Send + Sync {
    fn remote_id(&self) -> RouterId;

    /// RC snapshot taken at handshake time
    fn remote_rc(&self) -> RouterContact;

    fn direction(&self) -> SessionDirection;

    fn state(&self) -> SessionState;

    fn is_established(&self) -> bool {
        self.state() == SessionState::Established
    }

    /// Whether the remote declared itself a relay during the handshake
    fn is_relay(&self) -> bool;

    fn stats(&self) -> SessionStats;

    /// Queue a message; the completion fires exactly once when provided
    ///
    /// Returns false (and reports Dropped) when the session cannot accept
    /// the message.
    async fn send(&self, buf: Vec<u8>, completed: Option<CompletionHandler>) -> bool;

    async fn send_keepalive(&self) -> bool;

    async fn close(&self);
}
