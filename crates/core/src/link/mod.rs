pub mod manager;
pub mod quic;
pub mod session;

pub use manager::{LinkManager, SessionMaker};
pub use quic::QuicLink;
pub use session::{
    CompletionHandler, DeliveryStatus, LinkSession, SessionDirection, SessionState, SessionStats,
};

use crate::identity::RouterId;
use crate::router::contact::RouterContact;
use async_trait::async_trait;
use std::sync::Arc;
use veilnet_common::TransportKind;

/// A transport listener/dialer producing link sessions
#[async_trait]
pub trait Link: Send + Sync {
    fn name(&self) -> &str;

    fn transport(&self) -> TransportKind;

    /// Whether we could dial the router this RC describes
    fn is_compatible(&self, rc: &RouterContact) -> bool;

    async fn start(&self) -> Result<(), LinkError>;

    async fn stop(&self);

    /// Drive I/O readiness: flush queued sends, reap dead sessions
    async fn pump(&self);

    /// The session to `remote`, if any
    async fn session_to(&self, remote: &RouterId) -> Option<Arc<dyn LinkSession>>;

    /// Snapshot of every session on this link
    async fn sessions(&self) -> Vec<Arc<dyn LinkSession>>;

    async fn close_session_to(&self, remote: &RouterId);

    async fn num_pending(&self) -> usize;
}

/// Errors from link lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("failed to start link {name}: {reason}")]
    StartFailed { name: String, reason: String },

    #[error("link is stopped")]
    Stopped,

    #[error("handshake with {0} failed: {1}")]
    HandshakeFailed(RouterId, String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
