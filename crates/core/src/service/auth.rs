/// Endpoint auth policy
///
/// When a policy is installed, the first message of every inbound
/// conversation passes through it before the conversation is accepted; the
/// verdict is sent back to the initiator as an Auth protocol message.

use super::address::Address;
use super::protocol::ProtocolMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Verdict on an inbound conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthResult {
    Accepted,
    Rejected,
    PaymentRequired,
    RateLimited,
}

impl AuthResult {
    pub fn allowed(&self) -> bool {
        matches!(self, AuthResult::Accepted)
    }
}

#[async_trait]
pub trait AuthPolicy: Send + Sync {
    /// Decide whether `message` opens a conversation we accept
    async fn authenticate(&self, remote: Address, message: &ProtocolMessage) -> AuthResult;
}

/// Accepts everyone; the default when no policy is configured
pub struct AllowAllAuth;

#[async_trait]
impl AuthPolicy for AllowAllAuth {
    async fn authenticate(&self, _remote: Address, _message: &ProtocolMessage) -> AuthResult {
        AuthResult::Accepted
    }
}

/// Accepts only a fixed set of remote addresses
pub struct AddressListAuth {
    allowed: std::collections::HashSet<Address>,
}

impl AddressListAuth {
    pub fn new(allowed: impl IntoIterator<Item = Address>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

#[async_trait]
impl AuthPolicy for AddressListAuth {
    async fn authenticate(&self, remote: Address, _message: &ProtocolMessage) -> AuthResult {
        if self.allowed.contains(&remote) {
            AuthResult::Accepted
        } else {
            AuthResult::Rejected
        }
    }
}
