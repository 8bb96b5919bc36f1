use thiserror::Error;

/// Common error types for VeilNet
#[derive(Debug, Error)]
pub enum VeilnetError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid router id: {0}")]
    InvalidRouterId(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Router not found: {0}")]
    RouterNotFound(String),

    #[error("Not allowed by policy: {0}")]
    PolicyDenied(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Component is stopping")]
    Stopping,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for VeilNet operations
pub type Result<T> = std::result::Result<T, VeilnetError>;

impl VeilnetError {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
