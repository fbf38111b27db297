//! Network error types

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// NAT traversal failed
    #[error("NAT traversal failed: {0}")]
    NatTraversalFailed(String),

    /// Capability probe failed for a bind technique
    #[error("{technique} unavailable: {reason}")]
    TechniqueUnavailable { technique: String, reason: String },

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection timeout
    #[error("Connection timeout: {0}")]
    TimeoutWithMessage(String),

    /// General timeout (without message)
    #[error("Operation timed out")]
    Timeout,

    /// Bind error
    #[error("Bind error: {0}")]
    BindError(String),

    /// Tunnel device rejected or failed a request
    #[error("Tunnel device error: {0}")]
    Device(String),

    /// Invalid key material
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Relay session table is full
    #[error("Relay at capacity ({max} sessions)")]
    RelayCapacity { max: usize },

    /// Relay refused or does not know the session
    #[error("Relay error: {0}")]
    Relay(String),

    /// Relay control RPC failed
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The network connection task is gone
    #[error("Network connection closed")]
    Closed,
}

impl From<serde_json::Error> for NetworkError {
    fn from(e: serde_json::Error) -> Self {
        NetworkError::SerializationError(e.to_string())
    }
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
