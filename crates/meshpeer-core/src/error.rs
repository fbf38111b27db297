//! Core negotiation errors

use thiserror::Error;

/// Core errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Orchestration could not supply a profile
    #[error("Profile fetch failed: {0}")]
    ProfileFetch(String),

    /// Discovery bus failure
    #[error("Discovery bus error: {0}")]
    Bus(String),

    /// Malformed discovery event
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Negotiation gave up waiting
    #[error("Operation timed out")]
    Timeout,

    /// Engine is not in a state that allows the operation
    #[error("Invalid engine state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(#[from] meshpeer_network::NetworkError),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Protocol(e.to_string())
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
