//! Status reporting

use std::fmt;

use meshpeer_network::BindTechnique;
use serde::{Deserialize, Serialize};

use crate::negotiation::ConnectionType;

/// Per-peer connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "technique", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Initiating,
    ConnectingPrivate,
    ConnectingPublic,
    Connected(BindTechnique),
}

impl ConnectionStatus {
    /// Status while an attempt of `connection_type` is in progress
    pub fn connecting(connection_type: ConnectionType) -> Self {
        if connection_type.is_lan() {
            ConnectionStatus::ConnectingPrivate
        } else {
            ConnectionStatus::ConnectingPublic
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected(_))
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Initiating => f.write_str("initiating"),
            ConnectionStatus::ConnectingPrivate => f.write_str("connecting private"),
            ConnectionStatus::ConnectingPublic => f.write_str("connecting public"),
            ConnectionStatus::Connected(technique) => write!(f, "connected ({})", technique),
        }
    }
}

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    /// Base64 public key
    pub peer: String,
    pub status: ConnectionStatus,
    pub connection_type: Option<ConnectionType>,
    pub try_counter: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: EngineState,
    pub last_error: Option<String>,
    pub public_endpoint: Option<String>,
    pub technique: Option<BindTechnique>,
    pub peers: Vec<PeerStatus>,
}

impl StatusReport {
    pub fn connected_peers(&self) -> usize {
        self.peers.iter().filter(|p| p.status.is_connected()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_readable_states() {
        assert_eq!(ConnectionStatus::Initiating.to_string(), "initiating");
        assert_eq!(ConnectionStatus::ConnectingPrivate.to_string(), "connecting private");
        assert_eq!(ConnectionStatus::ConnectingPublic.to_string(), "connecting public");
        assert_eq!(ConnectionStatus::Connected(BindTechnique::Stun).to_string(), "connected (STUN)");
    }

    #[test]
    fn test_connecting_follows_connection_type() {
        assert_eq!(
            ConnectionStatus::connecting(ConnectionType::LanOut),
            ConnectionStatus::ConnectingPrivate
        );
        assert_eq!(
            ConnectionStatus::connecting(ConnectionType::StunPunched),
            ConnectionStatus::ConnectingPublic
        );
    }

    #[test]
    fn test_report_serializes_for_ipc() {
        let report = StatusReport {
            state: EngineState::Running,
            last_error: None,
            public_endpoint: Some("198.51.100.1:51821".into()),
            technique: Some(BindTechnique::UpnpIgd),
            peers: vec![PeerStatus {
                peer: "AAAA".into(),
                status: ConnectionStatus::Connected(BindTechnique::UpnpIgd),
                connection_type: Some(ConnectionType::WanIn),
                try_counter: 1,
                last_error: None,
            }],
        };
        let json = serde_json::to_string(&report).unwrap();
        let back: StatusReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
        assert_eq!(back.connected_peers(), 1);
    }
}
