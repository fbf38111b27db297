//! Bind through a cooperating peer
//!
//! Last-resort technique: a connected peer that offers bridging allocates a
//! forwarding session, and its address becomes our public endpoint. The
//! session is activated (and kept open) by sending the activation header to
//! the relay address; the relay echoes it back, which is how we learn that
//! the path works.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{BindStrategy, BindTechnique, Outbound};
use crate::error::{NetworkError, NetworkResult};
use crate::relay::{ForwardingSession, RelayControl, SessionToken};

/// Message type that closes the activation header
pub const PEER_BRIDGE_MESSAGE: &[u8; 16] = b"bind-peer-bridge";

/// `id (u64 BE) | token (16 bytes) | message type (16 bytes)`
pub const ACTIVATION_LEN: usize = 8 + 16 + PEER_BRIDGE_MESSAGE.len();

/// Build the activation header for a session
pub fn activation_header(id: u64, token: &SessionToken) -> [u8; ACTIVATION_LEN] {
    let mut header = [0u8; ACTIVATION_LEN];
    header[..8].copy_from_slice(&id.to_be_bytes());
    header[8..24].copy_from_slice(token.as_bytes());
    header[24..].copy_from_slice(PEER_BRIDGE_MESSAGE);
    header
}

/// Split an activation header into session id and token
pub fn parse_activation(data: &[u8]) -> Option<(u64, SessionToken)> {
    if data.len() != ACTIVATION_LEN || &data[24..] != PEER_BRIDGE_MESSAGE {
        return None;
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&data[..8]);
    let mut token = [0u8; 16];
    token.copy_from_slice(&data[8..24]);
    Some((u64::from_be_bytes(id), SessionToken::from_bytes(token)))
}

/// Strategy backed by an established forwarding session
pub struct PeerBridgeStrategy {
    relay_name: String,
    session: ForwardingSession,
    header: [u8; ACTIVATION_LEN],
}

impl PeerBridgeStrategy {
    pub fn new(relay_name: impl Into<String>, session: ForwardingSession) -> Self {
        let header = activation_header(session.id, &session.token);
        Self {
            relay_name: relay_name.into(),
            session,
            header,
        }
    }

    pub fn session(&self) -> &ForwardingSession {
        &self.session
    }

    pub fn relay_name(&self) -> &str {
        &self.relay_name
    }
}

#[async_trait]
impl BindStrategy for PeerBridgeStrategy {
    fn technique(&self) -> BindTechnique {
        BindTechnique::PeerBridge
    }

    async fn check_net(&self) -> NetworkResult<()> {
        Ok(())
    }

    async fn bind_request(
        &self,
        _local: SocketAddr,
        tx: &mpsc::UnboundedSender<Outbound>,
    ) -> NetworkResult<()> {
        tx.send(Outbound {
            to: self.session.relay_address,
            payload: Bytes::copy_from_slice(&self.header),
        })
        .map_err(|_| NetworkError::Closed)
    }

    fn is_message(&self, data: &[u8]) -> bool {
        data == self.header
    }

    fn decode(&self, data: &[u8]) -> Option<SocketAddr> {
        self.is_message(data).then_some(self.session.relay_address)
    }
}

/// A connected peer that advertised bridging support
#[derive(Clone)]
pub struct RelayPeer {
    pub name: String,
    pub control: Arc<dyn RelayControl>,
}

/// Source of peers to ask for forwarding
#[async_trait]
pub trait RelayCandidates: Send + Sync {
    async fn bridging_peers(&self) -> Vec<RelayPeer>;
}

/// Relay fallback: ask bridging peers for a forwarding session, first
/// acceptance wins
pub struct BindThroughPeer {
    name: String,
    candidates: Arc<dyn RelayCandidates>,
}

impl BindThroughPeer {
    /// `name` identifies us to the relay
    pub fn new(name: impl Into<String>, candidates: Arc<dyn RelayCandidates>) -> Self {
        Self {
            name: name.into(),
            candidates,
        }
    }

    pub async fn establish(&self) -> NetworkResult<PeerBridgeStrategy> {
        let peers = self.candidates.bridging_peers().await;
        if peers.is_empty() {
            return Err(NetworkError::NatTraversalFailed("no connected peer offers bridging".into()));
        }

        for peer in peers {
            match peer.control.can_offer_forwarding().await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Peer {} declined to offer forwarding", peer.name);
                    continue;
                }
                Err(e) => {
                    warn!("Could not query peer {} for forwarding: {}", peer.name, e);
                    continue;
                }
            }

            match peer
                .control
                .setup_forwarding(&self.name, BindTechnique::PeerBridge.code())
                .await
            {
                Ok(session) => {
                    info!(
                        "Forwarding session {} through {} at {}",
                        session.id, peer.name, session.relay_address
                    );
                    return Ok(PeerBridgeStrategy::new(peer.name, session));
                }
                Err(e) => {
                    warn!("Peer {} refused forwarding: {}", peer.name, e);
                }
            }
        }

        Err(NetworkError::NatTraversalFailed(
            "no bridging peer accepted a forwarding session".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedCandidates(Vec<RelayPeer>);

    #[async_trait]
    impl RelayCandidates for FixedCandidates {
        async fn bridging_peers(&self) -> Vec<RelayPeer> {
            self.0.clone()
        }
    }

    struct FakeRelay {
        offers: bool,
        full: bool,
        setups: AtomicUsize,
        session: ForwardingSession,
    }

    impl FakeRelay {
        fn new(offers: bool, full: bool, port: u16) -> Arc<Self> {
            let relay_address: SocketAddr = format!("198.51.100.7:{}", port).parse().unwrap();
            Arc::new(Self {
                offers,
                full,
                setups: AtomicUsize::new(0),
                session: ForwardingSession {
                    id: 42,
                    token: SessionToken::generate(),
                    relay_address,
                    public_ip: relay_address.ip(),
                    public_port: relay_address.port(),
                },
            })
        }
    }

    #[async_trait]
    impl RelayControl for FakeRelay {
        async fn can_offer_forwarding(&self) -> NetworkResult<bool> {
            Ok(self.offers)
        }

        async fn setup_forwarding(&self, _name: &str, _kind: &str) -> NetworkResult<ForwardingSession> {
            self.setups.fetch_add(1, Ordering::SeqCst);
            if self.full {
                return Err(NetworkError::RelayCapacity { max: 0 });
            }
            Ok(self.session.clone())
        }

        async fn forwarding_is_alive(&self, _id: u64, _token: &SessionToken) -> NetworkResult<bool> {
            Ok(true)
        }
    }

    #[test]
    fn test_activation_header_layout() {
        let token = SessionToken::generate();
        let header = activation_header(0x0102030405060708, &token);
        assert_eq!(&header[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&header[8..24], token.as_bytes());
        assert_eq!(&header[24..], b"bind-peer-bridge");
        assert_eq!(parse_activation(&header), Some((0x0102030405060708, token)));
        assert_eq!(parse_activation(&header[..39]), None);
    }

    #[tokio::test]
    async fn test_skips_declining_and_full_peers() {
        let declining = FakeRelay::new(false, false, 1000);
        let full = FakeRelay::new(true, true, 1001);
        let willing = FakeRelay::new(true, false, 1002);

        let candidates = Arc::new(FixedCandidates(vec![
            RelayPeer { name: "a".into(), control: declining.clone() },
            RelayPeer { name: "b".into(), control: full.clone() },
            RelayPeer { name: "c".into(), control: willing.clone() },
        ]));

        let strategy = BindThroughPeer::new("me", candidates).establish().await.unwrap();
        assert_eq!(strategy.relay_name(), "c");
        assert_eq!(declining.setups.load(Ordering::SeqCst), 0);
        assert_eq!(full.setups.load(Ordering::SeqCst), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        strategy.bind_request("0.0.0.0:0".parse().unwrap(), &tx).await.unwrap();
        let out = rx.recv().await.unwrap();
        assert_eq!(out.to, willing.session.relay_address);
        assert!(strategy.is_message(&out.payload));
        assert_eq!(strategy.decode(&out.payload), Some(willing.session.relay_address));
    }

    #[tokio::test]
    async fn test_no_candidates_fails() {
        let candidates = Arc::new(FixedCandidates(vec![]));
        let result = BindThroughPeer::new("me", candidates).establish().await;
        assert!(matches!(result, Err(NetworkError::NatTraversalFailed(_))));
    }
}
