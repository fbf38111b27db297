//! Connection registry
//!
//! Holds at most one negotiation per peer. Each negotiation runs under its
//! own supervisor task: the attempt is spawned separately so a panic inside
//! it surfaces as a `JoinError` instead of unwinding through the registry,
//! and the supervisor resets the peer and starts over.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use meshpeer_network::{PublicKey, RelayCandidates, RelayControl, RelayPeer, RpcRelayClient};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::peer::{PeerConnection, PeerContext};
use crate::profile::PeerProfile;
use crate::status::PeerStatus;

/// How to reach a peer's relay control endpoint
pub trait RelayConnector: Send + Sync {
    fn connect(&self, peer: &PeerProfile) -> Arc<dyn RelayControl>;
}

/// Relay control over the tunnel, at the peer's tunnel IP
pub struct RpcConnector {
    port: u16,
}

impl RpcConnector {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl RelayConnector for RpcConnector {
    fn connect(&self, peer: &PeerProfile) -> Arc<dyn RelayControl> {
        Arc::new(RpcRelayClient::new(SocketAddr::new(peer.tunnel_ip, self.port)))
    }
}

struct PeerEntry {
    connection: Arc<PeerConnection>,
    supervisor: JoinHandle<()>,
}

/// Aborts the wrapped task when dropped, so aborting a supervisor also
/// stops the attempt it is waiting on
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn supervise(connection: Arc<PeerConnection>, backoff: Duration) {
    loop {
        let mut attempt = AbortOnDrop(tokio::spawn(connection.clone().run()));
        match (&mut attempt.0).await {
            Ok(Ok(())) => debug!("Attempt with {} ended", connection.name()),
            Ok(Err(e)) => {
                warn!("Negotiation with {} failed: {}", connection.name(), e);
                connection.record_error(e.to_string()).await;
            }
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic().as_ref());
                error!(
                    "Negotiation with {} panicked ({}), recovering",
                    connection.name(),
                    message
                );
                connection
                    .record_error(format!("negotiation panicked: {}", message))
                    .await;
            }
            Err(_) => return,
        }
        connection.reset().await;
        sleep(backoff).await;
    }
}

/// Active peer negotiations, keyed by peer public key
pub struct ConnectionRegistry {
    ctx: Arc<PeerContext>,
    connector: Arc<dyn RelayConnector>,
    peers: DashMap<PublicKey, PeerEntry>,
}

impl ConnectionRegistry {
    pub fn new(ctx: Arc<PeerContext>, connector: Arc<dyn RelayConnector>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            connector,
            peers: DashMap::new(),
        })
    }

    /// Start negotiating with `peer`. `false` if a negotiation for it is
    /// already running.
    pub fn add(&self, peer: PeerProfile) -> bool {
        if peer.public_key == self.ctx.profile.public_key {
            debug!("Not negotiating with ourselves");
            return false;
        }
        match self.peers.entry(peer.public_key) {
            Entry::Occupied(_) => {
                debug!("Already negotiating with {}", peer.public_key.short());
                false
            }
            Entry::Vacant(slot) => {
                info!("Adding peer {} ({})", peer.public_key.short(), peer.tunnel_ip);
                let connection = PeerConnection::new(peer, self.ctx.clone());
                let supervisor = tokio::spawn(supervise(
                    connection.clone(),
                    self.ctx.config.restart_backoff,
                ));
                slot.insert(PeerEntry {
                    connection,
                    supervisor,
                });
                true
            }
        }
    }

    /// Stop negotiating with a peer and remove it from the device
    pub async fn remove(&self, key: &PublicKey) -> bool {
        let Some((_, entry)) = self.peers.remove(key) else {
            return false;
        };
        entry.supervisor.abort();
        let _ = entry.supervisor.await;
        entry.connection.reset().await;
        info!("Removed peer {}", key.short());
        true
    }

    pub fn get(&self, key: &PublicKey) -> Option<Arc<PeerConnection>> {
        self.peers.get(key).map(|entry| entry.connection.clone())
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.peers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn keys(&self) -> Vec<PublicKey> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    /// Snapshot of the connections; never hold map guards across awaits
    fn connections(&self) -> Vec<Arc<PeerConnection>> {
        self.peers
            .iter()
            .map(|entry| entry.connection.clone())
            .collect()
    }

    pub async fn statuses(&self) -> Vec<PeerStatus> {
        let mut statuses = Vec::new();
        for connection in self.connections() {
            statuses.push(connection.status().await);
        }
        statuses.sort_by(|a, b| a.peer.cmp(&b.peer));
        statuses
    }

    pub async fn shutdown(&self) {
        for key in self.keys() {
            self.remove(&key).await;
        }
    }
}

#[async_trait]
impl RelayCandidates for ConnectionRegistry {
    async fn bridging_peers(&self) -> Vec<RelayPeer> {
        let mut peers = Vec::new();
        for connection in self.connections() {
            let state = connection.snapshot().await;
            if state.connected && state.peer_offers_bridging {
                peers.push(RelayPeer {
                    name: connection.name(),
                    control: self.connector.connect(connection.peer()),
                });
            }
        }
        debug!("{} connected peers offer bridging", peers.len());
        peers
    }
}
