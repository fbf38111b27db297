//! Peer relay (bridging) server
//!
//! A node that offers bridging hands out forwarding sessions to connected
//! peers whose own bind techniques failed. Each session gets a dedicated
//! [`NetworkConnection`] on an ephemeral port; the session owner activates
//! it with the activation header and whoever else talks to the port first
//! becomes the counterpart.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bind::peer_bridge::activation_header;
use crate::bind::{BindRegistry, Strategies};
use crate::connection::{NetworkConnection, NetworkHandle, RelayCounters};
use crate::error::{NetworkError, NetworkResult};
use crate::liveness::{LinkEvent, LinkMonitor};
use crate::NetworkConfig;

/// One-time secret proving ownership of a forwarding session
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken([u8; 16]);

impl SessionToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> NetworkResult<Self> {
        let bytes = hex::decode(s).map_err(|e| NetworkError::Protocol(format!("bad token: {}", e)))?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| NetworkError::Protocol("token must be 16 bytes".into()))?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(..)")
    }
}

impl Serialize for SessionToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SessionToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Result of a successful forwarding setup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingSession {
    pub id: u64,
    pub token: SessionToken,
    pub relay_address: SocketAddr,
    pub public_ip: IpAddr,
    pub public_port: u16,
}

/// Peer Relay Control operations
#[async_trait]
pub trait RelayControl: Send + Sync {
    async fn can_offer_forwarding(&self) -> NetworkResult<bool>;

    /// Allocate a forwarding session for `name`. Fails when at capacity.
    async fn setup_forwarding(&self, name: &str, connection_type: &str) -> NetworkResult<ForwardingSession>;

    async fn forwarding_is_alive(&self, id: u64, token: &SessionToken) -> NetworkResult<bool>;
}

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    pub offers_bridging: bool,
    pub max_sessions: usize,
    /// Address session sockets bind to
    pub bind_ip: IpAddr,
    pub liveness_tolerance: Duration,
    pub sweep_interval: Duration,
    /// How long a new session may take to learn its public address
    pub setup_timeout: Duration,
    /// Port of the control RPC listener
    pub rpc_port: u16,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            offers_bridging: false,
            max_sessions: 8,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            liveness_tolerance: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(15),
            setup_timeout: Duration::from_secs(10),
            rpc_port: 51823,
        }
    }
}

struct Session {
    name: String,
    token: SessionToken,
    handle: NetworkHandle,
    counters: Arc<RelayCounters>,
    monitor: LinkMonitor,
    task: JoinHandle<NetworkResult<()>>,
}

/// Serves forwarding sessions for connected peers
pub struct RelayServer {
    config: RelayServerConfig,
    network: NetworkConfig,
    strategies: Strategies,
    registry: Arc<BindRegistry>,
    sessions: Mutex<HashMap<u64, Session>>,
    next_id: AtomicU64,
}

impl RelayServer {
    /// `network` is the template for session connections; its bind
    /// address is replaced with an ephemeral port on `config.bind_ip`
    pub fn new(
        config: RelayServerConfig,
        network: NetworkConfig,
        strategies: Strategies,
        registry: Arc<BindRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            network,
            strategies,
            registry,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &RelayServerConfig {
        &self.config
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Remove sessions that failed liveness; returns how many were pruned
    pub async fn sweep(&self) -> usize {
        let tolerance = self.config.liveness_tolerance;
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;

        let dead: Vec<u64> = sessions
            .iter_mut()
            .filter_map(|(id, session)| {
                let stats = session.counters.snapshot();
                match session.monitor.observe(stats.rx_bytes, stats.tx_bytes, tolerance, now) {
                    LinkEvent::Up => info!("Relay session {} for {} is up", id, session.name),
                    LinkEvent::Down => info!("Relay session {} for {} went down", id, session.name),
                    LinkEvent::Unchanged => {}
                }
                let dead = session.monitor.is_dead(tolerance, now) || session.task.is_finished();
                dead.then_some(*id)
            })
            .collect();

        for id in &dead {
            if let Some(session) = sessions.remove(id) {
                session.handle.shutdown();
                info!("Pruned relay session {} for {}", id, session.name);
            }
        }
        dead.len()
    }

    /// Periodic sweep; stops once the server is dropped
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(server) = weak.upgrade() else {
                    break;
                };
                let pruned = server.sweep().await;
                if pruned > 0 {
                    debug!("Relay sweep pruned {} sessions", pruned);
                }
            }
        })
    }

    /// Stop every session
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.lock().await;
        for (id, session) in sessions.drain() {
            session.handle.shutdown();
            debug!("Stopped relay session {}", id);
        }
    }

    async fn drop_session(&self, id: u64) {
        if let Some(session) = self.sessions.lock().await.remove(&id) {
            session.handle.shutdown();
        }
    }
}

#[async_trait]
impl RelayControl for RelayServer {
    async fn can_offer_forwarding(&self) -> NetworkResult<bool> {
        if !self.config.offers_bridging {
            return Ok(false);
        }
        Ok(self.session_count().await < self.config.max_sessions)
    }

    async fn setup_forwarding(&self, name: &str, connection_type: &str) -> NetworkResult<ForwardingSession> {
        if !self.config.offers_bridging {
            return Err(NetworkError::Relay("bridging is not offered".into()));
        }

        let (id, token, handle) = {
            let mut sessions = self.sessions.lock().await;
            if sessions.len() >= self.config.max_sessions {
                warn!(
                    "Refusing forwarding for {}: {} sessions active",
                    name,
                    sessions.len()
                );
                return Err(NetworkError::RelayCapacity {
                    max: self.config.max_sessions,
                });
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let token = SessionToken::generate();
            let counters = Arc::new(RelayCounters::default());

            let mut network = self.network.clone();
            network.bind_addr = SocketAddr::new(self.config.bind_ip, 0);
            network.technique_override = None;

            let (connection, handle) = NetworkConnection::relay(
                network,
                self.strategies.clone(),
                self.registry.clone(),
                id,
                activation_header(id, &token),
                counters.clone(),
            );
            let task = tokio::spawn(connection.run());

            sessions.insert(
                id,
                Session {
                    name: name.to_string(),
                    token,
                    handle: handle.clone(),
                    counters,
                    monitor: LinkMonitor::new(Instant::now()),
                    task,
                },
            );
            (id, token, handle)
        };

        let Some(endpoint) = handle.wait_endpoint(self.config.setup_timeout).await else {
            self.drop_session(id).await;
            return Err(NetworkError::Relay("session found no public endpoint".into()));
        };

        info!(
            "Relay session {} ({}) for {} at {}",
            id, connection_type, name, endpoint.addr
        );
        Ok(ForwardingSession {
            id,
            token,
            relay_address: endpoint.addr,
            public_ip: endpoint.addr.ip(),
            public_port: endpoint.addr.port(),
        })
    }

    async fn forwarding_is_alive(&self, id: u64, token: &SessionToken) -> NetworkResult<bool> {
        let sessions = self.sessions.lock().await;
        Ok(sessions
            .get(&id)
            .map_or(false, |s| s.token == *token && !s.task.is_finished()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::{BindTechnique, ProcessTag, StunStrategy};
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    fn server(max_sessions: usize) -> Arc<RelayServer> {
        let config = RelayServerConfig {
            offers_bridging: true,
            max_sessions,
            bind_ip: "127.0.0.1".parse().unwrap(),
            liveness_tolerance: Duration::from_millis(200),
            ..RelayServerConfig::default()
        };
        let network = NetworkConfig {
            public_ip: Some("127.0.0.1".parse().unwrap()),
            keepalive_interval: Duration::from_millis(100),
            ..NetworkConfig::default()
        };
        let strategies = Strategies::new().with(Arc::new(StunStrategy::new(
            ProcessTag::generate(),
            vec!["127.0.0.1:9".into()],
        )));
        let registry = Arc::new(BindRegistry::new());
        registry.add(BindTechnique::Stun);
        RelayServer::new(config, network, strategies, registry)
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let relay = server(2);
        relay.setup_forwarding("a", "PEERBRIDGE").await.unwrap();
        relay.setup_forwarding("b", "PEERBRIDGE").await.unwrap();

        let third = relay.setup_forwarding("c", "PEERBRIDGE").await;
        assert!(matches!(third, Err(NetworkError::RelayCapacity { max: 2 })));
        assert_eq!(relay.session_count().await, 2);
        assert!(!relay.can_offer_forwarding().await.unwrap());

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_not_offering_refuses() {
        let relay = RelayServer::new(
            RelayServerConfig::default(),
            NetworkConfig::default(),
            Strategies::new(),
            Arc::new(BindRegistry::new()),
        );
        assert!(!relay.can_offer_forwarding().await.unwrap());
        assert!(relay.setup_forwarding("a", "PEERBRIDGE").await.is_err());
    }

    #[tokio::test]
    async fn test_forwards_between_owner_and_counterpart() {
        let relay = server(1);
        let session = relay.setup_forwarding("owner", "PEERBRIDGE").await.unwrap();
        assert!(relay.forwarding_is_alive(session.id, &session.token).await.unwrap());
        assert!(!relay
            .forwarding_is_alive(session.id, &SessionToken::generate())
            .await
            .unwrap());

        let owner = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let counterpart = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 128];

        // Activation is echoed back
        let header = activation_header(session.id, &session.token);
        owner.send_to(&header, session.relay_address).await.unwrap();
        let (n, _) = timeout(Duration::from_secs(2), owner.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], &header[..]);

        counterpart.send_to(b"to-owner", session.relay_address).await.unwrap();
        let (n, _) = timeout(Duration::from_secs(2), owner.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"to-owner");

        owner.send_to(b"to-counterpart", session.relay_address).await.unwrap();
        let (n, _) = timeout(Duration::from_secs(2), counterpart.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"to-counterpart");

        assert_eq!(relay.sweep().await, 0);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_prunes_idle_sessions() {
        let relay = server(2);
        relay.setup_forwarding("idle", "PEERBRIDGE").await.unwrap();
        assert_eq!(relay.sweep().await, 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(relay.sweep().await, 1);
        assert_eq!(relay.session_count().await, 0);
    }
}
