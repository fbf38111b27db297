//! Mesh Engine - integration layer
//!
//! Wires the profile source, the shared public connection, the relay
//! server and the per-peer negotiations into one running node.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use meshpeer_network::bind::local_lan_ip;
use meshpeer_network::{
    probe_techniques, serve_relay_control, BindRegistry, BindTechnique, ConfigBatch, NetworkConfig,
    NetworkConnection, NetworkHandle, NetworkResult, PrivateKey, ProcessTag, PublicKey, RelayControl,
    RelayServer, RelayServerConfig, Strategies, TunnelDevice, DEFAULT_TUNNEL_PORT,
};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::bus::DiscoveryBus;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::peer::PeerContext;
use crate::profile::{Profile, ProfileSource};
use crate::registry::{ConnectionRegistry, RelayConnector, RpcConnector};
use crate::status::{EngineState, StatusReport};

/// How long `stop` waits for port mappings to be released
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the engine needs besides its collaborators
#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub core: CoreConfig,
    pub network: NetworkConfig,
    pub relay: RelayServerConfig,
    pub private_key: PrivateKey,
    /// Tunnel device listen port
    pub listen_port: u16,
    /// LAN address advertised to peers; detected when unset
    pub private_ip: Option<IpAddr>,
    /// Relay control listen address; our tunnel IP when unset
    pub relay_rpc_addr: Option<SocketAddr>,
}

impl EngineOptions {
    pub fn new(private_key: PrivateKey) -> Self {
        Self {
            core: CoreConfig::default(),
            network: NetworkConfig::default(),
            relay: RelayServerConfig::default(),
            private_key,
            listen_port: DEFAULT_TUNNEL_PORT,
            private_ip: None,
            relay_rpc_addr: None,
        }
    }
}

struct RelayRuntime {
    server: Arc<RelayServer>,
    maintenance: JoinHandle<()>,
    rpc: Option<JoinHandle<()>>,
}

struct Running {
    profile: Profile,
    network: NetworkHandle,
    network_task: JoinHandle<NetworkResult<()>>,
    peers: Arc<ConnectionRegistry>,
    relay: Option<RelayRuntime>,
}

/// A running mesh node
pub struct MeshEngine {
    options: EngineOptions,
    profiles: Arc<dyn ProfileSource>,
    bus: Arc<dyn DiscoveryBus>,
    device: Arc<dyn TunnelDevice>,
    strategies: Option<Strategies>,
    connector: Arc<dyn RelayConnector>,
    state: RwLock<EngineState>,
    last_error: RwLock<Option<String>>,
    running: Mutex<Option<Running>>,
}

impl MeshEngine {
    pub fn new(
        options: EngineOptions,
        profiles: Arc<dyn ProfileSource>,
        bus: Arc<dyn DiscoveryBus>,
        device: Arc<dyn TunnelDevice>,
    ) -> Self {
        let connector = Arc::new(RpcConnector::new(options.core.relay_rpc_port));
        Self {
            options,
            profiles,
            bus,
            device,
            strategies: None,
            connector,
            state: RwLock::new(EngineState::Stopped),
            last_error: RwLock::new(None),
            running: Mutex::new(None),
        }
    }

    /// Use these bind strategies instead of the standard local ones
    pub fn with_strategies(mut self, strategies: Strategies) -> Self {
        self.strategies = Some(strategies);
        self
    }

    pub fn with_relay_connector(mut self, connector: Arc<dyn RelayConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    /// Start the engine
    pub async fn start(&self) -> CoreResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(CoreError::InvalidState("engine already running".into()));
        }
        self.options.core.validate().map_err(CoreError::Config)?;

        info!("Starting mesh engine...");
        *self.state.write().await = EngineState::Starting;

        match self.launch().await {
            Ok(launched) => {
                *running = Some(launched);
                *self.state.write().await = EngineState::Running;
                *self.last_error.write().await = None;
                info!("Mesh engine running");
                Ok(())
            }
            Err(e) => {
                error!("Mesh engine failed to start: {}", e);
                *self.state.write().await = EngineState::Error;
                *self.last_error.write().await = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn launch(&self) -> CoreResult<Running> {
        let opts = &self.options;

        // Orchestration first: nothing else is worth starting without it
        let profile = self.profiles.self_profile().await?;
        let peer_ids = self.profiles.peer_ids().await?;
        info!(
            "Identity {} at {}/{}",
            profile.public_key.short(),
            profile.tunnel_ip,
            profile.netmask
        );
        if opts.private_key.public_key() != profile.public_key {
            warn!("Private key does not match the profile's public key");
        }

        self.device
            .apply(
                &ConfigBatch::new()
                    .private_key(&opts.private_key)
                    .listen_port(opts.listen_port),
            )
            .await?;

        let strategies = self
            .strategies
            .clone()
            .unwrap_or_else(|| opts.network.strategies(ProcessTag::generate()));
        let registry = Arc::new(BindRegistry::new());
        if opts.network.public_ip.is_some() {
            info!("Public IP configured, skipping technique probes");
            registry.add(BindTechnique::Stun);
        } else {
            probe_techniques(&strategies, &registry).await;
        }
        info!("Bind techniques: {:?}", registry.techniques());

        let (mut connection, network) =
            NetworkConnection::new(opts.network.clone(), strategies.clone(), registry.clone());

        let private_ip = opts.private_ip.unwrap_or_else(|| match local_lan_ip() {
            Ok(ip) => IpAddr::V4(ip),
            Err(e) => {
                warn!("Could not detect LAN address ({}), advertising loopback", e);
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }
        });
        let ctx = Arc::new(PeerContext {
            config: opts.core.clone(),
            profile: profile.clone(),
            bus: self.bus.clone(),
            device: self.device.clone(),
            network: network.clone(),
            private_endpoint: SocketAddr::new(private_ip, opts.listen_port),
        });
        let peers = ConnectionRegistry::new(ctx, self.connector.clone());
        connection.set_relay_candidates(profile.public_key.short(), peers.clone());
        let network_task = tokio::spawn(connection.run());

        let relay = if opts.core.offers_bridging {
            Some(self.start_relay(&profile, strategies, registry).await)
        } else {
            None
        };

        for id in peer_ids {
            self.add_to(&peers, &id).await;
        }

        Ok(Running {
            profile,
            network,
            network_task,
            peers,
            relay,
        })
    }

    async fn start_relay(
        &self,
        profile: &Profile,
        strategies: Strategies,
        registry: Arc<BindRegistry>,
    ) -> RelayRuntime {
        let mut config = self.options.relay.clone();
        config.offers_bridging = true;
        let server = RelayServer::new(config, self.options.network.clone(), strategies, registry);
        let maintenance = server.spawn_maintenance();

        let addr = self.options.relay_rpc_addr.unwrap_or_else(|| {
            SocketAddr::new(IpAddr::V4(profile.tunnel_ip), self.options.core.relay_rpc_port)
        });
        let control: Arc<dyn RelayControl> = server.clone();
        let rpc = match serve_relay_control(addr, control).await {
            Ok((_, task)) => Some(task),
            Err(e) => {
                warn!("Relay control unavailable on {}: {}", addr, e);
                None
            }
        };
        info!(
            "Offering bridging for up to {} sessions",
            server.config().max_sessions
        );
        RelayRuntime {
            server,
            maintenance,
            rpc,
        }
    }

    /// Fetch a peer's profile and start negotiating. Fetch failures skip
    /// the peer until it is discovered again.
    async fn add_to(&self, peers: &ConnectionRegistry, id: &PublicKey) -> bool {
        match self.profiles.peer_profile(id).await {
            Ok(profile) => peers.add(profile),
            Err(e) => {
                warn!("Skipping peer {}: {}", id.short(), e);
                false
            }
        }
    }

    /// A peer was discovered
    pub async fn add_peer(&self, id: &PublicKey) -> CoreResult<bool> {
        let peers = self.peers().await?;
        Ok(self.add_to(&peers, id).await)
    }

    pub async fn remove_peer(&self, id: &PublicKey) -> CoreResult<bool> {
        let peers = self.peers().await?;
        Ok(peers.remove(id).await)
    }

    async fn peers(&self) -> CoreResult<Arc<ConnectionRegistry>> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.peers.clone())
            .ok_or_else(|| CoreError::InvalidState("engine not running".into()))
    }

    pub async fn registry(&self) -> Option<Arc<ConnectionRegistry>> {
        self.peers().await.ok()
    }

    pub async fn network(&self) -> Option<NetworkHandle> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.network.clone())
    }

    pub async fn relay_server(&self) -> Option<Arc<RelayServer>> {
        self.running
            .lock()
            .await
            .as_ref()
            .and_then(|running| running.relay.as_ref().map(|relay| relay.server.clone()))
    }

    pub async fn profile(&self) -> Option<Profile> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.profile.clone())
    }

    /// Stop the engine, releasing port mappings
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            debug!("Mesh engine not running");
            return;
        };
        info!("Stopping mesh engine...");
        *self.state.write().await = EngineState::Stopping;

        running.peers.shutdown().await;

        if let Some(relay) = running.relay {
            relay.server.shutdown().await;
            relay.maintenance.abort();
            if let Some(rpc) = relay.rpc {
                rpc.abort();
            }
        }

        running.network.shutdown();
        match timeout(RELEASE_TIMEOUT, running.network_task).await {
            Ok(Ok(Ok(()))) => debug!("Public connection closed"),
            Ok(Ok(Err(e))) => warn!("Public connection ended with error: {}", e),
            Ok(Err(e)) => warn!("Public connection task failed: {}", e),
            Err(_) => warn!("Timed out releasing port mappings"),
        }

        *self.state.write().await = EngineState::Stopped;
        info!("Mesh engine stopped");
    }

    pub async fn status(&self) -> StatusReport {
        let state = *self.state.read().await;
        let last_error = self.last_error.read().await.clone();
        let running = self.running.lock().await;

        let (endpoint, peers) = match running.as_ref() {
            Some(running) => (running.network.endpoint(), running.peers.statuses().await),
            None => (None, Vec::new()),
        };

        StatusReport {
            state,
            last_error,
            public_endpoint: endpoint.map(|ep| ep.addr.to_string()),
            technique: endpoint.map(|ep| ep.technique),
            peers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::profile::{PeerProfile, StaticProfiles};
    use meshpeer_network::{RecordingDevice, StunStrategy};

    fn options(key: &PrivateKey) -> EngineOptions {
        let mut options = EngineOptions::new(key.clone());
        options.network.bind_addr = "127.0.0.1:0".parse().unwrap();
        options.network.public_ip = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        options.private_ip = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        options
    }

    fn strategies() -> Strategies {
        Strategies::new().with(Arc::new(StunStrategy::new(ProcessTag::generate(), vec![])))
    }

    #[tokio::test]
    async fn test_missing_self_profile_is_persistent_error() {
        let key = PrivateKey::generate();
        let engine = MeshEngine::new(
            options(&key),
            Arc::new(StaticProfiles::unconfigured()),
            MemoryBus::new(),
            Arc::new(RecordingDevice::new()),
        )
        .with_strategies(strategies());

        assert!(matches!(engine.start().await, Err(CoreError::ProfileFetch(_))));
        let status = engine.status().await;
        assert_eq!(status.state, EngineState::Error);
        assert!(status.last_error.unwrap().contains("no self profile"));
        assert!(engine.add_peer(&PublicKey::from_bytes([1u8; 32])).await.is_err());
    }

    #[tokio::test]
    async fn test_start_configures_device_and_peers() {
        let key = PrivateKey::generate();
        let peer_key = PublicKey::from_bytes([7u8; 32]);
        let unresolvable = PublicKey::from_bytes([8u8; 32]);
        let profiles = StaticProfiles::new(Profile {
            public_key: key.public_key(),
            tunnel_ip: Ipv4Addr::new(10, 200, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 0, 0),
        })
        .with_peer(PeerProfile {
            public_key: peer_key,
            tunnel_ip: "10.200.0.7".parse().unwrap(),
            is_gateway: false,
        })
        .with_unresolvable(unresolvable);

        let device = Arc::new(RecordingDevice::new());
        let engine = MeshEngine::new(options(&key), Arc::new(profiles), MemoryBus::new(), device.clone())
            .with_strategies(strategies());
        engine.start().await.unwrap();
        assert!(matches!(engine.start().await, Err(CoreError::InvalidState(_))));

        let first = &device.batches()[0];
        assert_eq!(first.get("private_key"), Some(key.to_hex().as_str()));
        assert_eq!(first.get("listen_port"), Some("51820"));

        let registry = engine.registry().await.unwrap();
        assert!(registry.contains(&peer_key));
        assert!(!registry.contains(&unresolvable));
        assert!(!engine.add_peer(&peer_key).await.unwrap());

        let status = engine.status().await;
        assert_eq!(status.state, EngineState::Running);
        assert_eq!(status.peers.len(), 1);

        engine.stop().await;
        assert_eq!(engine.state().await, EngineState::Stopped);
        let last = device.batches_for(&peer_key).pop().unwrap();
        assert_eq!(last.get("remove"), Some("true"));
    }
}
