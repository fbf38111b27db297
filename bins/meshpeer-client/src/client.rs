//! MeshPeer client implementation

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use meshpeer_core::{DiscoveryBus, MeshEngine, StatusReport, TcpBus};
use meshpeer_network::{
    probe_techniques, BindRegistry, BindTechnique, ProcessTag, StunStrategy, TunnelDevice,
};

use crate::config::ClientConfig;

/// Result of a local NAT probe
#[derive(Debug)]
pub struct ProbeResult {
    pub techniques: Vec<BindTechnique>,
    pub stun_address: Option<String>,
}

/// Main MeshPeer client
pub struct MeshPeerClient {
    config: ClientConfig,
    engine: Arc<MeshEngine>,
}

impl MeshPeerClient {
    /// Create a new client
    pub async fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let options = config.engine_options()?;
        info!("Public key: {}", options.private_key.public_key());

        let profiles = Arc::new(config.profiles()?);
        let broker = config.broker_addr()?;
        let bus: Arc<dyn DiscoveryBus> = Arc::new(
            TcpBus::connect(broker)
                .await
                .with_context(|| format!("Cannot reach discovery broker at {}", broker))?,
        );
        let device = Self::open_device(&config)?;

        let engine = MeshEngine::new(options, profiles, bus, device);
        Ok(Self {
            config,
            engine: Arc::new(engine),
        })
    }

    #[cfg(unix)]
    fn open_device(config: &ClientConfig) -> Result<Arc<dyn TunnelDevice>> {
        use meshpeer_network::UapiDevice;

        let device = match &config.device.uapi_socket {
            Some(path) => UapiDevice::new(path),
            None => UapiDevice::for_interface(&config.device.interface),
        };
        Ok(Arc::new(device))
    }

    #[cfg(not(unix))]
    fn open_device(_config: &ClientConfig) -> Result<Arc<dyn TunnelDevice>> {
        anyhow::bail!("Tunnel device control is only supported on Unix")
    }

    pub fn engine(&self) -> Arc<MeshEngine> {
        self.engine.clone()
    }

    /// Start negotiating with every configured peer
    pub async fn start(&self) -> Result<()> {
        info!(
            "Starting MeshPeer with {} configured peers...",
            self.config.peers.len()
        );
        self.engine.start().await?;
        info!("MeshPeer started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        info!("Stopping MeshPeer...");
        self.engine.stop().await;
        Ok(())
    }

    pub async fn status(&self) -> StatusReport {
        self.engine.status().await
    }
}

/// Probe which bind techniques work from this host
pub async fn probe(config: &ClientConfig) -> Result<ProbeResult> {
    let network = config.network_config()?;
    let tag = ProcessTag::generate();
    let strategies = network.strategies(tag);
    let registry = BindRegistry::new();
    probe_techniques(&strategies, &registry).await;

    let stun = StunStrategy::new(tag, network.stun_servers.clone());
    let stun_address = match stun.discover().await {
        Ok(addr) => Some(addr.to_string()),
        Err(e) => {
            info!("STUN discovery failed: {}", e);
            None
        }
    };

    Ok(ProbeResult {
        techniques: registry.techniques(),
        stun_address,
    })
}
