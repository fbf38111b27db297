//! Client configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use meshpeer_core::{CoreConfig, EngineOptions, PeerProfile, Profile, StaticProfiles};
use meshpeer_network::{BindTechnique, NetworkConfig, PrivateKey, PublicKey, RelayServerConfig};

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Our identity
    pub identity: IdentityConfig,
    /// Public socket and liveness
    pub network: NetworkSection,
    /// NAT traversal
    pub nat: NatConfig,
    /// Bridging for other peers
    pub relay: RelayConfig,
    /// Tunnel device
    pub device: DeviceConfig,
    /// Discovery broker
    pub discovery: DiscoveryConfig,
    /// Static orchestration data
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Base64 private key
    pub private_key: String,
    /// Tunnel IP
    pub tunnel_ip: String,
    /// Tunnel netmask
    pub netmask: String,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Port of the shared public socket
    pub public_port: u16,
    /// MTU
    pub mtu: u16,
    /// Keepalive interval (seconds)
    pub keepalive_interval: u64,
    /// Liveness tolerance (seconds)
    pub liveness_tolerance: u64,
    /// Failure reports tolerated before escalating
    pub failure_threshold: u32,
    /// Minimum generation age before escalating (seconds)
    pub escalation_min_elapsed: u64,
}

/// NAT traversal configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NatConfig {
    /// Always use this technique (UPNPIGD, STUN, NATPMP, PEERBRIDGE)
    pub technique: Option<String>,
    /// Known public IP, skips discovery
    pub public_ip: Option<String>,
    /// STUN servers (defaults used when empty)
    #[serde(default)]
    pub stun_servers: Vec<String>,
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Offer bridging to connected peers
    pub offers_bridging: bool,
    /// Maximum concurrent forwarding sessions
    pub max_sessions: usize,
    /// Relay control port on the tunnel IP
    pub rpc_port: u16,
}

/// Tunnel device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Interface name
    pub interface: String,
    /// UAPI socket path (derived from the interface when unset)
    pub uapi_socket: Option<String>,
    /// Tunnel listen port
    pub listen_port: u16,
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Broker address
    pub broker: String,
}

/// A statically configured peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Base64 public key
    pub public_key: String,
    pub tunnel_ip: String,
    /// Route all traffic through this peer
    #[serde(default)]
    pub gateway: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig {
                private_key: String::new(),
                tunnel_ip: "10.200.0.1".to_string(),
                netmask: "255.255.0.0".to_string(),
            },
            network: NetworkSection {
                public_port: meshpeer_network::DEFAULT_PUBLIC_PORT,
                mtu: 1420,
                keepalive_interval: 10,
                liveness_tolerance: 120,
                failure_threshold: 3,
                escalation_min_elapsed: 60,
            },
            nat: NatConfig::default(),
            relay: RelayConfig {
                offers_bridging: false,
                max_sessions: 8,
                rpc_port: 51823,
            },
            device: DeviceConfig {
                interface: "meshpeer0".to_string(),
                uapi_socket: None,
                listen_port: meshpeer_network::DEFAULT_TUNNEL_PORT,
            },
            discovery: DiscoveryConfig {
                broker: format!("127.0.0.1:{}", meshpeer_core::DEFAULT_DISCOVERY_PORT),
            },
            peers: vec![],
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl ClientConfig {
    /// Load configuration from file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Load or create default configuration with a fresh key
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path).await
        } else {
            let mut config = Self::default();
            config.identity.private_key = PrivateKey::generate().to_base64();
            config.save(path).await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.private_key()?;
        self.profile()?;

        if self.network.mtu < 576 || self.network.mtu > 1500 {
            anyhow::bail!("MTU must be between 576 and 1500");
        }
        if self.relay.offers_bridging && self.relay.max_sessions == 0 {
            anyhow::bail!("max_sessions must be positive when offering bridging");
        }
        if self.network.public_port == self.device.listen_port {
            anyhow::bail!("public_port and the device listen_port must differ");
        }

        self.technique()?;
        self.public_ip()?;
        self.broker_addr()?;
        self.profiles()?;
        Ok(())
    }

    pub fn private_key(&self) -> Result<PrivateKey> {
        if self.identity.private_key.is_empty() {
            anyhow::bail!("No private key configured; run `meshpeer keygen`");
        }
        PrivateKey::from_base64(&self.identity.private_key).context("Invalid private key")
    }

    pub fn profile(&self) -> Result<Profile> {
        let tunnel_ip: Ipv4Addr = self.identity.tunnel_ip.parse().context("Invalid tunnel_ip")?;
        let netmask: Ipv4Addr = self.identity.netmask.parse().context("Invalid netmask")?;
        Ok(Profile {
            public_key: self.private_key()?.public_key(),
            tunnel_ip,
            netmask,
        })
    }

    pub fn profiles(&self) -> Result<StaticProfiles> {
        let mut profiles = StaticProfiles::new(self.profile()?);
        for peer in &self.peers {
            let public_key = PublicKey::from_base64(&peer.public_key)
                .with_context(|| format!("Invalid peer key {}", peer.public_key))?;
            let tunnel_ip: IpAddr = peer
                .tunnel_ip
                .parse()
                .with_context(|| format!("Invalid tunnel_ip for peer {}", peer.public_key))?;
            profiles = profiles.with_peer(PeerProfile {
                public_key,
                tunnel_ip,
                is_gateway: peer.gateway,
            });
        }
        Ok(profiles)
    }

    fn technique(&self) -> Result<Option<BindTechnique>> {
        self.nat
            .technique
            .as_deref()
            .map(|t| t.parse::<BindTechnique>())
            .transpose()
            .context("Invalid bind technique")
    }

    fn public_ip(&self) -> Result<Option<IpAddr>> {
        self.nat
            .public_ip
            .as_deref()
            .map(|ip| ip.parse::<IpAddr>())
            .transpose()
            .context("Invalid public_ip")
    }

    pub fn broker_addr(&self) -> Result<SocketAddr> {
        self.discovery
            .broker
            .parse()
            .context("Invalid discovery broker address")
    }

    pub fn network_config(&self) -> Result<NetworkConfig> {
        Ok(NetworkConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], self.network.public_port)),
            upstream: SocketAddr::from(([127, 0, 0, 1], self.device.listen_port)),
            keepalive_interval: Duration::from_secs(self.network.keepalive_interval),
            liveness_tolerance: Duration::from_secs(self.network.liveness_tolerance),
            failure_threshold: self.network.failure_threshold,
            escalation_min_elapsed: Duration::from_secs(self.network.escalation_min_elapsed),
            technique_override: self.technique()?,
            public_ip: self.public_ip()?,
            mtu: self.network.mtu,
            stun_servers: self.nat.stun_servers.clone(),
            ..NetworkConfig::default()
        })
    }

    pub fn engine_options(&self) -> Result<EngineOptions> {
        let mut options = EngineOptions::new(self.private_key()?);
        options.network = self.network_config()?;
        options.core = CoreConfig {
            offers_bridging: self.relay.offers_bridging,
            relay_rpc_port: self.relay.rpc_port,
            ..CoreConfig::default()
        };
        options.relay = RelayServerConfig {
            offers_bridging: self.relay.offers_bridging,
            max_sessions: self.relay.max_sessions,
            rpc_port: self.relay.rpc_port,
            ..RelayServerConfig::default()
        };
        options.listen_port = self.device.listen_port;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> ClientConfig {
        let mut config = ClientConfig::default();
        config.identity.private_key = PrivateKey::generate().to_base64();
        config
    }

    #[test]
    fn test_default_requires_key() {
        let err = ClientConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("keygen"));
        assert!(configured().validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = configured();
        config.nat.technique = Some("NATPMP".into());
        config.peers.push(PeerConfig {
            public_key: PrivateKey::generate().public_key().to_base64(),
            tunnel_ip: "10.200.0.2".into(),
            gateway: true,
        });

        let text = toml::to_string_pretty(&config).unwrap();
        let back: ClientConfig = toml::from_str(&text).unwrap();
        back.validate().unwrap();
        assert_eq!(back.network_config().unwrap().technique_override, Some(BindTechnique::NatPmp));
        assert_eq!(back.peers.len(), 1);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = configured();
        config.nat.technique = Some("CARRIER-PIGEON".into());
        assert!(config.validate().is_err());

        let mut config = configured();
        config.network.public_port = config.device.listen_port;
        assert!(config.validate().is_err());

        let mut config = configured();
        config.peers.push(PeerConfig {
            public_key: "not a key".into(),
            tunnel_ip: "10.200.0.2".into(),
            gateway: false,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_options_carry_relay_settings() {
        let mut config = configured();
        config.relay.offers_bridging = true;
        config.relay.max_sessions = 2;
        let options = config.engine_options().unwrap();
        assert!(options.core.offers_bridging);
        assert_eq!(options.relay.max_sessions, 2);
        assert_eq!(options.network.upstream.port(), 51820);
    }
}
