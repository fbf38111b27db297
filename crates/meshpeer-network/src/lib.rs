//! MeshPeer Network Layer
//!
//! Provides the NAT traversal plumbing of the mesh:
//! - Bind techniques (STUN, UPnP-IGD, NAT-PMP, peer bridge) and their registry
//! - The shared public connection that bridges traffic to the tunnel device
//! - Tunnel device configuration and counters
//! - The relay server that bridges traffic for other peers

pub mod bind;
pub mod buffer;
pub mod connection;
pub mod device;
pub mod error;
pub mod keys;
pub mod liveness;
pub mod relay;
pub mod rpc;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

pub use bind::{
    probe_techniques, BindRegistry, BindStrategy, BindTechnique, BindThroughPeer, NatPmpStrategy,
    Outbound, PeerBridgeStrategy, ProcessTag, RelayCandidates, RelayPeer, Strategies, StunStrategy,
    UpnpStrategy,
};
pub use buffer::{BufferPool, Datagram, PooledBuffer};
pub use connection::{NetworkConnection, NetworkHandle, PublicEndpoint, KEEPALIVE_PAYLOAD};
pub use device::{ConfigBatch, PeerStats, RecordingDevice, TunnelDevice};
#[cfg(unix)]
pub use device::UapiDevice;
pub use error::{NetworkError, NetworkResult};
pub use keys::{PrivateKey, PublicKey};
pub use liveness::{LinkEvent, LinkMonitor};
pub use relay::{ForwardingSession, RelayControl, RelayServer, RelayServerConfig, SessionToken};
pub use rpc::{serve_relay_control, RpcRelayClient};

/// Default tunnel device listen port
pub const DEFAULT_TUNNEL_PORT: u16 = 51820;

/// Default port of the shared public socket
pub const DEFAULT_PUBLIC_PORT: u16 = 51821;

/// Network configuration
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Local address of the shared public socket
    pub bind_addr: SocketAddr,

    /// Tunnel device listen address that bridged payload is delivered to
    pub upstream: SocketAddr,

    /// Keepalive / refresh tick
    pub keepalive_interval: Duration,

    /// Silence tolerated before a generation is considered dead
    pub liveness_tolerance: Duration,

    /// Failure reports tolerated before escalating
    pub failure_threshold: u32,

    /// Minimum generation age before failure reports can escalate
    pub escalation_min_elapsed: Duration,

    /// Port mappings are re-requested this often
    pub rebind_interval: Duration,

    /// Pause between generations
    pub restart_delay: Duration,

    /// Always use this technique instead of rotating
    pub technique_override: Option<BindTechnique>,

    /// Known public IP; skips address discovery entirely
    pub public_ip: Option<IpAddr>,

    /// MTU of the tunnel, sizes the packet buffers
    pub mtu: u16,

    /// Idle buffers kept in the pool
    pub pool_capacity: usize,

    /// STUN servers for NAT discovery
    pub stun_servers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PUBLIC_PORT)),
            upstream: SocketAddr::from(([127, 0, 0, 1], DEFAULT_TUNNEL_PORT)),
            keepalive_interval: Duration::from_secs(10),
            liveness_tolerance: Duration::from_secs(120),
            failure_threshold: 3,
            escalation_min_elapsed: Duration::from_secs(60),
            rebind_interval: Duration::from_secs(20 * 60),
            restart_delay: Duration::from_secs(1),
            technique_override: None,
            public_ip: None,
            mtu: 1420,
            pool_capacity: buffer::DEFAULT_POOL_CAPACITY,
            stun_servers: Vec::new(),
        }
    }
}

impl NetworkConfig {
    /// The standard local strategies for this configuration
    pub fn strategies(&self, tag: ProcessTag) -> Strategies {
        Strategies::new()
            .with(std::sync::Arc::new(StunStrategy::new(tag, self.stun_servers.clone())))
            .with(std::sync::Arc::new(UpnpStrategy::new(tag)))
            .with(std::sync::Arc::new(NatPmpStrategy::new(tag)))
    }
}
