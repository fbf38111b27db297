//! MeshPeer Core
//!
//! Negotiates direct tunnel links between pairs of mesh peers:
//! - Endpoint advertisements over a discovery bus
//! - Coordinator-free role selection and try-counter agreement
//! - Per-peer state machines driven by tunnel device counters
//! - Crash-isolated supervision of every peer negotiation

pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod negotiation;
pub mod peer;
pub mod profile;
pub mod registry;
pub mod status;

pub use bus::{BrokerFrame, DiscoveryBus, MemoryBus, TcpBus};
pub use config::CoreConfig;
pub use engine::{EngineOptions, MeshEngine};
pub use error::{CoreError, CoreResult};
pub use event::{encode_event, parse_event, topic_for, DiscoveryEvent, NetworkEndpointEvent, NETWORK_ENDPOINT};
pub use negotiation::{adopt_try, find_connection_type, is_best_wan_in, ConnectionType};
pub use peer::{PeerConnection, PeerContext, PeerState};
pub use profile::{PeerProfile, Profile, ProfileSource, StaticProfiles};
pub use registry::{ConnectionRegistry, RelayConnector, RpcConnector};
pub use status::{ConnectionStatus, EngineState, PeerStatus, StatusReport};

/// Default discovery broker port
pub const DEFAULT_DISCOVERY_PORT: u16 = 51822;
