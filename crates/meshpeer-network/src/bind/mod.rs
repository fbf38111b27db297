//! Bind techniques
//!
//! A bind technique is one way of keeping the shared public socket
//! reachable from the outside:
//! - STUN (learn the NAT mapping from a reflector)
//! - UPnP-IGD and NAT-PMP (ask the gateway for an explicit port mapping)
//! - Peer bridge (forward through a cooperating peer, last resort)
//!
//! Every strategy tags its own control messages so the shared socket can
//! tell them apart from tunnel payload.

pub mod natpmp;
pub mod peer_bridge;
pub mod stun;
pub mod upnp;

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{NetworkError, NetworkResult};

pub use natpmp::NatPmpStrategy;
pub use peer_bridge::{BindThroughPeer, PeerBridgeStrategy, RelayCandidates, RelayPeer};
pub use stun::StunStrategy;
pub use upnp::UpnpStrategy;

/// Available NAT traversal capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindTechnique {
    #[serde(rename = "UPNPIGD")]
    UpnpIgd,
    #[serde(rename = "STUN")]
    Stun,
    #[serde(rename = "NATPMP")]
    NatPmp,
    #[serde(rename = "PEERBRIDGE")]
    PeerBridge,
}

impl BindTechnique {
    /// Fixed rotation priority; lower is tried first
    pub fn priority(&self) -> u8 {
        match self {
            BindTechnique::UpnpIgd => 1,
            BindTechnique::Stun => 2,
            BindTechnique::NatPmp => 3,
            BindTechnique::PeerBridge => 4,
        }
    }

    /// Weight used to pick the WAN listener; higher listens.
    ///
    /// Follows rotation priority for the three local techniques. A peer
    /// bridge address accepts inbound traffic unconditionally, so it ranks
    /// above all of them.
    pub fn wan_in_weight(&self) -> u8 {
        match self {
            BindTechnique::PeerBridge => 4,
            BindTechnique::UpnpIgd => 3,
            BindTechnique::Stun => 2,
            BindTechnique::NatPmp => 1,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            BindTechnique::UpnpIgd => "UPNPIGD",
            BindTechnique::Stun => "STUN",
            BindTechnique::NatPmp => "NATPMP",
            BindTechnique::PeerBridge => "PEERBRIDGE",
        }
    }
}

impl fmt::Display for BindTechnique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for BindTechnique {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UPNPIGD" | "UPNP" => Ok(BindTechnique::UpnpIgd),
            "STUN" => Ok(BindTechnique::Stun),
            "NATPMP" | "NAT-PMP" => Ok(BindTechnique::NatPmp),
            "PEERBRIDGE" => Ok(BindTechnique::PeerBridge),
            other => Err(NetworkError::ConfigError(format!("unknown bind technique '{}'", other))),
        }
    }
}

/// Random per-process identifier that prefixes every self-tagged bind message
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProcessTag([u8; 16]);

impl ProcessTag {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ProcessTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessTag({})", self.to_hex())
    }
}

/// A datagram a strategy wants sent from the shared socket
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: SocketAddr,
    pub payload: Bytes,
}

/// One NAT traversal strategy
#[async_trait]
pub trait BindStrategy: Send + Sync {
    fn technique(&self) -> BindTechnique;

    /// Probe for the capability without side effects
    async fn check_net(&self) -> NetworkResult<()>;

    /// Create or refresh the external mapping for `local` and queue a
    /// self-tagged bind message on `tx`
    async fn bind_request(
        &self,
        local: SocketAddr,
        tx: &mpsc::UnboundedSender<Outbound>,
    ) -> NetworkResult<()>;

    /// Is this datagram one of our own control messages?
    fn is_message(&self, data: &[u8]) -> bool;

    /// Extract the external address carried by a control message
    fn decode(&self, data: &[u8]) -> Option<SocketAddr>;

    /// Drop any mapping held for `local`
    async fn release(&self, _local: SocketAddr) {}
}

struct RegistryInner {
    techniques: Vec<BindTechnique>,
    cursor: usize,
    /// Last technique handed out by `next`
    last: Option<BindTechnique>,
}

/// Currently available techniques, in priority order, with a rotation cursor
pub struct BindRegistry {
    inner: Mutex<RegistryInner>,
}

impl BindRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                techniques: Vec::new(),
                cursor: 0,
                last: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        // The inner state stays consistent across a panic; keep using it.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add a technique (idempotent) and restore priority order
    pub fn add(&self, technique: BindTechnique) {
        let mut inner = self.lock();
        if inner.techniques.contains(&technique) {
            return;
        }
        inner.techniques.push(technique);
        inner.techniques.sort_by_key(|t| t.priority());

        // Rotation resumes after the last technique handed out, wherever
        // the sort moved it
        let len = inner.techniques.len();
        let cursor = inner
            .last
            .and_then(|last| inner.techniques.iter().position(|t| *t == last))
            .map_or(0, |idx| (idx + 1) % len);
        inner.cursor = cursor;
    }

    /// Technique under the cursor, advancing it. STUN when empty.
    pub fn next(&self) -> BindTechnique {
        let mut inner = self.lock();
        if inner.techniques.is_empty() {
            return BindTechnique::Stun;
        }
        let idx = inner.cursor % inner.techniques.len();
        inner.cursor = (idx + 1) % inner.techniques.len();
        inner.last = Some(inner.techniques[idx]);
        inner.techniques[idx]
    }

    /// Independent snapshot for iteration
    pub fn copy_new(&self) -> BindRegistry {
        let inner = self.lock();
        BindRegistry {
            inner: Mutex::new(RegistryInner {
                techniques: inner.techniques.clone(),
                cursor: inner.cursor,
                last: inner.last,
            }),
        }
    }

    pub fn techniques(&self) -> Vec<BindTechnique> {
        self.lock().techniques.clone()
    }

    pub fn contains(&self, technique: BindTechnique) -> bool {
        self.lock().techniques.contains(&technique)
    }

    pub fn len(&self) -> usize {
        self.lock().techniques.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BindRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Local strategies keyed by technique
#[derive(Clone, Default)]
pub struct Strategies {
    by_technique: HashMap<BindTechnique, Arc<dyn BindStrategy>>,
}

impl Strategies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, strategy: Arc<dyn BindStrategy>) -> Self {
        self.insert(strategy);
        self
    }

    pub fn insert(&mut self, strategy: Arc<dyn BindStrategy>) {
        self.by_technique.insert(strategy.technique(), strategy);
    }

    pub fn get(&self, technique: BindTechnique) -> Option<Arc<dyn BindStrategy>> {
        self.by_technique.get(&technique).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn BindStrategy>> {
        self.by_technique.values()
    }
}

/// Run every strategy's capability probe and register the ones that work.
/// STUN is registered regardless so there is always a fallback.
pub async fn probe_techniques(strategies: &Strategies, registry: &BindRegistry) {
    let probes = strategies.iter().map(|strategy| {
        let strategy = strategy.clone();
        async move {
            let technique = strategy.technique();
            (technique, strategy.check_net().await)
        }
    });

    let mut handles = Vec::new();
    for probe in probes {
        handles.push(tokio::spawn(probe));
    }

    for handle in handles {
        match handle.await {
            Ok((technique, Ok(()))) => {
                info!("Bind technique {} available", technique);
                registry.add(technique);
            }
            Ok((technique, Err(e))) => {
                info!("Bind technique {} not available: {}", technique, e);
            }
            Err(e) => {
                warn!("Capability probe task failed: {}", e);
            }
        }
    }

    registry.add(BindTechnique::Stun);
}

/// Build a self-report frame: `<tag hex>:<CODE>:<ip:port>`
pub(crate) fn self_report_frame(tag: &ProcessTag, technique: BindTechnique, addr: SocketAddr) -> Bytes {
    Bytes::from(format!("{}:{}:{}", tag.to_hex(), technique.code(), addr))
}

pub(crate) fn self_report_prefix(tag: &ProcessTag, technique: BindTechnique) -> String {
    format!("{}:{}:", tag.to_hex(), technique.code())
}

pub(crate) fn parse_self_report(prefix: &str, data: &[u8]) -> Option<SocketAddr> {
    let text = std::str::from_utf8(data).ok()?;
    text.strip_prefix(prefix)?.trim().parse().ok()
}

/// Address that reaches a socket bound to `local` from the same host
pub(crate) fn loopback_for(local: SocketAddr) -> SocketAddr {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, local.port())
}

/// Whether an address is routable on the public Internet
pub fn is_public_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                // Carrier-grade NAT 100.64.0.0/10
                || (o[0] == 100 && (o[1] & 0xc0) == 64))
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            !(v6.is_loopback()
                || v6.is_unspecified()
                || (seg[0] & 0xfe00) == 0xfc00
                || (seg[0] & 0xffc0) == 0xfe80)
        }
    }
}

/// Detect the LAN IPv4 address used for the default route
pub fn local_lan_ip() -> NetworkResult<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    match socket.local_addr()? {
        SocketAddr::V4(addr) => Ok(*addr.ip()),
        SocketAddr::V6(_) => Err(NetworkError::ConfigError("no IPv4 LAN address".into())),
    }
}
