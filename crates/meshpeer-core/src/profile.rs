//! Identities supplied by orchestration

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use meshpeer_network::PublicKey;

use crate::error::{CoreError, CoreResult};

/// Our own identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub public_key: PublicKey,
    pub tunnel_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

/// A peer's identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerProfile {
    pub public_key: PublicKey,
    pub tunnel_ip: IpAddr,
    /// Route all traffic through this peer
    pub is_gateway: bool,
}

impl PeerProfile {
    /// Allowed IPs pushed to the tunnel device for this peer
    pub fn allowed_ip(&self) -> (IpAddr, u8) {
        match (self.is_gateway, self.tunnel_ip) {
            (true, IpAddr::V4(_)) => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            (true, IpAddr::V6(_)) => (IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
            (false, ip @ IpAddr::V4(_)) => (ip, 32),
            (false, ip @ IpAddr::V6(_)) => (ip, 128),
        }
    }
}

/// Orchestration collaborator
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn self_profile(&self) -> CoreResult<Profile>;

    async fn peer_ids(&self) -> CoreResult<Vec<PublicKey>>;

    async fn peer_profile(&self, id: &PublicKey) -> CoreResult<PeerProfile>;
}

/// Profiles fixed at startup, usually from the config file
#[derive(Debug, Clone, Default)]
pub struct StaticProfiles {
    own: Option<Profile>,
    peers: HashMap<PublicKey, PeerProfile>,
    order: Vec<PublicKey>,
}

impl StaticProfiles {
    pub fn new(own: Profile) -> Self {
        Self {
            own: Some(own),
            ..Self::default()
        }
    }

    /// Source without a self profile; every start fails
    pub fn unconfigured() -> Self {
        Self::default()
    }

    pub fn with_peer(mut self, peer: PeerProfile) -> Self {
        if self.peers.insert(peer.public_key, peer.clone()).is_none() {
            self.order.push(peer.public_key);
        }
        self
    }

    /// List a peer id without a fetchable profile
    pub fn with_unresolvable(mut self, id: PublicKey) -> Self {
        self.order.push(id);
        self
    }
}

#[async_trait]
impl ProfileSource for StaticProfiles {
    async fn self_profile(&self) -> CoreResult<Profile> {
        self.own
            .clone()
            .ok_or_else(|| CoreError::ProfileFetch("no self profile configured".into()))
    }

    async fn peer_ids(&self) -> CoreResult<Vec<PublicKey>> {
        Ok(self.order.clone())
    }

    async fn peer_profile(&self, id: &PublicKey) -> CoreResult<PeerProfile> {
        self.peers
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::ProfileFetch(format!("no profile for peer {}", id.short())))
    }
}
