//! Discovery events
//!
//! Events travel in a `{"type": ..., "data": ...}` envelope shared with
//! other event kinds. The type tag is decoded first and unknown kinds are
//! skipped rather than rejected.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use meshpeer_network::{BindTechnique, PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Type tag of endpoint advertisements
pub const NETWORK_ENDPOINT: &str = "network_endpoint";

/// Endpoint advertisement exchanged by two negotiating peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEndpointEvent {
    /// Sender identity
    pub id: PublicKey,
    pub public_endpoint: String,
    pub private_endpoint: String,
    #[serde(rename = "try")]
    pub try_count: u32,
    pub bind_technique: BindTechnique,
    pub offers_bridging: bool,
    pub sent_on: DateTime<Utc>,
    /// When the sender's negotiation task was launched
    pub launched_at: DateTime<Utc>,
}

impl NetworkEndpointEvent {
    pub fn public_addr(&self) -> CoreResult<SocketAddr> {
        parse_endpoint(&self.public_endpoint)
    }

    pub fn private_addr(&self) -> CoreResult<SocketAddr> {
        parse_endpoint(&self.private_endpoint)
    }
}

fn parse_endpoint(s: &str) -> CoreResult<SocketAddr> {
    s.parse()
        .map_err(|_| CoreError::Protocol(format!("bad endpoint '{}'", s)))
}

/// Events this crate understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    NetworkEndpoint(NetworkEndpointEvent),
}

#[derive(Serialize)]
struct Envelope<'a, T> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a T,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

pub fn encode_event(event: &DiscoveryEvent) -> CoreResult<String> {
    let json = match event {
        DiscoveryEvent::NetworkEndpoint(data) => serde_json::to_string(&Envelope {
            kind: NETWORK_ENDPOINT,
            data,
        })?,
    };
    Ok(json)
}

/// Decode an envelope. `Ok(None)` for event kinds we do not handle.
pub fn parse_event(payload: &str) -> CoreResult<Option<DiscoveryEvent>> {
    let raw: RawEnvelope = serde_json::from_str(payload)?;
    match raw.kind.as_str() {
        NETWORK_ENDPOINT => Ok(Some(DiscoveryEvent::NetworkEndpoint(serde_json::from_value(
            raw.data,
        )?))),
        _ => Ok(None),
    }
}

/// Topic shared by a pair of peers, the same from either side
pub fn topic_for(a: &PublicKey, b: &PublicKey) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = blake3::Hasher::new();
    hasher.update(low.as_bytes());
    hasher.update(high.as_bytes());
    let digest = hasher.finalize();
    format!("peers/{}", &hex::encode(digest.as_bytes())[..32])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NetworkEndpointEvent {
        NetworkEndpointEvent {
            id: PublicKey::from_bytes([5u8; 32]),
            public_endpoint: "198.51.100.4:51821".into(),
            private_endpoint: "192.168.1.20:51820".into(),
            try_count: 7,
            bind_technique: BindTechnique::Stun,
            offers_bridging: true,
            sent_on: Utc::now(),
            launched_at: Utc::now(),
        }
    }

    #[test]
    fn test_envelope_round_trip() {
        let event = DiscoveryEvent::NetworkEndpoint(sample());
        let json = encode_event(&event).unwrap();
        assert_eq!(parse_event(&json).unwrap(), Some(event));
    }

    #[test]
    fn test_wire_field_names() {
        let json = encode_event(&DiscoveryEvent::NetworkEndpoint(sample())).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "network_endpoint");
        assert_eq!(value["data"]["try"], 7);
        assert_eq!(value["data"]["bind_technique"], "STUN");
        assert_eq!(value["data"]["public_endpoint"], "198.51.100.4:51821");
        assert!(value["data"]["launched_at"].is_string());
    }

    #[test]
    fn test_unknown_type_is_skipped() {
        let json = r#"{"type":"dns_update","data":{"whatever":1}}"#;
        assert_eq!(parse_event(json).unwrap(), None);
        assert!(parse_event("not json").is_err());
    }

    #[test]
    fn test_topic_is_symmetric() {
        let a = PublicKey::from_bytes([1u8; 32]);
        let b = PublicKey::from_bytes([2u8; 32]);
        let c = PublicKey::from_bytes([3u8; 32]);
        assert_eq!(topic_for(&a, &b), topic_for(&b, &a));
        assert_ne!(topic_for(&a, &b), topic_for(&a, &c));
        assert!(topic_for(&a, &b).starts_with("peers/"));
        assert_eq!(topic_for(&a, &b).len(), "peers/".len() + 32);
    }
}
