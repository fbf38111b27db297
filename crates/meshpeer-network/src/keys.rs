//! Tunnel identity keys
//!
//! Curve25519 keys as used by the tunnel device. The textual form is
//! base64 (the usual WireGuard notation); the device configuration stream
//! wants lowercase hex.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::{NetworkError, NetworkResult};

/// Key length in bytes
pub const KEY_SIZE: usize = 32;

/// A peer's public key. Doubles as the peer identity and as the
/// tie-break value during negotiation, so ordering is by raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; KEY_SIZE]);

/// The local private key
#[derive(Clone)]
pub struct PrivateKey([u8; KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Hex form used by the device configuration stream
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> NetworkResult<Self> {
        let bytes = hex::decode(s).map_err(|e| NetworkError::InvalidKey(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> NetworkResult<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|e| NetworkError::InvalidKey(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Short form for logs (first 8 base64 chars)
    pub fn short(&self) -> String {
        self.to_base64().chars().take(8).collect()
    }

    fn from_slice(bytes: &[u8]) -> NetworkResult<Self> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            NetworkError::InvalidKey(format!("expected {} bytes, got {}", KEY_SIZE, bytes.len()))
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

impl FromStr for PublicKey {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_base64(s: &str) -> NetworkResult<Self> {
        let key = PublicKey::from_base64(s)?;
        Ok(Self(*key.as_bytes()))
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Derive the matching public key
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(*X25519Public::from(&secret).as_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}
