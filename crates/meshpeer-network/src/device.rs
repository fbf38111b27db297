//! Tunnel device configuration
//!
//! The tunnel device is configured through a line-oriented `key=value`
//! stream (the WireGuard cross-platform UAPI). Each [`ConfigBatch`] is a
//! minimal self-contained write, so batches from different peers may be
//! interleaved freely.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{NetworkError, NetworkResult};
use crate::keys::{PrivateKey, PublicKey};

/// Cumulative per-peer byte counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// One configuration write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigBatch {
    lines: Vec<(&'static str, String)>,
}

impl ConfigBatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, key: &'static str, value: impl ToString) -> Self {
        self.lines.push((key, value.to_string()));
        self
    }

    pub fn private_key(self, key: &PrivateKey) -> Self {
        self.push("private_key", key.to_hex())
    }

    pub fn listen_port(self, port: u16) -> Self {
        self.push("listen_port", port)
    }

    pub fn public_key(self, key: &PublicKey) -> Self {
        self.push("public_key", key.to_hex())
    }

    pub fn endpoint(self, addr: SocketAddr) -> Self {
        self.push("endpoint", addr)
    }

    pub fn replace_allowed_ips(self) -> Self {
        self.push("replace_allowed_ips", "true")
    }

    pub fn allowed_ip(self, ip: IpAddr, prefix: u8) -> Self {
        self.push("allowed_ip", format!("{}/{}", ip, prefix))
    }

    pub fn persistent_keepalive(self, secs: u16) -> Self {
        self.push("persistent_keepalive_interval", secs)
    }

    pub fn remove(self) -> Self {
        self.push("remove", "true")
    }

    /// First value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl fmt::Display for ConfigBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.lines {
            writeln!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

/// The tunnel device collaborator
#[async_trait]
pub trait TunnelDevice: Send + Sync {
    /// Apply one configuration batch
    async fn apply(&self, batch: &ConfigBatch) -> NetworkResult<()>;

    /// Current counters for a peer, if the device knows it
    async fn peer_stats(&self, peer: &PublicKey) -> NetworkResult<Option<PeerStats>>;
}

/// Parse the `errno=` trailer of a set reply
fn parse_errno(reply: &str) -> NetworkResult<()> {
    let errno = reply
        .lines()
        .find_map(|line| line.strip_prefix("errno="))
        .ok_or_else(|| NetworkError::Device("reply without errno".into()))?;
    match errno.trim() {
        "0" => Ok(()),
        code => Err(NetworkError::Device(format!("device returned errno={}", code))),
    }
}

/// Extract every peer's counters from a get reply
fn parse_peer_stats(reply: &str) -> HashMap<PublicKey, PeerStats> {
    let mut peers = HashMap::new();
    let mut current: Option<PublicKey> = None;

    for line in reply.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "public_key" => {
                current = PublicKey::from_hex(value).ok();
                if let Some(peer) = current {
                    peers.insert(peer, PeerStats::default());
                }
            }
            "rx_bytes" | "tx_bytes" => {
                let (Some(peer), Ok(n)) = (current, value.parse::<u64>()) else {
                    continue;
                };
                if let Some(stats) = peers.get_mut(&peer) {
                    if key == "rx_bytes" {
                        stats.rx_bytes = n;
                    } else {
                        stats.tx_bytes = n;
                    }
                }
            }
            _ => {}
        }
    }
    peers
}

#[cfg(unix)]
pub use uapi::UapiDevice;

#[cfg(unix)]
mod uapi {
    use std::path::{Path, PathBuf};

    use async_trait::async_trait;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;
    use tracing::trace;

    use super::{parse_errno, parse_peer_stats, ConfigBatch, PeerStats, TunnelDevice};
    use crate::error::{NetworkError, NetworkResult};
    use crate::keys::PublicKey;

    /// Device reached through its UAPI Unix socket
    pub struct UapiDevice {
        path: PathBuf,
    }

    impl UapiDevice {
        pub fn new(path: impl AsRef<Path>) -> Self {
            Self {
                path: path.as_ref().to_path_buf(),
            }
        }

        /// Standard socket location for an interface name
        pub fn for_interface(name: &str) -> Self {
            Self::new(format!("/var/run/wireguard/{}.sock", name))
        }

        async fn exchange(&self, request: &str) -> NetworkResult<String> {
            let stream = UnixStream::connect(&self.path).await.map_err(|e| {
                NetworkError::Device(format!("cannot reach {}: {}", self.path.display(), e))
            })?;
            let (read_half, mut write_half) = stream.into_split();
            write_half.write_all(request.as_bytes()).await?;

            // The reply ends with an empty line
            let mut reader = BufReader::new(read_half);
            let mut reply = String::new();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await? == 0 || line == "\n" {
                    break;
                }
                reply.push_str(&line);
            }
            trace!("UAPI reply: {:?}", reply);
            Ok(reply)
        }
    }

    #[async_trait]
    impl TunnelDevice for UapiDevice {
        async fn apply(&self, batch: &ConfigBatch) -> NetworkResult<()> {
            let reply = self.exchange(&format!("set=1\n{}\n", batch)).await?;
            parse_errno(&reply)
        }

        async fn peer_stats(&self, peer: &PublicKey) -> NetworkResult<Option<PeerStats>> {
            let reply = self.exchange("get=1\n\n").await?;
            parse_errno(&reply)?;
            Ok(parse_peer_stats(&reply).get(peer).copied())
        }
    }
}

/// In-memory device that records every batch. Stats are set by hand.
#[derive(Default)]
pub struct RecordingDevice {
    batches: Mutex<Vec<ConfigBatch>>,
    stats: Mutex<HashMap<PublicKey, PeerStats>>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<ConfigBatch> {
        match self.batches.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Batches that mention `peer`
    pub fn batches_for(&self, peer: &PublicKey) -> Vec<ConfigBatch> {
        let hex = peer.to_hex();
        self.batches()
            .into_iter()
            .filter(|b| b.get("public_key") == Some(hex.as_str()))
            .collect()
    }

    pub fn set_stats(&self, peer: PublicKey, stats: PeerStats) {
        let mut guard = match self.stats.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.insert(peer, stats);
    }
}

#[async_trait]
impl TunnelDevice for RecordingDevice {
    async fn apply(&self, batch: &ConfigBatch) -> NetworkResult<()> {
        let mut guard = match self.batches.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push(batch.clone());
        Ok(())
    }

    async fn peer_stats(&self, peer: &PublicKey) -> NetworkResult<Option<PeerStats>> {
        let guard = match self.stats.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(guard.get(peer).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_rendering() {
        let peer = PublicKey::from_bytes([7u8; 32]);
        let batch = ConfigBatch::new()
            .public_key(&peer)
            .endpoint("198.51.100.1:51820".parse().unwrap())
            .replace_allowed_ips()
            .allowed_ip("10.200.0.2".parse().unwrap(), 32)
            .persistent_keepalive(5);

        let text = batch.to_string();
        assert_eq!(
            text,
            format!(
                "public_key={}\nendpoint=198.51.100.1:51820\nreplace_allowed_ips=true\n\
                 allowed_ip=10.200.0.2/32\npersistent_keepalive_interval=5\n",
                peer.to_hex()
            )
        );
        assert_eq!(batch.get("replace_allowed_ips"), Some("true"));
    }

    #[test]
    fn test_parse_errno() {
        assert!(parse_errno("errno=0\n").is_ok());
        assert!(matches!(parse_errno("errno=22\n"), Err(NetworkError::Device(_))));
        assert!(parse_errno("").is_err());
    }

    #[test]
    fn test_parse_peer_stats() {
        let a = PublicKey::from_bytes([1u8; 32]);
        let b = PublicKey::from_bytes([2u8; 32]);
        let reply = format!(
            "private_key=00\nlisten_port=51820\npublic_key={}\nrx_bytes=100\ntx_bytes=200\n\
             public_key={}\nendpoint=1.2.3.4:5\nrx_bytes=7\ntx_bytes=8\nerrno=0\n",
            a.to_hex(),
            b.to_hex()
        );
        let stats = parse_peer_stats(&reply);
        assert_eq!(stats.get(&a), Some(&PeerStats { rx_bytes: 100, tx_bytes: 200 }));
        assert_eq!(stats.get(&b), Some(&PeerStats { rx_bytes: 7, tx_bytes: 8 }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_uapi_set_round_trip() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::UnixListener;

        let dir = std::env::temp_dir().join(format!("meshpeer-uapi-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("wg-test.sock");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut request = String::new();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 || line == "\n" {
                    break;
                }
                request.push_str(&line);
            }
            write_half.write_all(b"errno=0\n\n").await.unwrap();
            request
        });

        let device = UapiDevice::new(&path);
        device.apply(&ConfigBatch::new().listen_port(51820)).await.unwrap();

        let request = server.await.unwrap();
        assert_eq!(request, "set=1\nlisten_port=51820\n");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
