//! STUN bind strategy
//!
//! RFC 5389 binding requests sent from the shared public socket. The
//! transaction ID is derived from the process tag, so responses can be
//! recognized in the inbound stream without tracking outstanding requests.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use super::{BindStrategy, BindTechnique, Outbound, ProcessTag};
use crate::error::{NetworkError, NetworkResult};

/// STUN message types (RFC 5389)
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;
const STUN_BINDING_ERROR: u16 = 0x0111;

/// STUN attributes
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// STUN magic cookie (RFC 5389)
const MAGIC_COOKIE: u32 = 0x2112A442;

const HEADER_LEN: usize = 20;

/// Default STUN servers
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

/// STUN reflector strategy
pub struct StunStrategy {
    servers: Vec<String>,
    transaction_id: [u8; 12],
    cursor: AtomicUsize,
    timeout: Duration,
}

impl StunStrategy {
    pub fn new(tag: ProcessTag, servers: Vec<String>) -> Self {
        let servers = if servers.is_empty() {
            DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
        } else {
            servers
        };

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&tag.as_bytes()[..12]);

        Self {
            servers,
            transaction_id,
            cursor: AtomicUsize::new(0),
            timeout: Duration::from_secs(3),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Next server in rotation, resolved
    async fn next_server(&self) -> NetworkResult<SocketAddr> {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.servers.len();
        resolve(&self.servers[idx]).await
    }

    /// One binding request on a scratch socket; returns the mapped address
    pub async fn discover(&self) -> NetworkResult<SocketAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server = self.next_server().await?;
        socket.send_to(&self.request(), server).await?;

        // STUN messages should fit in 576 bytes
        let mut buf = [0u8; 576];
        let (len, _) = timeout(self.timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| NetworkError::TimeoutWithMessage("STUN request timed out".into()))??;

        let mapped = parse_binding_response(&buf[..len], &self.transaction_id)?;
        debug!("STUN query via {} mapped to {}", server, mapped);
        Ok(mapped)
    }

    /// Binding request packet carrying our transaction ID
    pub fn request(&self) -> Vec<u8> {
        build_binding_request(&self.transaction_id)
    }
}

async fn resolve(server: &str) -> NetworkResult<SocketAddr> {
    // Try parsing as socket address first, then resolve as hostname
    if let Ok(addr) = server.parse() {
        return Ok(addr);
    }
    tokio::net::lookup_host(server)
        .await
        .map_err(|e| NetworkError::ConfigError(format!("Failed to resolve STUN server '{}': {}", server, e)))?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| NetworkError::ConfigError(format!("No addresses found for STUN server: {}", server)))
}

#[async_trait]
impl BindStrategy for StunStrategy {
    fn technique(&self) -> BindTechnique {
        BindTechnique::Stun
    }

    async fn check_net(&self) -> NetworkResult<()> {
        self.discover().await.map(|_| ())
    }

    async fn bind_request(
        &self,
        _local: SocketAddr,
        tx: &mpsc::UnboundedSender<Outbound>,
    ) -> NetworkResult<()> {
        let server = self.next_server().await?;
        debug!("Sending STUN binding request to {}", server);
        tx.send(Outbound {
            to: server,
            payload: Bytes::from(self.request()),
        })
        .map_err(|_| NetworkError::Closed)
    }

    fn is_message(&self, data: &[u8]) -> bool {
        data.len() >= HEADER_LEN
            && matches!(
                u16::from_be_bytes([data[0], data[1]]),
                STUN_BINDING_RESPONSE | STUN_BINDING_ERROR
            )
            && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
            && data[8..HEADER_LEN] == self.transaction_id
    }

    fn decode(&self, data: &[u8]) -> Option<SocketAddr> {
        match parse_binding_response(data, &self.transaction_id) {
            Ok(addr) => Some(addr),
            Err(e) => {
                debug!("Ignoring STUN message: {}", e);
                None
            }
        }
    }
}

/// Build STUN binding request packet
fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN);

    packet.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
    // No attributes
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet.extend_from_slice(transaction_id);

    packet
}

/// Parse a binding response, returning the mapped address
fn parse_binding_response(data: &[u8], expected_txn_id: &[u8; 12]) -> NetworkResult<SocketAddr> {
    if data.len() < HEADER_LEN {
        return Err(NetworkError::Protocol("STUN response too short".into()));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let txn_id = &data[8..HEADER_LEN];

    if msg_type != STUN_BINDING_RESPONSE && msg_type != STUN_BINDING_ERROR {
        return Err(NetworkError::Protocol(format!(
            "Unexpected STUN message type: 0x{:04x}",
            msg_type
        )));
    }

    if magic != MAGIC_COOKIE {
        return Err(NetworkError::Protocol("Invalid STUN magic cookie".into()));
    }

    if txn_id != expected_txn_id {
        return Err(NetworkError::Protocol("Transaction ID mismatch".into()));
    }

    if msg_type == STUN_BINDING_ERROR {
        return Err(NetworkError::Protocol("STUN binding error response".into()));
    }

    if data.len() < HEADER_LEN + msg_len {
        return Err(NetworkError::Protocol("STUN message truncated".into()));
    }

    let mut mapped: Option<SocketAddr> = None;
    let mut xor_mapped: Option<SocketAddr> = None;

    let mut pos = HEADER_LEN;
    while pos + 4 <= HEADER_LEN + msg_len {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;

        if pos + attr_len > data.len() {
            break;
        }
        let attr = &data[pos..pos + attr_len];

        match attr_type {
            ATTR_MAPPED_ADDRESS => mapped = parse_address(attr, None),
            ATTR_XOR_MAPPED_ADDRESS => xor_mapped = parse_address(attr, Some(&data[4..HEADER_LEN])),
            _ => {}
        }

        // Attributes are padded to 4 bytes
        pos += (attr_len + 3) & !3;
    }

    xor_mapped
        .or(mapped)
        .ok_or_else(|| NetworkError::Protocol("No mapped address in STUN response".into()))
}

/// Parse MAPPED-ADDRESS, or XOR-MAPPED-ADDRESS when `xor_key` (cookie
/// followed by transaction ID) is given
fn parse_address(data: &[u8], xor_key: Option<&[u8]>) -> Option<SocketAddr> {
    if data.len() < 8 {
        return None;
    }

    let family = data[1];
    let mut port = u16::from_be_bytes([data[2], data[3]]);
    if let Some(key) = xor_key {
        port ^= u16::from_be_bytes([key[0], key[1]]);
    }

    match family {
        0x01 => {
            let mut ip = [data[4], data[5], data[6], data[7]];
            if let Some(key) = xor_key {
                for (b, k) in ip.iter_mut().zip(key) {
                    *b ^= k;
                }
            }
            Some(SocketAddr::new(Ipv4Addr::from(ip).into(), port))
        }
        0x02 => {
            if data.len() < 20 {
                return None;
            }
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&data[4..20]);
            if let Some(key) = xor_key {
                for (b, k) in ip.iter_mut().zip(key) {
                    *b ^= k;
                }
            }
            Some(SocketAddr::new(Ipv6Addr::from(ip).into(), port))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xor_response(txn: &[u8; 12], addr: SocketAddr) -> Vec<u8> {
        let mut resp = Vec::new();
        resp.extend_from_slice(&STUN_BINDING_RESPONSE.to_be_bytes());
        resp.extend_from_slice(&12u16.to_be_bytes());
        resp.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        resp.extend_from_slice(txn);

        resp.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        resp.extend_from_slice(&8u16.to_be_bytes());
        resp.push(0);
        resp.push(0x01);
        let cookie = MAGIC_COOKIE.to_be_bytes();
        let port = addr.port() ^ u16::from_be_bytes([cookie[0], cookie[1]]);
        resp.extend_from_slice(&port.to_be_bytes());
        let ip = match addr.ip() {
            std::net::IpAddr::V4(ip) => ip.octets(),
            _ => unreachable!(),
        };
        for i in 0..4 {
            resp.push(ip[i] ^ cookie[i]);
        }
        resp
    }

    #[test]
    fn test_stun_request_building() {
        let tag = ProcessTag::generate();
        let strategy = StunStrategy::new(tag, vec![]);
        let request = strategy.request();

        assert_eq!(request.len(), 20);
        assert_eq!(u16::from_be_bytes([request[0], request[1]]), STUN_BINDING_REQUEST);
        assert_eq!(u32::from_be_bytes([request[4], request[5], request[6], request[7]]), MAGIC_COOKIE);
        assert_eq!(&request[8..20], &tag.as_bytes()[..12]);
    }

    #[test]
    fn test_recognizes_and_decodes_own_response() {
        let tag = ProcessTag::generate();
        let strategy = StunStrategy::new(tag, vec![]);
        let mut txn = [0u8; 12];
        txn.copy_from_slice(&tag.as_bytes()[..12]);

        let public: SocketAddr = "198.51.100.20:61000".parse().unwrap();
        let response = xor_response(&txn, public);

        assert!(strategy.is_message(&response));
        assert_eq!(strategy.decode(&response), Some(public));
    }

    #[test]
    fn test_foreign_transaction_is_not_ours() {
        let strategy = StunStrategy::new(ProcessTag::generate(), vec![]);
        let response = xor_response(&[9u8; 12], "198.51.100.20:61000".parse().unwrap());
        assert!(!strategy.is_message(&response));
        assert!(!strategy.is_message(b"tunnel payload"));
    }

    #[tokio::test]
    async fn test_bind_request_queues_request() {
        let tag = ProcessTag::generate();
        let strategy = StunStrategy::new(tag, vec!["127.0.0.1:3478".to_string()]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        strategy
            .bind_request("0.0.0.0:5000".parse().unwrap(), &tx)
            .await
            .unwrap();

        let out = rx.recv().await.unwrap();
        assert_eq!(out.to, "127.0.0.1:3478".parse::<SocketAddr>().unwrap());
        assert_eq!(&out.payload[8..20], &tag.as_bytes()[..12]);
    }

    #[tokio::test]
    #[ignore] // Requires network access
    async fn test_public_stun_probe() {
        let strategy = StunStrategy::new(ProcessTag::generate(), vec![]);
        strategy.check_net().await.unwrap();
    }
}
