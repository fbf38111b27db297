//! NAT-PMP bind strategy (RFC 6886)
//!
//! Two request types against the default gateway on port 5351: opcode 0
//! for the external address and opcode 1 for a UDP mapping.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{
    is_public_ip, loopback_for, parse_self_report, self_report_frame, self_report_prefix,
    BindStrategy, BindTechnique, Outbound, ProcessTag,
};
use crate::error::{NetworkError, NetworkResult};

pub const NATPMP_PORT: u16 = 5351;

/// Mapping lease requested from the gateway
pub const NATPMP_LEASE_SECS: u32 = 3600;

const OP_EXTERNAL_ADDRESS: u8 = 0;
const OP_MAP_UDP: u8 = 1;
const RESPONSE_BIT: u8 = 128;

pub struct NatPmpStrategy {
    tag: ProcessTag,
    prefix: String,
    gateway: Option<SocketAddr>,
    timeout: Duration,
    mapped_port: Mutex<Option<u16>>,
}

impl NatPmpStrategy {
    pub fn new(tag: ProcessTag) -> Self {
        Self {
            tag,
            prefix: self_report_prefix(&tag, BindTechnique::NatPmp),
            gateway: None,
            timeout: Duration::from_secs(2),
            mapped_port: Mutex::new(None),
        }
    }

    /// Use a fixed gateway instead of the routing table
    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(SocketAddr::V4(SocketAddrV4::new(gateway, NATPMP_PORT)));
        self
    }

    #[cfg(test)]
    fn with_gateway_addr(mut self, gateway: SocketAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    fn unavailable(reason: impl ToString) -> NetworkError {
        NetworkError::TechniqueUnavailable {
            technique: BindTechnique::NatPmp.to_string(),
            reason: reason.to_string(),
        }
    }

    fn gateway_addr(&self) -> NetworkResult<SocketAddr> {
        if let Some(addr) = self.gateway {
            return Ok(addr);
        }
        let ip = default_gateway().ok_or_else(|| Self::unavailable("no default gateway"))?;
        Ok(SocketAddr::V4(SocketAddrV4::new(ip, NATPMP_PORT)))
    }

    async fn transact(&self, request: &[u8], expect_op: u8, min_len: usize) -> NetworkResult<Vec<u8>> {
        let gateway = self.gateway_addr()?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(request, gateway).await?;

        let mut buf = [0u8; 16];
        let (n, _) = timeout(self.timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| Self::unavailable("gateway did not answer"))??;

        if n < min_len || buf[1] != expect_op {
            return Err(Self::unavailable("unexpected NAT-PMP response"));
        }
        let result_code = u16::from_be_bytes([buf[2], buf[3]]);
        if result_code != 0 {
            return Err(Self::unavailable(format!("gateway result code {}", result_code)));
        }
        Ok(buf[..n].to_vec())
    }

    async fn external_ip(&self) -> NetworkResult<Ipv4Addr> {
        let response = self
            .transact(&[0, OP_EXTERNAL_ADDRESS], RESPONSE_BIT | OP_EXTERNAL_ADDRESS, 12)
            .await?;
        Ok(Ipv4Addr::new(response[8], response[9], response[10], response[11]))
    }

    async fn map_port(&self, internal: u16, external: u16, lifetime: u32) -> NetworkResult<u16> {
        let response = self
            .transact(
                &map_request(internal, external, lifetime),
                RESPONSE_BIT | OP_MAP_UDP,
                16,
            )
            .await?;
        Ok(u16::from_be_bytes([response[10], response[11]]))
    }

    fn replace_mapped(&self, port: Option<u16>) -> Option<u16> {
        let mut guard = match self.mapped_port.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, port)
    }
}

fn map_request(internal: u16, external: u16, lifetime: u32) -> Vec<u8> {
    // version, opcode, reserved(2), internal port, suggested external port, lifetime
    let mut request = vec![0u8, OP_MAP_UDP, 0, 0];
    request.extend_from_slice(&internal.to_be_bytes());
    request.extend_from_slice(&external.to_be_bytes());
    request.extend_from_slice(&lifetime.to_be_bytes());
    request
}

#[async_trait]
impl BindStrategy for NatPmpStrategy {
    fn technique(&self) -> BindTechnique {
        BindTechnique::NatPmp
    }

    async fn check_net(&self) -> NetworkResult<()> {
        let external = self.external_ip().await?;
        if !is_public_ip(&external.into()) {
            return Err(Self::unavailable(format!("external IP {} is not public", external)));
        }
        debug!("NAT-PMP gateway reports external IP {}", external);
        Ok(())
    }

    async fn bind_request(
        &self,
        local: SocketAddr,
        tx: &mpsc::UnboundedSender<Outbound>,
    ) -> NetworkResult<()> {
        let external_ip = self.external_ip().await?;
        let mapped = self.map_port(local.port(), local.port(), NATPMP_LEASE_SECS).await?;
        self.replace_mapped(Some(local.port()));

        let external = SocketAddr::new(external_ip.into(), mapped);
        info!("NAT-PMP mapped port {} -> {}", local.port(), external);

        tx.send(Outbound {
            to: loopback_for(local),
            payload: self_report_frame(&self.tag, BindTechnique::NatPmp, external),
        })
        .map_err(|_| NetworkError::Closed)
    }

    fn is_message(&self, data: &[u8]) -> bool {
        data.starts_with(self.prefix.as_bytes())
    }

    fn decode(&self, data: &[u8]) -> Option<SocketAddr> {
        parse_self_report(&self.prefix, data)
    }

    async fn release(&self, _local: SocketAddr) {
        let Some(port) = self.replace_mapped(None) else {
            return;
        };
        // Lifetime 0 deletes the mapping
        match self.map_port(port, 0, 0).await {
            Ok(_) => info!("Removed NAT-PMP mapping for port {}", port),
            Err(e) => warn!("Failed to remove NAT-PMP mapping for port {}: {}", port, e),
        }
    }
}

/// Default gateway from the OS routing table
pub fn default_gateway() -> Option<Ipv4Addr> {
    #[cfg(target_os = "linux")]
    {
        let data = std::fs::read_to_string("/proc/net/route").ok()?;
        parse_proc_route(&data)
    }

    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("route")
            .args(["-n", "get", "default"])
            .output()
            .ok()?;
        let text = String::from_utf8(output.stdout).ok()?;
        text.lines()
            .find_map(|line| line.trim().strip_prefix("gateway:"))
            .and_then(|gw| gw.trim().parse().ok())
    }

    #[cfg(target_os = "windows")]
    {
        let output = std::process::Command::new("ipconfig").output().ok()?;
        let text = String::from_utf8(output.stdout).ok()?;
        text.lines().find_map(|line| {
            let rest = line.trim().strip_prefix("Default Gateway")?;
            let rest = rest.trim_start_matches(|c: char| c == '.' || c == ' ' || c == ':');
            rest.trim().parse::<Ipv4Addr>().ok().filter(|ip| !ip.is_unspecified())
        })
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        None
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_route(data: &str) -> Option<Ipv4Addr> {
    data.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 3 && fields[1] == "00000000" {
            // Gateway is little-endian hex
            let gw = u32::from_str_radix(fields[2], 16).ok()?;
            Some(Ipv4Addr::from(gw.swap_bytes()))
        } else {
            None
        }
    })
}
