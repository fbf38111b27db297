//! UPnP-IGD bind strategy
//!
//! Asks the gateway for an explicit UDP port mapping and reports the mapped
//! external address to ourselves through the shared socket.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use igd_next::{PortMappingProtocol, SearchOptions};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{
    is_public_ip, local_lan_ip, loopback_for, parse_self_report, self_report_frame,
    self_report_prefix, BindStrategy, BindTechnique, Outbound, ProcessTag,
};
use crate::error::{NetworkError, NetworkResult};

/// Mapping lease requested from the gateway
pub const UPNP_LEASE_SECS: u32 = 3600;

const MAPPING_DESCRIPTION: &str = "meshpeer";

pub struct UpnpStrategy {
    tag: ProcessTag,
    prefix: String,
    search_timeout: Duration,
    mapped_port: Mutex<Option<u16>>,
}

impl UpnpStrategy {
    pub fn new(tag: ProcessTag) -> Self {
        Self {
            tag,
            prefix: self_report_prefix(&tag, BindTechnique::UpnpIgd),
            search_timeout: Duration::from_secs(3),
            mapped_port: Mutex::new(None),
        }
    }

    fn unavailable(reason: impl ToString) -> NetworkError {
        NetworkError::TechniqueUnavailable {
            technique: BindTechnique::UpnpIgd.to_string(),
            reason: reason.to_string(),
        }
    }

    async fn gateway(&self) -> NetworkResult<igd_next::aio::Gateway<igd_next::aio::tokio::Tokio>> {
        let options = SearchOptions {
            timeout: Some(self.search_timeout),
            ..Default::default()
        };
        match timeout(
            self.search_timeout + Duration::from_secs(1),
            igd_next::aio::tokio::search_gateway(options),
        )
        .await
        {
            Ok(Ok(gateway)) => Ok(gateway),
            Ok(Err(e)) => Err(Self::unavailable(e)),
            Err(_) => Err(Self::unavailable("gateway search timed out")),
        }
    }

    fn set_mapped(&self, port: Option<u16>) {
        let mut guard = match self.mapped_port.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = port;
    }

    fn take_mapped(&self) -> Option<u16> {
        match self.mapped_port.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

#[async_trait]
impl BindStrategy for UpnpStrategy {
    fn technique(&self) -> BindTechnique {
        BindTechnique::UpnpIgd
    }

    async fn check_net(&self) -> NetworkResult<()> {
        let gateway = self.gateway().await?;
        let external = gateway.get_external_ip().await.map_err(Self::unavailable)?;
        if !is_public_ip(&external) {
            return Err(Self::unavailable(format!("gateway external IP {} is not public", external)));
        }
        debug!("UPnP gateway {} reports external IP {}", gateway.addr, external);
        Ok(())
    }

    async fn bind_request(
        &self,
        local: SocketAddr,
        tx: &mpsc::UnboundedSender<Outbound>,
    ) -> NetworkResult<()> {
        let gateway = self.gateway().await?;
        let lan_ip = local_lan_ip()?;
        let port = local.port();

        gateway
            .add_port(
                PortMappingProtocol::UDP,
                port,
                SocketAddr::new(lan_ip.into(), port),
                UPNP_LEASE_SECS,
                MAPPING_DESCRIPTION,
            )
            .await
            .map_err(Self::unavailable)?;
        self.set_mapped(Some(port));

        let external_ip = gateway.get_external_ip().await.map_err(Self::unavailable)?;
        let external = SocketAddr::new(external_ip, port);
        info!("UPnP mapped {}:{} -> {}", lan_ip, port, external);

        tx.send(Outbound {
            to: loopback_for(local),
            payload: self_report_frame(&self.tag, BindTechnique::UpnpIgd, external),
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
        let Some(port) = self.take_mapped() else {
            return;
        };
        // Best effort; the lease expires on its own otherwise
        match self.gateway().await {
            Ok(gateway) => match gateway.remove_port(PortMappingProtocol::UDP, port).await {
                Ok(()) => info!("Removed UPnP mapping for port {}", port),
                Err(e) => warn!("Failed to remove UPnP mapping for port {}: {}", port, e),
            },
            Err(e) => warn!("Could not reach gateway to release port {}: {}", port, e),
        }
    }
}
