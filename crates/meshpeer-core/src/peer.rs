//! Per-peer negotiation
//!
//! A [`PeerConnection`] advertises our endpoints on the pair's discovery
//! topic until the peer's advertisement arrives, agrees on a connection
//! type, configures the tunnel device and then watches the device counters.
//! [`PeerConnection::run`] returns whenever the attempt is over; the
//! registry's supervisor resets the state and runs it again.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use meshpeer_network::{
    BindTechnique, ConfigBatch, LinkEvent, LinkMonitor, NetworkHandle, PublicEndpoint, TunnelDevice,
};
use tokio::sync::Mutex;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bus::DiscoveryBus;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::event::{encode_event, parse_event, topic_for, DiscoveryEvent, NetworkEndpointEvent};
use crate::negotiation::{adopt_try, find_connection_type, is_best_wan_in, ConnectionType};
use crate::profile::{PeerProfile, Profile};
use crate::status::{ConnectionStatus, PeerStatus};

/// Collaborators shared by every peer negotiation
pub struct PeerContext {
    pub config: CoreConfig,
    pub profile: Profile,
    pub bus: Arc<dyn DiscoveryBus>,
    pub device: Arc<dyn TunnelDevice>,
    pub network: NetworkHandle,
    /// LAN endpoint of our tunnel device
    pub private_endpoint: SocketAddr,
}

/// Mutable per-peer state
#[derive(Debug, Clone)]
pub struct PeerState {
    pub status: ConnectionStatus,
    pub connection_type: Option<ConnectionType>,
    pub try_count: u32,
    pub started: bool,
    pub started_at: Option<Instant>,
    /// Launch time of the current negotiation task
    pub launched_at: DateTime<Utc>,
    /// Launch time of the peer task we negotiated with
    pub peer_launched_at: Option<DateTime<Utc>>,
    pub peer_offers_bridging: bool,
    /// Our technique when the attempt was configured
    pub technique: Option<BindTechnique>,
    /// Remote bridged through the shared socket for STUN punching
    pub bridge: Option<SocketAddr>,
    pub connected: bool,
    pub connected_this_attempt: bool,
    pub ever_connected: bool,
    pub failure_reported: bool,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub last_error: Option<String>,
}

impl PeerState {
    fn new() -> Self {
        Self {
            status: ConnectionStatus::Initiating,
            connection_type: None,
            try_count: 0,
            started: false,
            started_at: None,
            launched_at: Utc::now(),
            peer_launched_at: None,
            peer_offers_bridging: false,
            technique: None,
            bridge: None,
            connected: false,
            connected_this_attempt: false,
            ever_connected: false,
            failure_reported: false,
            rx_bytes: 0,
            tx_bytes: 0,
            last_error: None,
        }
    }
}

pub struct PeerConnection {
    peer: PeerProfile,
    ctx: Arc<PeerContext>,
    topic: String,
    state: Mutex<PeerState>,
}

impl PeerConnection {
    pub fn new(peer: PeerProfile, ctx: Arc<PeerContext>) -> Arc<Self> {
        let topic = topic_for(&ctx.profile.public_key, &peer.public_key);
        Arc::new(Self {
            peer,
            ctx,
            topic,
            state: Mutex::new(PeerState::new()),
        })
    }

    pub fn peer(&self) -> &PeerProfile {
        &self.peer
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Short peer key for logs
    pub fn name(&self) -> String {
        self.peer.public_key.short()
    }

    pub async fn snapshot(&self) -> PeerState {
        self.state.lock().await.clone()
    }

    pub async fn status(&self) -> PeerStatus {
        let state = self.state.lock().await;
        PeerStatus {
            peer: self.peer.public_key.to_base64(),
            status: state.status,
            connection_type: state.connection_type,
            try_counter: state.try_count,
            last_error: state.last_error.clone(),
        }
    }

    pub async fn record_error(&self, error: impl Into<String>) {
        self.state.lock().await.last_error = Some(error.into());
    }

    /// One negotiation attempt. Returns `Ok` when the attempt ended
    /// normally and should be reset and retried.
    pub async fn run(self: Arc<Self>) -> CoreResult<()> {
        let config = self.ctx.config.clone();
        {
            let mut state = self.state.lock().await;
            state.launched_at = Utc::now();
            state.status = ConnectionStatus::Initiating;
        }
        info!("Negotiating with {} on {}", self.name(), self.topic);

        let mut events = self.ctx.bus.subscribe(&self.topic).await?;
        if self.ctx.network.wait_endpoint(config.endpoint_timeout).await.is_none() {
            warn!("No public endpoint for negotiation with {}", self.name());
            return Err(CoreError::Timeout);
        }

        let mut advertise = interval(config.advertise_interval);
        advertise.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick = interval(config.liveness_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let deadline = sleep(config.negotiation_timeout);
        tokio::pin!(deadline);

        // Present once the peer has been found
        let mut monitor: Option<LinkMonitor> = None;

        loop {
            tokio::select! {
                _ = advertise.tick(), if monitor.is_none() => {
                    if let Err(e) = self.advertise().await {
                        warn!("Advertisement to {} failed: {}", self.name(), e);
                    }
                }

                payload = events.recv() => {
                    let Some(payload) = payload else {
                        return Err(CoreError::Bus("subscription closed".into()));
                    };
                    let event = match parse_event(&payload) {
                        Ok(Some(DiscoveryEvent::NetworkEndpoint(event))) => event,
                        Ok(None) => continue,
                        Err(e) => {
                            debug!("Ignoring malformed event on {}: {}", self.topic, e);
                            continue;
                        }
                    };
                    if event.id != self.peer.public_key {
                        continue;
                    }

                    if monitor.is_none() {
                        self.on_peer_found(&event).await?;
                        monitor = Some(LinkMonitor::new(Instant::now()));
                    } else if self.peer_restarted(&event).await {
                        info!("{} restarted its negotiation", self.name());
                        return Ok(());
                    }
                }

                _ = tick.tick(), if monitor.is_some() => {
                    if let Some(monitor) = monitor.as_mut() {
                        if !self.check_liveness(monitor).await? {
                            return Ok(());
                        }
                    }
                }

                _ = &mut deadline, if monitor.is_none() => {
                    info!(
                        "No advertisement from {} within {:?}",
                        self.name(),
                        config.negotiation_timeout
                    );
                    return Ok(());
                }
            }
        }
    }

    fn endpoint_event(
        &self,
        endpoint: PublicEndpoint,
        try_count: u32,
        launched_at: DateTime<Utc>,
    ) -> NetworkEndpointEvent {
        NetworkEndpointEvent {
            id: self.ctx.profile.public_key,
            public_endpoint: endpoint.addr.to_string(),
            private_endpoint: self.ctx.private_endpoint.to_string(),
            try_count,
            bind_technique: endpoint.technique,
            offers_bridging: self.ctx.config.offers_bridging,
            sent_on: Utc::now(),
            launched_at,
        }
    }

    async fn publish(&self, event: NetworkEndpointEvent) -> CoreResult<()> {
        let payload = encode_event(&DiscoveryEvent::NetworkEndpoint(event))?;
        self.ctx.bus.publish(&self.topic, payload).await
    }

    async fn advertise(&self) -> CoreResult<()> {
        let Some(endpoint) = self.ctx.network.endpoint() else {
            debug!("Public endpoint unknown, not advertising to {}", self.name());
            return Ok(());
        };
        let (try_count, launched_at) = {
            let state = self.state.lock().await;
            (state.try_count, state.launched_at)
        };
        self.publish(self.endpoint_event(endpoint, try_count, launched_at))
            .await
    }

    async fn on_peer_found(&self, event: &NetworkEndpointEvent) -> CoreResult<()> {
        let endpoint = self
            .ctx
            .network
            .endpoint()
            .ok_or_else(|| CoreError::InvalidState("public endpoint lost".into()))?;
        let i_am_smaller = self.ctx.profile.public_key < self.peer.public_key;

        let (my_try, launched_at) = {
            let state = self.state.lock().await;
            (state.try_count, state.launched_at)
        };
        let try_count = adopt_try(my_try, launched_at, event.try_count, event.launched_at, i_am_smaller);
        let both_stunning =
            endpoint.technique == BindTechnique::Stun && event.bind_technique == BindTechnique::Stun;
        let best_wan_in = is_best_wan_in(endpoint.technique, event.bind_technique, i_am_smaller);
        let connection_type = find_connection_type(try_count, i_am_smaller, both_stunning, best_wan_in);

        info!(
            "Found {} ({} via {}), try {} -> {}",
            self.name(),
            event.public_endpoint,
            event.bind_technique,
            try_count,
            connection_type
        );

        // The state lock is not held across bridge setup or device I/O
        let (allowed_ip, prefix) = self.peer.allowed_ip();
        let mut batch = ConfigBatch::new().public_key(&self.peer.public_key);
        match connection_type {
            ConnectionType::LanOut => batch = batch.endpoint(event.private_addr()?),
            ConnectionType::WanOut => batch = batch.endpoint(event.public_addr()?),
            ConnectionType::StunPunched => {
                let remote = event.public_addr()?;
                let local = self.ctx.network.open_bridge(remote).await?;
                debug!("Bridged {} through {}", remote, local);
                self.state.lock().await.bridge = Some(remote);
                batch = batch.endpoint(local);
            }
            ConnectionType::LanIn | ConnectionType::WanIn => {}
        }
        let batch = batch
            .persistent_keepalive(self.ctx.config.persistent_keepalive_secs)
            .replace_allowed_ips()
            .allowed_ip(allowed_ip, prefix);
        self.ctx.device.apply(&batch).await?;

        {
            let mut state = self.state.lock().await;
            state.connection_type = Some(connection_type);
            state.status = ConnectionStatus::connecting(connection_type);
            state.technique = Some(endpoint.technique);
            state.peer_offers_bridging = event.offers_bridging;
            state.peer_launched_at = Some(event.launched_at);
            state.started = true;
            state.started_at = Some(Instant::now());
            state.try_count = try_count.wrapping_add(1);
        }

        // One last advertisement in case the peer has not seen ours yet
        self.publish(self.endpoint_event(endpoint, try_count, launched_at))
            .await
    }

    async fn peer_restarted(&self, event: &NetworkEndpointEvent) -> bool {
        self.state.lock().await.peer_launched_at != Some(event.launched_at)
    }

    /// Sample the device counters. `false` once the attempt is dead.
    async fn check_liveness(&self, monitor: &mut LinkMonitor) -> CoreResult<bool> {
        let stats = self
            .ctx
            .device
            .peer_stats(&self.peer.public_key)
            .await?
            .unwrap_or_default();
        let now = Instant::now();

        let mut state = self.state.lock().await;
        let tolerance = self.ctx.config.tolerance(state.ever_connected);

        match monitor.observe(stats.rx_bytes, stats.tx_bytes, tolerance, now) {
            LinkEvent::Up => {
                let technique = state.technique.unwrap_or(BindTechnique::Stun);
                info!("Connected to {} ({})", self.name(), technique);
                state.connected = true;
                state.connected_this_attempt = true;
                state.ever_connected = true;
                state.status = ConnectionStatus::Connected(technique);
            }
            LinkEvent::Down => {
                warn!(
                    "Link to {} went down (rx up: {}, tx up: {})",
                    self.name(),
                    monitor.rx().is_up(),
                    monitor.tx().is_up()
                );
                state.connected = false;
                if let Some(connection_type) = state.connection_type {
                    state.status = ConnectionStatus::connecting(connection_type);
                }
            }
            LinkEvent::Unchanged => {}
        }
        state.rx_bytes = stats.rx_bytes;
        state.tx_bytes = stats.tx_bytes;

        let waited = state
            .started_at
            .map_or(std::time::Duration::ZERO, |t| now.saturating_duration_since(t));
        let public = state.connection_type.map_or(false, |t| !t.is_lan());
        if public && !state.failure_reported && !monitor.rx().ever_up() && waited > tolerance {
            info!("Nothing inbound from {} after {:?}, reporting failure", self.name(), waited);
            state.failure_reported = true;
            self.ctx.network.report_failure();
        }

        if monitor.is_dead(tolerance, now) {
            info!(
                "{} silent for {:?}, abandoning attempt",
                self.name(),
                monitor.idle_for(now)
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Clear per-attempt state and remove the peer from the device
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if let Some(remote) = state.bridge.take() {
            self.ctx.network.close_bridge(remote);
        }
        // Retry the attempt that worked before moving on
        if state.connected_this_attempt {
            state.try_count = state.try_count.wrapping_sub(1);
        }
        state.started = false;
        state.started_at = None;
        state.peer_launched_at = None;
        state.peer_offers_bridging = false;
        state.connection_type = None;
        state.technique = None;
        state.connected = false;
        state.connected_this_attempt = false;
        state.failure_reported = false;
        state.rx_bytes = 0;
        state.tx_bytes = 0;
        state.status = ConnectionStatus::Initiating;
        let try_count = state.try_count;
        drop(state);

        debug!("Reset negotiation with {} (next try {})", self.name(), try_count);
        let batch = ConfigBatch::new().public_key(&self.peer.public_key).remove();
        if let Err(e) = self.ctx.device.apply(&batch).await {
            warn!("Could not remove {} from the device: {}", self.name(), e);
        }
    }
}
