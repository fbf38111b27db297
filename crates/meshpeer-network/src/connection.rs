//! Shared public network connection
//!
//! One UDP socket carries the externally visible side of the tunnel. Its
//! event loop keeps the external address current through the active bind
//! technique, bridges tunnel payload to the local device and rotates to
//! another technique when the current one stops working. Every rotation is
//! a new generation: fresh socket, fresh bridge table, fresh discovery.
//!
//! The same loop serves relay sessions on a bridging node, where traffic is
//! forwarded between the session owner and its counterpart instead of to the
//! local device.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::bind::peer_bridge::ACTIVATION_LEN;
use crate::bind::{BindRegistry, BindStrategy, BindTechnique, BindThroughPeer, Outbound, RelayCandidates, Strategies};
use crate::buffer::{BufferPool, Datagram};
use crate::device::PeerStats;
use crate::error::{NetworkError, NetworkResult};
use crate::NetworkConfig;

/// Payload sent to every bridged remote to hold NAT pinholes open
pub const KEEPALIVE_PAYLOAD: &[u8] = b"meshpeer-keepalive";

const CHANNEL_DEPTH: usize = 1024;

/// Externally reachable address of the shared socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicEndpoint {
    pub addr: SocketAddr,
    pub technique: BindTechnique,
}

#[derive(Debug)]
pub enum NetworkCommand {
    /// Bridge a remote through the shared socket; replies with the local
    /// address the tunnel device should use as the peer endpoint
    OpenBridge {
        remote: SocketAddr,
        reply: oneshot::Sender<NetworkResult<SocketAddr>>,
    },
    CloseBridge {
        remote: SocketAddr,
    },
    /// A peer could not get inbound traffic through the current technique
    ReportFailure,
    Shutdown,
}

/// Cloneable handle to a running [`NetworkConnection`]
#[derive(Clone)]
pub struct NetworkHandle {
    commands: mpsc::UnboundedSender<NetworkCommand>,
    endpoint: watch::Receiver<Option<PublicEndpoint>>,
}

impl NetworkHandle {
    /// Current public endpoint, if discovered
    pub fn endpoint(&self) -> Option<PublicEndpoint> {
        *self.endpoint.borrow()
    }

    pub fn watch_endpoint(&self) -> watch::Receiver<Option<PublicEndpoint>> {
        self.endpoint.clone()
    }

    /// Wait up to `limit` for a public endpoint
    pub async fn wait_endpoint(&self, limit: Duration) -> Option<PublicEndpoint> {
        let mut rx = self.endpoint.clone();
        let wait = async move {
            loop {
                let current = *rx.borrow_and_update();
                if current.is_some() {
                    return current;
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };
        timeout(limit, wait).await.ok().flatten()
    }

    pub async fn open_bridge(&self, remote: SocketAddr) -> NetworkResult<SocketAddr> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(NetworkCommand::OpenBridge { remote, reply })
            .map_err(|_| NetworkError::Closed)?;
        rx.await.map_err(|_| NetworkError::Closed)?
    }

    pub fn close_bridge(&self, remote: SocketAddr) {
        let _ = self.commands.send(NetworkCommand::CloseBridge { remote });
    }

    pub fn report_failure(&self) {
        let _ = self.commands.send(NetworkCommand::ReportFailure);
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(NetworkCommand::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Byte counters of a relay session, from the owner's point of view
#[derive(Debug, Default)]
pub struct RelayCounters {
    /// Bytes received from the owner and forwarded
    rx: AtomicU64,
    /// Bytes delivered to the owner
    tx: AtomicU64,
}

impl RelayCounters {
    pub fn snapshot(&self) -> PeerStats {
        PeerStats {
            rx_bytes: self.rx.load(Ordering::Relaxed),
            tx_bytes: self.tx.load(Ordering::Relaxed),
        }
    }
}

enum Role {
    Tunnel {
        upstream: SocketAddr,
    },
    Relay {
        session_id: u64,
        header: [u8; ACTIVATION_LEN],
        counters: Arc<RelayCounters>,
    },
}

enum GenerationEnd {
    Shutdown,
    Restart { saw_inbound: bool },
}

struct Bridge {
    remote: SocketAddr,
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
    /// Last datagram from the remote, or when the bridge was (re)requested
    last_inbound: Instant,
}

/// Per-generation state; dropped wholesale on rotation
struct Generation {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    strategy: Arc<dyn BindStrategy>,
    pool: Arc<BufferPool>,
    opened_at: Instant,
    last_traffic: Option<Instant>,
    last_bind: Option<Instant>,
    saw_inbound: bool,
    failures: u32,
    bridges: HashMap<SocketAddr, Bridge>,
    bridge_tx: mpsc::Sender<(SocketAddr, Datagram)>,
    owner: Option<SocketAddr>,
    counterpart: Option<SocketAddr>,
}

impl Generation {
    fn technique(&self) -> BindTechnique {
        self.strategy.technique()
    }

    async fn send(&self, data: &[u8], to: SocketAddr) {
        if let Err(e) = self.socket.send_to(data, to).await {
            debug!("Send to {} failed: {}", to, e);
        }
    }

    fn note_traffic(&mut self) {
        self.last_traffic = Some(Instant::now());
    }

    async fn refresh(&mut self, out_tx: &mpsc::UnboundedSender<Outbound>) -> NetworkResult<()> {
        self.last_bind = Some(Instant::now());
        self.strategy.bind_request(self.local, out_tx).await
    }

    fn needs_refresh(&self, have_endpoint: bool, rebind_interval: Duration) -> bool {
        if !have_endpoint || self.technique() == BindTechnique::PeerBridge {
            return true;
        }
        self.last_bind
            .map_or(true, |at| at.elapsed() >= rebind_interval)
    }

    /// Opened longer than tolerance, bridging something, yet silent
    fn liveness_failed(&self, tolerance: Duration, now: Instant) -> bool {
        if self.bridges.is_empty() || now.saturating_duration_since(self.opened_at) <= tolerance {
            return false;
        }
        self.last_traffic
            .map_or(true, |at| now.saturating_duration_since(at) > tolerance)
    }

    async fn ensure_bridge(&mut self, remote: SocketAddr, upstream: SocketAddr) -> NetworkResult<&mut Bridge> {
        if !self.bridges.contains_key(&remote) {
            let bridge = self.create_bridge(remote, upstream).await?;
            self.bridges.insert(remote, bridge);
        }
        self.bridges
            .get_mut(&remote)
            .ok_or_else(|| NetworkError::BindError(format!("bridge for {} vanished", remote)))
    }

    async fn create_bridge(&self, remote: SocketAddr, upstream: SocketAddr) -> NetworkResult<Bridge> {
        let bind_ip = match upstream.ip() {
            IpAddr::V4(ip) if ip.is_loopback() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_loopback() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
        socket.connect(upstream).await?;
        let socket = Arc::new(socket);

        info!(
            "Bridging {} <-> {} via {}",
            remote,
            upstream,
            socket.local_addr()?
        );

        let reader = tokio::spawn(bridge_reader(
            socket.clone(),
            self.pool.clone(),
            remote,
            upstream,
            self.bridge_tx.clone(),
        ));

        Ok(Bridge {
            remote,
            socket,
            reader,
            last_inbound: Instant::now(),
        })
    }

    fn close_bridge(&mut self, remote: SocketAddr) {
        if let Some(bridge) = self.bridges.remove(&remote) {
            bridge.reader.abort();
            debug!("Closed bridge for {}", remote);
        }
    }

    fn touch_bridge(&mut self, remote: SocketAddr) {
        if let Some(bridge) = self.bridges.get_mut(&remote) {
            bridge.last_inbound = Instant::now();
        }
    }

    /// Close bridges whose remote has been silent for longer than `tolerance`
    fn prune_bridges(&mut self, tolerance: Duration, now: Instant) -> usize {
        let dead: Vec<SocketAddr> = self
            .bridges
            .values()
            .filter(|bridge| now.saturating_duration_since(bridge.last_inbound) > tolerance)
            .map(|bridge| bridge.remote)
            .collect();
        for remote in &dead {
            info!("Bridge for {} silent for over {:?}, closing", remote, tolerance);
            self.close_bridge(*remote);
        }
        dead.len()
    }

    fn close_all(&mut self) {
        for (_, bridge) in self.bridges.drain() {
            bridge.reader.abort();
        }
    }

    /// Tunnel payload from a remote: hand it to the device through its bridge
    async fn forward_upstream(&mut self, dgram: &Datagram, upstream: SocketAddr) {
        let bridge = match self.ensure_bridge(dgram.from, upstream).await {
            Ok(bridge) => bridge,
            Err(e) => {
                warn!("Cannot bridge {}: {}", dgram.from, e);
                return;
            }
        };
        let now = Instant::now();
        bridge.last_inbound = now;
        if let Err(e) = bridge.socket.send(dgram.data()).await {
            debug!("Upstream send for {} failed: {}", bridge.remote, e);
        }
        self.saw_inbound = true;
        self.last_traffic = Some(now);
    }

    /// Relay payload between the session owner and its counterpart
    async fn forward_relay(&mut self, dgram: &Datagram, session_id: u64, header: &[u8], counters: &RelayCounters) {
        let from = dgram.from;
        let data = dgram.data();

        if data == header {
            if self.owner != Some(from) {
                info!("Relay session {} activated by {}", session_id, from);
                self.owner = Some(from);
            }
            self.send(data, from).await;
            return;
        }

        if self.owner == Some(from) {
            if let Some(counterpart) = self.counterpart {
                self.send(data, counterpart).await;
                counters.rx.fetch_add(data.len() as u64, Ordering::Relaxed);
            }
        } else {
            if self.counterpart.is_none() {
                info!("Relay session {} counterpart is {}", session_id, from);
                self.counterpart = Some(from);
            }
            if self.counterpart != Some(from) {
                trace!("Relay session {} dropping datagram from {}", session_id, from);
                return;
            }
            if let Some(owner) = self.owner {
                self.send(data, owner).await;
                counters.tx.fetch_add(data.len() as u64, Ordering::Relaxed);
            }
        }
        self.saw_inbound = true;
        self.note_traffic();
    }
}

/// Owner of the shared public socket
pub struct NetworkConnection {
    config: NetworkConfig,
    role: Role,
    strategies: Strategies,
    registry: Arc<BindRegistry>,
    fallback: Option<BindThroughPeer>,
    pool: Arc<BufferPool>,
    commands: mpsc::UnboundedReceiver<NetworkCommand>,
    endpoint: watch::Sender<Option<PublicEndpoint>>,
    fruitless: usize,
}

impl NetworkConnection {
    /// Connection bridging to the local tunnel device at `config.upstream`
    pub fn new(
        config: NetworkConfig,
        strategies: Strategies,
        registry: Arc<BindRegistry>,
    ) -> (Self, NetworkHandle) {
        let role = Role::Tunnel {
            upstream: config.upstream,
        };
        Self::with_role(config, role, strategies, registry)
    }

    /// Connection serving one relay session
    pub(crate) fn relay(
        config: NetworkConfig,
        strategies: Strategies,
        registry: Arc<BindRegistry>,
        session_id: u64,
        header: [u8; ACTIVATION_LEN],
        counters: Arc<RelayCounters>,
    ) -> (Self, NetworkHandle) {
        let role = Role::Relay {
            session_id,
            header,
            counters,
        };
        Self::with_role(config, role, strategies, registry)
    }

    fn with_role(
        config: NetworkConfig,
        role: Role,
        strategies: Strategies,
        registry: Arc<BindRegistry>,
    ) -> (Self, NetworkHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (endpoint_tx, endpoint_rx) = watch::channel(None);
        let pool = BufferPool::new(config.pool_capacity, config.mtu as usize + crate::buffer::BUFFER_HEADROOM);

        let connection = Self {
            config,
            role,
            strategies,
            registry,
            fallback: None,
            pool,
            commands: command_rx,
            endpoint: endpoint_tx,
            fruitless: 0,
        };
        let handle = NetworkHandle {
            commands: command_tx,
            endpoint: endpoint_rx,
        };
        (connection, handle)
    }

    /// Enable the relay fallback once local techniques are exhausted
    pub fn set_relay_candidates(&mut self, name: impl Into<String>, candidates: Arc<dyn RelayCandidates>) {
        self.fallback = Some(BindThroughPeer::new(name, candidates));
    }

    fn is_relay(&self) -> bool {
        matches!(self.role, Role::Relay { .. })
    }

    /// Run generations until shut down
    pub async fn run(mut self) -> NetworkResult<()> {
        let mut first = true;
        loop {
            if !first {
                tokio::select! {
                    _ = sleep(self.config.restart_delay) => {}
                    cmd = self.commands.recv() => match cmd {
                        None | Some(NetworkCommand::Shutdown) => return Ok(()),
                        Some(NetworkCommand::OpenBridge { reply, .. }) => {
                            let _ = reply.send(Err(NetworkError::Closed));
                        }
                        Some(_) => {}
                    }
                }
            }
            first = false;

            let strategy = self.choose_strategy().await?;
            let saw_inbound = match self.run_generation(strategy).await {
                Ok(GenerationEnd::Shutdown) => {
                    info!("Public connection shut down");
                    return Ok(());
                }
                Ok(GenerationEnd::Restart { saw_inbound }) => saw_inbound,
                Err(e) => {
                    warn!("Public connection generation failed: {}", e);
                    false
                }
            };

            if self.is_relay() {
                return Ok(());
            }

            if saw_inbound {
                self.fruitless = 0;
            } else {
                self.fruitless += 1;
            }
            info!(
                "Restarting public connection ({} generations without inbound traffic)",
                self.fruitless
            );
        }
    }

    async fn choose_strategy(&mut self) -> NetworkResult<Arc<dyn BindStrategy>> {
        if let Some(technique) = self.config.technique_override {
            if technique == BindTechnique::PeerBridge {
                if let Some(strategy) = self.try_peer_bridge().await {
                    return Ok(strategy);
                }
            } else if let Some(strategy) = self.strategies.get(technique) {
                return Ok(strategy);
            } else {
                warn!("Bind technique override {} has no strategy, rotating", technique);
            }
        }

        if !self.is_relay() && self.fallback.is_some() && self.fruitless >= self.registry.len().max(1) {
            self.fruitless = 0;
            info!("Local bind techniques exhausted, binding through a peer");
            if let Some(strategy) = self.try_peer_bridge().await {
                return Ok(strategy);
            }
        }

        for _ in 0..self.registry.len().max(1) {
            let technique = self.registry.next();
            if let Some(strategy) = self.strategies.get(technique) {
                return Ok(strategy);
            }
            debug!("No strategy for registered technique {}", technique);
        }

        self.strategies
            .get(BindTechnique::Stun)
            .ok_or_else(|| NetworkError::TechniqueUnavailable {
                technique: BindTechnique::Stun.to_string(),
                reason: "no strategy configured".into(),
            })
    }

    async fn try_peer_bridge(&self) -> Option<Arc<dyn BindStrategy>> {
        let fallback = self.fallback.as_ref()?;
        match fallback.establish().await {
            Ok(strategy) => Some(Arc::new(strategy)),
            Err(e) => {
                warn!("Bind through peer failed: {}", e);
                None
            }
        }
    }

    fn publish(&self, endpoint: Option<PublicEndpoint>) {
        let changed = self.endpoint.send_if_modified(|current| {
            if *current == endpoint {
                false
            } else {
                *current = endpoint;
                true
            }
        });
        if changed {
            match endpoint {
                Some(ep) => info!("Public endpoint is {} ({})", ep.addr, ep.technique),
                None => debug!("Public endpoint cleared"),
            }
        }
    }

    fn current_endpoint(&self) -> Option<PublicEndpoint> {
        *self.endpoint.borrow()
    }

    async fn run_generation(&mut self, strategy: Arc<dyn BindStrategy>) -> NetworkResult<GenerationEnd> {
        let socket = Arc::new(bind_udp(self.config.bind_addr)?);
        let local = socket.local_addr()?;
        let technique = strategy.technique();
        info!("Public socket bound to {} using {}", local, technique);

        let (inbound_tx, mut inbound_rx) = mpsc::channel(CHANNEL_DEPTH);
        let reader = tokio::spawn(socket_reader(socket.clone(), self.pool.clone(), inbound_tx));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (bridge_tx, mut bridge_rx) = mpsc::channel(CHANNEL_DEPTH);

        let mut gen = Generation {
            socket,
            local,
            strategy,
            pool: self.pool.clone(),
            opened_at: Instant::now(),
            last_traffic: None,
            last_bind: None,
            saw_inbound: false,
            failures: 0,
            bridges: HashMap::new(),
            bridge_tx,
            owner: None,
            counterpart: None,
        };

        let end = match self.config.public_ip {
            Some(ip) if technique != BindTechnique::PeerBridge => {
                self.publish(Some(PublicEndpoint {
                    addr: SocketAddr::new(ip, local.port()),
                    technique,
                }));
                None
            }
            _ => match gen.refresh(&out_tx).await {
                Ok(()) => None,
                Err(e) => {
                    warn!("{} bind request failed: {}", technique, e);
                    Some(GenerationEnd::Restart { saw_inbound: false })
                }
            },
        };

        let end = match end {
            Some(end) => end,
            None => self.event_loop(&mut gen, &mut inbound_rx, &out_tx, &mut out_rx, &mut bridge_rx).await,
        };

        reader.abort();
        gen.close_all();
        self.publish(None);
        gen.strategy.release(local).await;
        Ok(end)
    }

    async fn event_loop(
        &mut self,
        gen: &mut Generation,
        inbound_rx: &mut mpsc::Receiver<Datagram>,
        out_tx: &mpsc::UnboundedSender<Outbound>,
        out_rx: &mut mpsc::UnboundedReceiver<Outbound>,
        bridge_rx: &mut mpsc::Receiver<(SocketAddr, Datagram)>,
    ) -> GenerationEnd {
        let mut tick = interval(self.config.keepalive_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                dgram = inbound_rx.recv() => match dgram {
                    Some(dgram) => self.handle_inbound(gen, dgram).await,
                    None => {
                        warn!("Public socket reader stopped");
                        return GenerationEnd::Restart { saw_inbound: gen.saw_inbound };
                    }
                },
                Some(out) = out_rx.recv() => gen.send(&out.payload, out.to).await,
                Some((remote, dgram)) = bridge_rx.recv() => {
                    gen.send(dgram.data(), remote).await;
                    gen.note_traffic();
                }
                cmd = self.commands.recv() => match cmd {
                    None | Some(NetworkCommand::Shutdown) => return GenerationEnd::Shutdown,
                    Some(NetworkCommand::OpenBridge { remote, reply }) => {
                        let result = match self.role {
                            Role::Tunnel { upstream } => match gen.ensure_bridge(remote, upstream).await {
                                Ok(bridge) => {
                                    bridge.last_inbound = Instant::now();
                                    bridge.socket.local_addr().map_err(NetworkError::from)
                                }
                                Err(e) => Err(e),
                            },
                            Role::Relay { .. } => Err(NetworkError::Relay("relay sessions do not bridge".into())),
                        };
                        let _ = reply.send(result);
                    }
                    Some(NetworkCommand::CloseBridge { remote }) => gen.close_bridge(remote),
                    Some(NetworkCommand::ReportFailure) => {
                        if self.should_escalate(gen) {
                            info!(
                                "{} reported failing {} times without inbound traffic, escalating",
                                gen.technique(),
                                gen.failures
                            );
                            return GenerationEnd::Restart { saw_inbound: false };
                        }
                    }
                },
                _ = tick.tick() => {
                    if !self.on_tick(gen, out_tx).await {
                        return GenerationEnd::Restart { saw_inbound: gen.saw_inbound };
                    }
                }
            }
        }
    }

    async fn handle_inbound(&mut self, gen: &mut Generation, dgram: Datagram) {
        let data = dgram.data();

        if gen.strategy.is_message(data) {
            if let Some(addr) = gen.strategy.decode(data) {
                self.publish(Some(PublicEndpoint {
                    addr,
                    technique: gen.technique(),
                }));
            }
            return;
        }

        if data == KEEPALIVE_PAYLOAD {
            trace!("Keepalive from {}", dgram.from);
            gen.touch_bridge(dgram.from);
            gen.saw_inbound = true;
            return;
        }

        match &self.role {
            Role::Tunnel { upstream } => gen.forward_upstream(&dgram, *upstream).await,
            Role::Relay {
                session_id,
                header,
                counters,
            } => gen.forward_relay(&dgram, *session_id, header, counters).await,
        }
    }

    /// Keepalive tick; false when this generation should end
    async fn on_tick(&mut self, gen: &mut Generation, out_tx: &mpsc::UnboundedSender<Outbound>) -> bool {
        let tolerance = self.config.liveness_tolerance;
        let have_endpoint = self.current_endpoint().is_some();

        let discovers = self.config.public_ip.is_none() || gen.technique() == BindTechnique::PeerBridge;
        if discovers && gen.needs_refresh(have_endpoint, self.config.rebind_interval) {
            if let Err(e) = gen.refresh(out_tx).await {
                warn!("{} refresh failed: {}", gen.technique(), e);
                if !have_endpoint {
                    return false;
                }
            }
        }

        if !self.is_relay() {
            if !have_endpoint && gen.opened_at.elapsed() > tolerance {
                warn!("{} found no public endpoint within {:?}", gen.technique(), tolerance);
                return false;
            }

            // Whole generation silent: rotate before pruning empties the table
            let now = Instant::now();
            if gen.liveness_failed(tolerance, now) {
                warn!("No tunnel traffic within {:?} on {}, rotating", tolerance, gen.technique());
                return false;
            }
            gen.prune_bridges(tolerance, now);
        }

        for bridge in gen.bridges.values() {
            gen.send(KEEPALIVE_PAYLOAD, bridge.remote).await;
        }
        true
    }

    fn should_escalate(&self, gen: &mut Generation) -> bool {
        if self.is_relay() {
            return false;
        }
        gen.failures += 1;
        gen.failures > self.config.failure_threshold
            && gen.opened_at.elapsed() >= self.config.escalation_min_elapsed
            && !gen.saw_inbound
    }
}

/// Bind a UDP socket that can be rebound right after a reset
fn bind_udp(addr: SocketAddr) -> NetworkResult<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindError(format!("{}: {}", addr, e)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
    )
}

async fn socket_reader(socket: Arc<UdpSocket>, pool: Arc<BufferPool>, tx: mpsc::Sender<Datagram>) {
    loop {
        let mut buf = pool.get();
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if tx.send(Datagram { from, buf, len }).await.is_err() {
                    break;
                }
            }
            Err(e) if is_transient(&e) => continue,
            Err(e) => {
                warn!("Public socket receive failed: {}", e);
                break;
            }
        }
    }
}

async fn bridge_reader(
    socket: Arc<UdpSocket>,
    pool: Arc<BufferPool>,
    remote: SocketAddr,
    upstream: SocketAddr,
    tx: mpsc::Sender<(SocketAddr, Datagram)>,
) {
    loop {
        let mut buf = pool.get();
        match socket.recv(&mut buf).await {
            Ok(len) => {
                let dgram = Datagram { from: upstream, buf, len };
                if tx.send((remote, dgram)).await.is_err() {
                    break;
                }
            }
            Err(e) if is_transient(&e) => continue,
            Err(e) => {
                debug!("Bridge for {} stopped: {}", remote, e);
                break;
            }
        }
    }
}
