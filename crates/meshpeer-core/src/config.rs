//! Core configuration

use std::time::Duration;

/// Negotiation timing and policy
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// How often an unanswered advertisement is republished
    pub advertise_interval: Duration,

    /// Peer liveness tick
    pub liveness_tick: Duration,

    /// Liveness tolerance before the peer has ever connected
    pub initial_tolerance: Duration,

    /// Liveness tolerance once a connection has succeeded
    pub established_tolerance: Duration,

    /// How long to wait for the peer's advertisement before starting over
    pub negotiation_timeout: Duration,

    /// How long to wait for our own public endpoint
    pub endpoint_timeout: Duration,

    /// Persistent keepalive pushed to the tunnel device
    pub persistent_keepalive_secs: u16,

    /// Pause before a peer's negotiation restarts
    pub restart_backoff: Duration,

    /// Offer to bridge traffic for other peers
    pub offers_bridging: bool,

    /// Port peers reach our relay control RPC on
    pub relay_rpc_port: u16,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            advertise_interval: Duration::from_secs(2),
            liveness_tick: Duration::from_millis(500),
            initial_tolerance: Duration::from_secs(15),
            established_tolerance: Duration::from_secs(60),
            negotiation_timeout: Duration::from_secs(120),
            endpoint_timeout: Duration::from_secs(30),
            persistent_keepalive_secs: 5,
            restart_backoff: Duration::from_secs(1),
            offers_bridging: false,
            relay_rpc_port: 51823,
        }
    }
}

impl CoreConfig {
    /// Tolerance for the current attempt
    pub fn tolerance(&self, ever_connected: bool) -> Duration {
        if ever_connected {
            self.established_tolerance
        } else {
            self.initial_tolerance
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.liveness_tick.is_zero() {
            return Err("Liveness tick must be non-zero".into());
        }
        if self.initial_tolerance <= self.liveness_tick {
            return Err("Initial tolerance must exceed the liveness tick".into());
        }
        if self.established_tolerance < self.initial_tolerance {
            return Err("Established tolerance must not be shorter than the initial tolerance".into());
        }
        if self.advertise_interval.is_zero() {
            return Err("Advertisement interval must be non-zero".into());
        }
        Ok(())
    }
}
