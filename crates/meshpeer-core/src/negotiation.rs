//! Coordinator-free role selection
//!
//! Both peers evaluate the same pure functions over values they have
//! exchanged, so they agree on who listens and whose try counter counts
//! without another round trip.

use std::fmt;

use chrono::{DateTime, Utc};
use meshpeer_network::BindTechnique;
use serde::{Deserialize, Serialize};

/// Length of the try cycle
pub const TRY_CYCLE: u32 = 6;

/// How a peer link is set up for one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// Listen on the LAN, the peer sends
    LanIn,
    /// Send to the peer's LAN endpoint
    LanOut,
    /// Listen on our public endpoint
    WanIn,
    /// Send to the peer's public endpoint
    WanOut,
    /// Both sides send through the shared socket
    StunPunched,
}

impl ConnectionType {
    pub fn is_lan(&self) -> bool {
        matches!(self, ConnectionType::LanIn | ConnectionType::LanOut)
    }

    /// Listener roles configure no endpoint
    pub fn is_listener(&self) -> bool {
        matches!(self, ConnectionType::LanIn | ConnectionType::WanIn)
    }

    /// The type the peer computes for the same attempt
    pub fn counterpart(&self) -> ConnectionType {
        match self {
            ConnectionType::LanIn => ConnectionType::LanOut,
            ConnectionType::LanOut => ConnectionType::LanIn,
            ConnectionType::WanIn => ConnectionType::WanOut,
            ConnectionType::WanOut => ConnectionType::WanIn,
            ConnectionType::StunPunched => ConnectionType::StunPunched,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionType::LanIn => "LAN-in",
            ConnectionType::LanOut => "LAN-out",
            ConnectionType::WanIn => "WAN-in",
            ConnectionType::WanOut => "WAN-out",
            ConnectionType::StunPunched => "STUN-punched",
        };
        f.write_str(s)
    }
}

/// Position in the try cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Wan1,
    Lan1,
    Wan2,
    Lan2,
}

fn attempt_for(try_count: u32) -> Attempt {
    match try_count % TRY_CYCLE {
        0 | 4 => Attempt::Wan1,
        1 => Attempt::Lan1,
        2 | 5 => Attempt::Wan2,
        _ => Attempt::Lan2,
    }
}

/// Connection type for an attempt.
///
/// LAN attempts: the smaller key listens on variant 1 and sends on variant
/// 2. WAN attempts: both on STUN means punching through the shared socket;
/// otherwise the better WAN-in candidate listens on variant 1 and sends on
/// variant 2.
pub fn find_connection_type(
    try_count: u32,
    i_am_smaller: bool,
    both_stunning: bool,
    i_am_best_wan_in: bool,
) -> ConnectionType {
    use ConnectionType::*;

    match attempt_for(try_count) {
        Attempt::Lan1 if i_am_smaller => LanIn,
        Attempt::Lan1 => LanOut,
        Attempt::Lan2 if i_am_smaller => LanOut,
        Attempt::Lan2 => LanIn,
        Attempt::Wan1 | Attempt::Wan2 if both_stunning => StunPunched,
        Attempt::Wan1 if i_am_best_wan_in => WanIn,
        Attempt::Wan1 => WanOut,
        Attempt::Wan2 if i_am_best_wan_in => WanOut,
        Attempt::Wan2 => WanIn,
    }
}

/// Whether our technique makes us the better inbound side. Equal weights
/// go to the smaller key.
pub fn is_best_wan_in(mine: BindTechnique, theirs: BindTechnique, i_am_smaller: bool) -> bool {
    match mine.wan_in_weight().cmp(&theirs.wan_in_weight()) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => i_am_smaller,
    }
}

/// The try counter both sides use: the earlier launched negotiator keeps
/// its own. Equal launch times go to the smaller key.
pub fn adopt_try(
    my_try: u32,
    my_launch: DateTime<Utc>,
    peer_try: u32,
    peer_launch: DateTime<Utc>,
    i_am_smaller: bool,
) -> u32 {
    match my_launch.cmp(&peer_launch) {
        std::cmp::Ordering::Less => my_try,
        std::cmp::Ordering::Greater => peer_try,
        std::cmp::Ordering::Equal if i_am_smaller => my_try,
        std::cmp::Ordering::Equal => peer_try,
    }
}
