//! Counter-based link liveness
//!
//! A direction is up while its byte counter keeps changing. It goes down
//! once the counter has been flat for longer than the tolerance window.
//! The link is connected only while both directions are up.

use std::time::{Duration, Instant};

/// Change in the combined link state reported by [`LinkMonitor::observe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Up,
    Down,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct Direction {
    last: u64,
    changed_at: Instant,
    up: bool,
    ever_up: bool,
}

impl Direction {
    fn new(now: Instant) -> Self {
        Self {
            last: 0,
            changed_at: now,
            up: false,
            ever_up: false,
        }
    }

    fn observe(&mut self, value: u64, tolerance: Duration, now: Instant) {
        if value != self.last {
            self.last = value;
            self.changed_at = now;
            self.up = true;
            self.ever_up = true;
        } else if self.up && now.saturating_duration_since(self.changed_at) > tolerance {
            self.up = false;
        }
    }

    pub fn is_up(&self) -> bool {
        self.up
    }

    pub fn ever_up(&self) -> bool {
        self.ever_up
    }

    pub fn last_value(&self) -> u64 {
        self.last
    }

    pub fn changed_at(&self) -> Instant {
        self.changed_at
    }
}

/// RX/TX liveness tracker
#[derive(Debug, Clone)]
pub struct LinkMonitor {
    rx: Direction,
    tx: Direction,
    connected: bool,
}

impl LinkMonitor {
    pub fn new(now: Instant) -> Self {
        Self {
            rx: Direction::new(now),
            tx: Direction::new(now),
            connected: false,
        }
    }

    /// Feed the latest cumulative counters
    pub fn observe(&mut self, rx: u64, tx: u64, tolerance: Duration, now: Instant) -> LinkEvent {
        self.rx.observe(rx, tolerance, now);
        self.tx.observe(tx, tolerance, now);

        let connected = self.rx.up && self.tx.up;
        let event = match (self.connected, connected) {
            (false, true) => LinkEvent::Up,
            (true, false) => LinkEvent::Down,
            _ => LinkEvent::Unchanged,
        };
        self.connected = connected;
        event
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn rx(&self) -> &Direction {
        &self.rx
    }

    pub fn tx(&self) -> &Direction {
        &self.tx
    }

    /// Time since either counter last moved (or since creation)
    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = self.rx.changed_at.max(self.tx.changed_at);
        now.saturating_duration_since(last)
    }

    /// Not connected and idle for longer than `tolerance`
    pub fn is_dead(&self, tolerance: Duration, now: Instant) -> bool {
        !self.connected && self.idle_for(now) > tolerance
    }
}
