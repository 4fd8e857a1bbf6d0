//! Per-IP Connection Limiter
//!
//! Cheap pre-filter consulted before any other admission work. Three
//! caps are enforced in one lock acquisition: concurrent connections,
//! connection-establishment rate over a sliding window, and half-open
//! connections when SYN flood protection is on.
//!
//! The limiter is a pure in-memory decision function; it cannot fail.
//! Callers pair increments with decrements; decrements finding zero
//! clamp at zero rather than erroring.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::ConnectionLimitsConfig;

/// Tracking state for one IP with live connections
#[derive(Debug, Default)]
struct ConnectionState {
    /// Fully established connections
    active: u32,
    /// Connections past SYN but not yet established
    half_open: u32,
    /// Establishment timestamps inside the rate window, oldest first
    rate_window: VecDeque<Instant>,
}

impl ConnectionState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.rate_window.front() {
            if now.duration_since(*front) < window {
                break;
            }
            self.rate_window.pop_front();
        }
    }

    fn is_idle(&self) -> bool {
        self.active == 0 && self.half_open == 0 && self.rate_window.is_empty()
    }
}

/// Connection limiter enforcing concurrency, rate, and half-open caps
pub struct ConnectionLimiter {
    config: ConnectionLimitsConfig,
    states: RwLock<FxHashMap<String, ConnectionState>>,
}

impl ConnectionLimiter {
    pub fn new(config: ConnectionLimitsConfig) -> Self {
        Self {
            config,
            states: RwLock::new(FxHashMap::default()),
        }
    }

    fn rate_window(&self) -> Duration {
        Duration::from_millis(self.config.rate_window_ms)
    }

    /// Whether an IP may establish a new connection
    ///
    /// Prunes the IP's rate window as a side effect, so a `true` result
    /// guarantees the window holds fewer than the configured maximum.
    pub fn check_limit(&self, ip: &str) -> bool {
        let now = Instant::now();
        let window = self.rate_window();
        let mut states = self.states.write();

        let Some(state) = states.get_mut(ip) else {
            // Nothing tracked yet, every cap trivially holds
            return true;
        };

        if state.active >= self.config.max_concurrent_per_ip {
            return false;
        }

        state.prune(now, window);
        if state.rate_window.len() >= self.config.max_connection_rate_per_ip {
            return false;
        }

        if self.config.enable_syn_flood_protection
            && state.half_open >= self.config.max_half_open_per_ip
        {
            return false;
        }

        true
    }

    /// Record an established connection
    pub fn increment_connection(&self, ip: &str) {
        let mut states = self.states.write();
        let state = states.entry(ip.to_string()).or_default();
        state.active += 1;
        state.rate_window.push_back(Instant::now());
    }

    /// Record a closed connection
    ///
    /// The entry is dropped once nothing remains to track, bounding
    /// memory to IPs with live state.
    pub fn decrement_connection(&self, ip: &str) {
        let now = Instant::now();
        let window = self.rate_window();
        let mut states = self.states.write();
        if let Some(state) = states.get_mut(ip) {
            state.active = state.active.saturating_sub(1);
            state.prune(now, window);
            if state.is_idle() {
                states.remove(ip);
            }
        }
    }

    /// Record a received SYN (no-op unless SYN flood protection is on)
    pub fn increment_half_open(&self, ip: &str) {
        if !self.config.enable_syn_flood_protection {
            return;
        }
        let mut states = self.states.write();
        states.entry(ip.to_string()).or_default().half_open += 1;
    }

    /// Record a completed or timed-out handshake
    pub fn decrement_half_open(&self, ip: &str) {
        if !self.config.enable_syn_flood_protection {
            return;
        }
        let now = Instant::now();
        let window = self.rate_window();
        let mut states = self.states.write();
        if let Some(state) = states.get_mut(ip) {
            state.half_open = state.half_open.saturating_sub(1);
            state.prune(now, window);
            if state.is_idle() {
                states.remove(ip);
            }
        }
    }

    /// Current active connection count for an IP
    pub fn count(&self, ip: &str) -> u32 {
        self.states.read().get(ip).map(|s| s.active).unwrap_or(0)
    }

    /// Number of IPs currently tracked
    pub fn tracked_ips(&self) -> usize {
        self.states.read().len()
    }

    /// Prune every rate window and drop idle entries
    ///
    /// Half-open counts are deliberately untouched here: they mirror
    /// kernel TCP state and only paired call sites may move them.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = self.rate_window();
        let mut states = self.states.write();
        states.retain(|_, state| {
            state.prune(now, window);
            !state.is_idle()
        });
    }
}
