//! Multi-Window Rate Accounting
//!
//! Request volume per IP over four fixed-width windows (burst, short,
//! medium, long). Fixed windows keep updates O(1): each window kind
//! maps a bucket timestamp (epoch seconds floored to the window size)
//! to per-IP counts, and a read returns the count in the current
//! bucket only. At a boundary the count restarts from zero; callers
//! needing smoothing inspect the longer windows.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::WindowConfig;

/// The four accounting windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowKind {
    /// Seconds-scale spikes (default 10 s)
    Burst,
    /// Minute scale (default 60 s)
    Short,
    /// Five-minute scale (default 300 s)
    Medium,
    /// Hour scale (default 3600 s)
    Long,
}

impl WindowKind {
    pub const ALL: [WindowKind; 4] = [
        WindowKind::Burst,
        WindowKind::Short,
        WindowKind::Medium,
        WindowKind::Long,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Burst => "burst",
            WindowKind::Short => "short",
            WindowKind::Medium => "medium",
            WindowKind::Long => "long",
        }
    }
}

type BucketMap = FxHashMap<u64, FxHashMap<String, u32>>;

#[derive(Default)]
struct WindowState {
    burst: BucketMap,
    short: BucketMap,
    medium: BucketMap,
    long: BucketMap,
}

impl WindowState {
    fn buckets_mut(&mut self, kind: WindowKind) -> &mut BucketMap {
        match kind {
            WindowKind::Burst => &mut self.burst,
            WindowKind::Short => &mut self.short,
            WindowKind::Medium => &mut self.medium,
            WindowKind::Long => &mut self.long,
        }
    }

    fn buckets(&self, kind: WindowKind) -> &BucketMap {
        match kind {
            WindowKind::Burst => &self.burst,
            WindowKind::Short => &self.short,
            WindowKind::Medium => &self.medium,
            WindowKind::Long => &self.long,
        }
    }
}

/// Request counter over the four fixed windows
pub struct MultiWindowCounter {
    config: WindowConfig,
    state: RwLock<WindowState>,
}

impl MultiWindowCounter {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            state: RwLock::new(WindowState::default()),
        }
    }

    /// Window duration in seconds for a kind
    pub fn window_secs(&self, kind: WindowKind) -> u64 {
        match kind {
            WindowKind::Burst => self.config.burst,
            WindowKind::Short => self.config.short,
            WindowKind::Medium => self.config.medium,
            WindowKind::Long => self.config.long,
        }
    }

    fn bucket_ts(&self, kind: WindowKind, now: u64) -> u64 {
        let width = self.window_secs(kind);
        now / width * width
    }

    /// Record one request in the current bucket of all four windows
    pub fn record(&self, ip: &str) {
        self.record_at(ip, unix_now());
    }

    fn record_at(&self, ip: &str, now: u64) {
        let mut state = self.state.write();
        for kind in WindowKind::ALL {
            let ts = self.bucket_ts(kind, now);
            let bucket = state.buckets_mut(kind).entry(ts).or_default();
            *bucket.entry(ip.to_string()).or_insert(0) += 1;
        }
    }

    /// Request count for an IP in the current bucket of one window
    pub fn count(&self, ip: &str, kind: WindowKind) -> u32 {
        self.count_at(ip, kind, unix_now())
    }

    fn count_at(&self, ip: &str, kind: WindowKind, now: u64) -> u32 {
        let ts = self.bucket_ts(kind, now);
        let state = self.state.read();
        state
            .buckets(kind)
            .get(&ts)
            .and_then(|bucket| bucket.get(ip))
            .copied()
            .unwrap_or(0)
    }

    /// Whether an IP's current-bucket count has reached `limit`
    pub fn exceeds_limit(&self, ip: &str, kind: WindowKind, limit: u32) -> bool {
        self.count(ip, kind) >= limit
    }

    /// Drop buckets more than two window periods behind the current one
    ///
    /// The current and previous buckets survive per window kind so
    /// reads stay continuous across boundary seconds.
    pub fn cleanup(&self) {
        self.cleanup_at(unix_now());
    }

    fn cleanup_at(&self, now: u64) {
        let mut state = self.state.write();
        for kind in WindowKind::ALL {
            let width = self.window_secs(kind);
            let cutoff = (now / width * width).saturating_sub(width * 2);
            state.buckets_mut(kind).retain(|ts, _| *ts >= cutoff);
        }
    }

    /// Number of live buckets across all windows
    pub fn bucket_count(&self) -> usize {
        let state = self.state.read();
        WindowKind::ALL
            .iter()
            .map(|kind| state.buckets(*kind).len())
            .sum()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
