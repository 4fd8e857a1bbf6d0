//! Domain Telemetry Projection
//!
//! The admission core reads per-domain attack state (stage, attack
//! flags, configured limits) that is owned by the routing layer of the
//! embedding proxy. [`TelemetrySource`] is the narrow read-only seam
//! between the two: the core never mutates domain state and never sees
//! more of it than this projection.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Read-only snapshot of one domain's attack state and counters
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainTelemetry {
    /// Alert stage: 1 relaxed, 2 moderate, 3 strict
    pub stage: u8,
    /// Volumetric attack in progress
    pub raw_attack: bool,
    /// Challenge-evading attack in progress
    pub bypass_attack: bool,
    /// Configured stage-2 challenge difficulty, 0 for the global base
    pub stage2_difficulty: u32,
    /// Configured per-minute request limit, 0 for unlimited
    pub base_rate_limit: u32,
    /// Lifetime request count
    pub total_requests: u64,
    /// Lifetime bypassed-request count
    pub bypassed_requests: u64,
    /// Current request rate
    pub requests_per_second: f64,
    /// Current bypassed-request rate
    pub bypassed_per_second: f64,
}

impl DomainTelemetry {
    /// Whether either attack flag is raised
    pub fn under_attack(&self) -> bool {
        self.raw_attack || self.bypass_attack
    }
}

/// Provider of per-domain telemetry snapshots
///
/// Implemented by the embedding proxy over whatever guards its domain
/// table; implementations must be cheap since the hot path calls
/// [`TelemetrySource::telemetry`] once per request.
pub trait TelemetrySource: Send + Sync {
    /// All domains currently configured
    fn domains(&self) -> Vec<String>;

    /// Snapshot for one domain, `None` if it is not configured
    fn telemetry(&self, domain: &str) -> Option<DomainTelemetry>;
}

/// In-memory telemetry table
///
/// Suitable for embedders that push state into the core rather than
/// sharing a live table, and for tests.
#[derive(Default)]
pub struct StaticTelemetry {
    domains: RwLock<FxHashMap<String, DomainTelemetry>>,
}

impl StaticTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert or replace a domain's snapshot
    pub fn set(&self, domain: &str, telemetry: DomainTelemetry) {
        self.domains.write().insert(domain.to_string(), telemetry);
    }

    /// Remove a domain
    pub fn remove(&self, domain: &str) {
        self.domains.write().remove(domain);
    }
}

impl TelemetrySource for StaticTelemetry {
    fn domains(&self) -> Vec<String> {
        self.domains.read().keys().cloned().collect()
    }

    fn telemetry(&self, domain: &str) -> Option<DomainTelemetry> {
        self.domains.read().get(domain).copied()
    }
}
