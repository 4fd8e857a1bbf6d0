//! Palisade Admission Core
//!
//! The request-classification core of the Palisade reverse proxy.
//! For every inbound connection and request it decides whether to
//! admit, challenge, or drop the traffic, and it retunes its own
//! thresholds as attack intensity rises and falls.
//!
//! # Subsystems
//!
//! - **Reputation store**: persistent per-IP trust score with decay
//! - **Connection limiter**: concurrency, rate, and half-open caps
//! - **Multi-window counter**: request volume over four fixed windows
//! - **Adaptive controller**: attack-driven limit multipliers plus a
//!   learned trust-list
//! - **Difficulty controller**: dynamic proof-of-work difficulty
//! - **Geo/ASN resolver**: cached country/ASN policy
//! - **Metrics aggregator**: read-only roll-ups and exposition
//!
//! # Example
//!
//! ```ignore
//! use palisade_admission::{AdmissionConfig, AdmissionCore, StaticTelemetry};
//!
//! let telemetry = StaticTelemetry::new();
//! let core = AdmissionCore::new(AdmissionConfig::default(), telemetry)?;
//! core.start();
//!
//! match core.evaluate("198.51.100.7", "example.com").await {
//!     AdmissionDecision::Allow => { /* forward upstream */ }
//!     AdmissionDecision::Challenge { difficulty } => { /* issue PoW */ }
//!     AdmissionDecision::Deny { reason } => { /* drop */ }
//! }
//! ```

pub mod adaptive;
pub mod challenge;
pub mod config;
pub mod connection;
pub mod geo;
pub mod metrics;
pub mod reputation;
pub mod telemetry;
pub mod window;

// Re-exports for convenience
pub use adaptive::AdaptiveController;
pub use challenge::DifficultyController;
pub use config::{AdmissionConfig, GeoFilterMode};
pub use connection::ConnectionLimiter;
pub use geo::{GeoRecord, GeoResolver, GeoVerdict};
pub use metrics::{MetricsAggregator, MetricsSnapshot};
pub use reputation::{ReputationStore, ScoreEvent, ScoreReason};
pub use telemetry::{DomainTelemetry, StaticTelemetry, TelemetrySource};
pub use window::{MultiWindowCounter, WindowKind};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use reputation::{SCORE_CHALLENGE_FAILURE, SCORE_RATE_LIMIT_HIT, SCORE_SUCCESSFUL_ACCESS};

/// Capacity of the reputation score event channel
const SCORE_EVENT_CAPACITY: usize = 1024;
/// Cadence of the connection and window cleanup tasks
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
/// Cadence of the adaptive multiplier and metrics pull tasks
const RETUNE_INTERVAL: Duration = Duration::from_secs(10);
/// Cadence of the geo cache and per-IP metrics eviction tasks
const EVICTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Why a request was denied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// The connection limiter refused the source
    ConnectionLimit,
    /// The adaptive rate limit was exceeded
    RateLimit,
    /// Reputation score below the block threshold
    Reputation,
    /// Geo/ASN policy rejection
    Geo(String),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::ConnectionLimit => write!(f, "connection limit exceeded"),
            DenyReason::RateLimit => write!(f, "rate limit exceeded"),
            DenyReason::Reputation => write!(f, "reputation below threshold"),
            DenyReason::Geo(reason) => write!(f, "geo policy: {}", reason),
        }
    }
}

/// Published admission decision for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Forward the request to the origin
    Allow,
    /// Require a proof-of-work challenge at the given difficulty
    Challenge { difficulty: u32 },
    /// Drop the request
    Deny { reason: DenyReason },
}

impl AdmissionDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, AdmissionDecision::Allow)
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, AdmissionDecision::Deny { .. })
    }
}

/// The admission pipeline, composed from its seven subsystems
///
/// Each subsystem owns exactly one lock over its in-memory state; the
/// hot path consults them in a fixed order (connections → geo →
/// windows → reputation → adaptive → difficulty → metrics) and never
/// holds two locks at once. A core is
/// a plain value with explicit lifecycle: [`AdmissionCore::new`] wires
/// the components, [`AdmissionCore::start`] launches the background
/// tasks, [`AdmissionCore::shutdown`] stops them and closes the store.
pub struct AdmissionCore {
    config: AdmissionConfig,
    pub reputation: Arc<ReputationStore>,
    pub connections: Arc<ConnectionLimiter>,
    pub windows: Arc<MultiWindowCounter>,
    pub adaptive: Arc<AdaptiveController>,
    pub challenges: Arc<DifficultyController>,
    pub geo: Arc<GeoResolver>,
    pub metrics: Arc<MetricsAggregator>,
    telemetry: Arc<dyn TelemetrySource>,
    score_events: Mutex<Option<mpsc::Receiver<ScoreEvent>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AdmissionCore {
    /// Wire the admission pipeline
    ///
    /// Opens the reputation database when persistence is enabled;
    /// everything else is in-memory construction.
    pub fn new(config: AdmissionConfig, telemetry: Arc<dyn TelemetrySource>) -> Result<Self> {
        let reputation = Arc::new(ReputationStore::open(config.reputation.clone())?);
        let connections = Arc::new(ConnectionLimiter::new(config.connection_limits.clone()));
        let windows = Arc::new(MultiWindowCounter::new(config.ratelimit_windows.clone()));
        let adaptive = Arc::new(AdaptiveController::new(config.adaptive_rate_limit.clone()));
        let challenges = Arc::new(DifficultyController::new(
            config.challenge.clone(),
            Arc::clone(&reputation),
            Arc::clone(&telemetry),
        ));
        let geo = Arc::new(GeoResolver::new(config.geo.clone()));
        let metrics = Arc::new(MetricsAggregator::new());

        let (event_tx, event_rx) = mpsc::channel(SCORE_EVENT_CAPACITY);
        reputation.attach_events(event_tx);

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            reputation,
            connections,
            windows,
            adaptive,
            challenges,
            geo,
            metrics,
            telemetry,
            score_events: Mutex::new(Some(event_rx)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Classify one request
    ///
    /// Consults the subsystems in the fixed hot-path order and applies
    /// reputation and learning side effects for the outcome. The
    /// operation is not cancellable; it runs to completion so state
    /// stays consistent.
    pub async fn evaluate(&self, ip: &str, domain: &str) -> AdmissionDecision {
        if !self.connections.check_limit(ip) {
            self.reputation
                .update(ip, SCORE_RATE_LIMIT_HIT, ScoreReason::RateLimitHit);
            self.metrics.record_rate_limit_hit(ip);
            self.metrics.record_request(ip, false, true);
            return AdmissionDecision::Deny {
                reason: DenyReason::ConnectionLimit,
            };
        }

        match self.geo.check_filter(ip).await {
            GeoVerdict::Block { reason } => {
                self.metrics.record_request(ip, false, true);
                return AdmissionDecision::Deny {
                    reason: DenyReason::Geo(reason),
                };
            }
            GeoVerdict::Challenge => {
                self.metrics.record_request(ip, false, false);
                return AdmissionDecision::Challenge {
                    difficulty: self.challenges.difficulty(ip, domain),
                };
            }
            GeoVerdict::Allow => {}
        }

        self.windows.record(ip);

        if self.reputation.is_blocked(ip) {
            self.metrics.record_request(ip, false, true);
            return AdmissionDecision::Deny {
                reason: DenyReason::Reputation,
            };
        }

        let telemetry = self.telemetry.telemetry(domain).unwrap_or_default();

        if telemetry.base_rate_limit > 0 {
            let limit = self
                .adaptive
                .adaptive_limit(telemetry.base_rate_limit, domain);
            if self.windows.exceeds_limit(ip, WindowKind::Short, limit) {
                self.reputation
                    .update(ip, SCORE_RATE_LIMIT_HIT, ScoreReason::RateLimitHit);
                self.adaptive.learn(ip, false);
                self.metrics.record_rate_limit_hit(ip);
                self.metrics.record_request(ip, false, true);
                return AdmissionDecision::Deny {
                    reason: DenyReason::RateLimit,
                };
            }
        }

        // Trusted sources skip the challenge gate, never the deny gates
        let challenge_gate = telemetry.under_attack() || telemetry.stage >= 2;
        if challenge_gate && !self.adaptive.is_trusted(ip) {
            self.metrics.record_request(ip, false, false);
            return AdmissionDecision::Challenge {
                difficulty: self.challenges.difficulty(ip, domain),
            };
        }

        self.reputation
            .update(ip, SCORE_SUCCESSFUL_ACCESS, ScoreReason::SuccessfulAccess);
        self.adaptive.learn(ip, true);
        self.metrics.record_request(ip, false, false);
        AdmissionDecision::Allow
    }

    /// Feed a challenge outcome back into the pipeline
    ///
    /// A solved challenge counts as a bypass into the origin; a failed
    /// one debits reputation and trust.
    pub fn report_challenge_result(&self, ip: &str, solved: bool) {
        if solved {
            self.reputation
                .update(ip, SCORE_SUCCESSFUL_ACCESS, ScoreReason::SuccessfulAccess);
            self.adaptive.learn(ip, true);
            self.metrics.record_request(ip, true, false);
        } else {
            self.reputation
                .update(ip, SCORE_CHALLENGE_FAILURE, ScoreReason::ChallengeFailure);
            self.adaptive.learn(ip, false);
            self.metrics.record_challenge_failure(ip);
        }
    }

    /// Debit an IP whose TLS/HTTP fingerprint contradicts its claims
    pub fn report_fingerprint_mismatch(&self, ip: &str) {
        self.reputation.update(
            ip,
            reputation::SCORE_FINGERPRINT_MISMATCH,
            ScoreReason::FingerprintMismatch,
        );
    }

    /// Launch the background maintenance tasks
    ///
    /// One task per concern: reputation decay, connection and window
    /// cleanup, adaptive retune, geo cache eviction, metrics pull, and
    /// per-IP metrics eviction. Tasks honor [`AdmissionCore::shutdown`]
    /// between ticks. Must be called inside a tokio runtime; calling
    /// it twice spawns duplicate tasks.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();

        // Reputation decay
        {
            let reputation = Arc::clone(&self.reputation);
            let interval = Duration::from_secs(self.config.reputation.decay_interval_secs.max(1));
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let decayed = reputation.decay_tick();
                            if decayed > 0 {
                                debug!(decayed, "reputation decay pass");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        // Connection and window cleanup
        {
            let connections = Arc::clone(&self.connections);
            let windows = Arc::clone(&self.windows);
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            connections.cleanup();
                            windows.cleanup();
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        // Adaptive multiplier retune and trust eviction
        {
            let adaptive = Arc::clone(&self.adaptive);
            let telemetry = Arc::clone(&self.telemetry);
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(RETUNE_INTERVAL);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            for domain in telemetry.domains() {
                                if let Some(tel) = telemetry.telemetry(&domain) {
                                    adaptive.update_multiplier(
                                        &domain,
                                        tel.raw_attack,
                                        tel.bypass_attack,
                                    );
                                }
                            }
                            adaptive.cleanup_trust();
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        // Metrics pull and score-event drain
        {
            let metrics = Arc::clone(&self.metrics);
            let connections = Arc::clone(&self.connections);
            let telemetry = Arc::clone(&self.telemetry);
            let mut events = self.score_events.lock().take();
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(RETUNE_INTERVAL);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Some(rx) = events.as_mut() {
                                metrics.drain_score_events(rx);
                            }
                            for domain in telemetry.domains() {
                                if let Some(tel) = telemetry.telemetry(&domain) {
                                    metrics.update_domain(&domain, &tel);
                                }
                            }
                            metrics.update_global(connections.tracked_ips() as u64);
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        // Geo cache, per-IP metrics, and stale reputation eviction
        {
            let geo = Arc::clone(&self.geo);
            let metrics = Arc::clone(&self.metrics);
            let reputation = Arc::clone(&self.reputation);
            let retention_days = self.config.reputation.retention_days;
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            geo.cleanup();
                            metrics.cleanup();
                            reputation.cleanup(retention_days);
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        info!(tasks = tasks.len(), "admission core background tasks started");
    }

    /// Stop the background tasks and close the reputation store
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }
        self.reputation.close();
        info!("admission core shut down");
    }
}
