//! Admission Metrics Aggregation
//!
//! Read-only roll-up of per-IP, per-domain, and global counters:
//! - Per-IP: request/bypass/block counts, challenge failures,
//!   rate-limit hits, last reputation score
//! - Per-domain: pulled from telemetry every 10 seconds
//! - Global: derived totals, rates, and uptime
//!
//! The aggregator observes the pipeline and never feeds back into
//! admission decisions. Reputation score changes arrive through a
//! bounded event channel drained on the aggregator's schedule.
//!
//! Export formats:
//! - Prometheus text exposition (serving it over HTTP is the
//!   embedder's job)
//! - JSON snapshot

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::reputation::ScoreEvent;
use crate::telemetry::DomainTelemetry;

/// Per-IP entries with no observation for this long are evicted
const IP_RETENTION: Duration = Duration::from_secs(24 * 3600);
/// Per-IP records included in the Prometheus exposition
const IP_EXPORT_CAP: usize = 100;

/// Counters for one source IP
#[derive(Debug, Clone)]
pub struct IpMetrics {
    pub total_requests: u64,
    pub bypassed_requests: u64,
    pub blocked_requests: u64,
    pub challenge_failures: u64,
    pub rate_limit_hits: u64,
    pub reputation_score: i32,
    last_seen: Instant,
}

impl IpMetrics {
    fn new() -> Self {
        Self {
            total_requests: 0,
            bypassed_requests: 0,
            blocked_requests: 0,
            challenge_failures: 0,
            rate_limit_hits: 0,
            reputation_score: crate::reputation::DEFAULT_SCORE,
            last_seen: Instant::now(),
        }
    }
}

/// Counters for one domain, pulled from telemetry
#[derive(Debug, Clone, Default)]
pub struct DomainMetrics {
    pub total_requests: u64,
    pub bypassed_requests: u64,
    pub requests_per_second: f64,
    pub bypassed_per_second: f64,
    pub current_stage: u8,
    pub under_attack: bool,
    /// When the current attack began, if one is in progress
    pub attack_started: Option<Instant>,
}

/// Derived process-wide counters
#[derive(Debug, Clone, Default)]
struct GlobalMetrics {
    total_requests: u64,
    requests_per_second: f64,
    active_connections: u64,
}

/// Serializable summary for read-only consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub requests_per_second: f64,
    pub active_connections: u64,
    pub uptime_seconds: u64,
    pub tracked_ips: usize,
    pub tracked_domains: usize,
}

/// Aggregator over per-IP, per-domain, and global roll-ups
pub struct MetricsAggregator {
    per_ip: RwLock<FxHashMap<String, IpMetrics>>,
    per_domain: RwLock<FxHashMap<String, DomainMetrics>>,
    global: RwLock<GlobalMetrics>,
    start_time: Instant,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            per_ip: RwLock::new(FxHashMap::default()),
            per_domain: RwLock::new(FxHashMap::default()),
            global: RwLock::new(GlobalMetrics::default()),
            start_time: Instant::now(),
        }
    }

    /// Record one request outcome for an IP
    pub fn record_request(&self, ip: &str, bypassed: bool, blocked: bool) {
        let mut per_ip = self.per_ip.write();
        let metrics = per_ip.entry(ip.to_string()).or_insert_with(IpMetrics::new);
        metrics.total_requests += 1;
        if bypassed {
            metrics.bypassed_requests += 1;
        }
        if blocked {
            metrics.blocked_requests += 1;
        }
        metrics.last_seen = Instant::now();
    }

    /// Record a failed challenge for an IP
    pub fn record_challenge_failure(&self, ip: &str) {
        let mut per_ip = self.per_ip.write();
        let metrics = per_ip.entry(ip.to_string()).or_insert_with(IpMetrics::new);
        metrics.challenge_failures += 1;
        metrics.last_seen = Instant::now();
    }

    /// Record a rate-limit hit for an IP
    pub fn record_rate_limit_hit(&self, ip: &str) {
        let mut per_ip = self.per_ip.write();
        let metrics = per_ip.entry(ip.to_string()).or_insert_with(IpMetrics::new);
        metrics.rate_limit_hits += 1;
        metrics.last_seen = Instant::now();
    }

    /// Drain pending reputation score events into the per-IP roll-up
    pub fn drain_score_events(&self, receiver: &mut mpsc::Receiver<ScoreEvent>) {
        let mut per_ip = self.per_ip.write();
        while let Ok(event) = receiver.try_recv() {
            let metrics = per_ip
                .entry(event.ip)
                .or_insert_with(IpMetrics::new);
            metrics.reputation_score = event.score;
        }
    }

    /// Refresh one domain's roll-up from a telemetry snapshot
    ///
    /// The attack start time latches when a domain transitions into
    /// attack and clears when the attack ends.
    pub fn update_domain(&self, domain: &str, telemetry: &DomainTelemetry) {
        let mut per_domain = self.per_domain.write();
        let metrics = per_domain.entry(domain.to_string()).or_default();

        metrics.total_requests = telemetry.total_requests;
        metrics.bypassed_requests = telemetry.bypassed_requests;
        metrics.requests_per_second = telemetry.requests_per_second;
        metrics.bypassed_per_second = telemetry.bypassed_per_second;
        metrics.current_stage = telemetry.stage;
        metrics.under_attack = telemetry.under_attack();

        if metrics.under_attack {
            if metrics.attack_started.is_none() {
                metrics.attack_started = Some(Instant::now());
            }
        } else {
            metrics.attack_started = None;
        }
    }

    /// Recompute global derived values
    ///
    /// `active_connections` comes from the connection limiter's
    /// tracked-IP view; request totals and rates sum the domain
    /// roll-ups.
    pub fn update_global(&self, active_connections: u64) {
        let per_domain = self.per_domain.read();
        let total_requests = per_domain.values().map(|d| d.total_requests).sum();
        let requests_per_second = per_domain.values().map(|d| d.requests_per_second).sum();
        drop(per_domain);

        let mut global = self.global.write();
        global.total_requests = total_requests;
        global.requests_per_second = requests_per_second;
        global.active_connections = active_connections;
    }

    /// IPs with blocked requests, most-blocked first
    pub fn top_attacking_ips(&self, n: usize) -> Vec<(String, u64)> {
        let per_ip = self.per_ip.read();
        let mut offenders: Vec<(String, u64)> = per_ip
            .iter()
            .filter(|(_, m)| m.blocked_requests > 0)
            .map(|(ip, m)| (ip.clone(), m.blocked_requests))
            .collect();
        offenders.sort_by(|a, b| b.1.cmp(&a.1));
        offenders.truncate(n);
        offenders
    }

    /// Evict per-IP entries with no observation in the retention window
    pub fn cleanup(&self) {
        let mut per_ip = self.per_ip.write();
        per_ip.retain(|_, metrics| metrics.last_seen.elapsed() <= IP_RETENTION);
    }

    /// Seconds since the aggregator was created
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Read-only summary
    pub fn snapshot(&self) -> MetricsSnapshot {
        let global = self.global.read();
        MetricsSnapshot {
            total_requests: global.total_requests,
            requests_per_second: global.requests_per_second,
            active_connections: global.active_connections,
            uptime_seconds: self.uptime_secs(),
            tracked_ips: self.per_ip.read().len(),
            tracked_domains: self.per_domain.read().len(),
        }
    }

    /// Per-IP counters for one IP, if tracked
    pub fn ip_metrics(&self, ip: &str) -> Option<IpMetrics> {
        self.per_ip.read().get(ip).cloned()
    }

    /// Render the Prometheus text exposition
    ///
    /// Per-IP families are capped at the first 100 records.
    pub fn prometheus(&self) -> String {
        let mut output = String::new();
        let global = self.global.read();

        output.push_str("# HELP proxy_total_requests Total number of requests\n");
        output.push_str("# TYPE proxy_total_requests counter\n");
        output.push_str(&format!("proxy_total_requests {}\n", global.total_requests));

        output.push_str("# HELP proxy_requests_per_second Current requests per second\n");
        output.push_str("# TYPE proxy_requests_per_second gauge\n");
        output.push_str(&format!(
            "proxy_requests_per_second {:.2}\n",
            global.requests_per_second
        ));

        output.push_str("# HELP proxy_active_connections Current active connections\n");
        output.push_str("# TYPE proxy_active_connections gauge\n");
        output.push_str(&format!(
            "proxy_active_connections {}\n",
            global.active_connections
        ));

        output.push_str("# HELP proxy_uptime_seconds Uptime in seconds\n");
        output.push_str("# TYPE proxy_uptime_seconds gauge\n");
        output.push_str(&format!("proxy_uptime_seconds {}\n", self.uptime_secs()));
        drop(global);

        let per_domain = self.per_domain.read();
        if !per_domain.is_empty() {
            output.push_str("# HELP proxy_domain_requests_total Total requests per domain\n");
            output.push_str("# TYPE proxy_domain_requests_total counter\n");
            for (domain, metrics) in per_domain.iter() {
                output.push_str(&format!(
                    "proxy_domain_requests_total{{domain=\"{}\"}} {}\n",
                    domain, metrics.total_requests
                ));
            }

            output.push_str("# HELP proxy_domain_bypassed_total Total bypassed requests per domain\n");
            output.push_str("# TYPE proxy_domain_bypassed_total counter\n");
            for (domain, metrics) in per_domain.iter() {
                output.push_str(&format!(
                    "proxy_domain_bypassed_total{{domain=\"{}\"}} {}\n",
                    domain, metrics.bypassed_requests
                ));
            }

            output.push_str("# HELP proxy_domain_stage Current alert stage per domain\n");
            output.push_str("# TYPE proxy_domain_stage gauge\n");
            for (domain, metrics) in per_domain.iter() {
                output.push_str(&format!(
                    "proxy_domain_stage{{domain=\"{}\"}} {}\n",
                    domain, metrics.current_stage
                ));
            }

            output.push_str("# HELP proxy_domain_under_attack Whether the domain is under attack\n");
            output.push_str("# TYPE proxy_domain_under_attack gauge\n");
            for (domain, metrics) in per_domain.iter() {
                output.push_str(&format!(
                    "proxy_domain_under_attack{{domain=\"{}\"}} {}\n",
                    domain,
                    if metrics.under_attack { 1 } else { 0 }
                ));
            }
        }
        drop(per_domain);

        let per_ip = self.per_ip.read();
        if !per_ip.is_empty() {
            output.push_str("# HELP proxy_ip_total_requests Total requests per IP\n");
            output.push_str("# TYPE proxy_ip_total_requests counter\n");
            for (ip, metrics) in per_ip.iter().take(IP_EXPORT_CAP) {
                output.push_str(&format!(
                    "proxy_ip_total_requests{{ip=\"{}\"}} {}\n",
                    ip, metrics.total_requests
                ));
            }

            output.push_str("# HELP proxy_ip_reputation_score Reputation score per IP\n");
            output.push_str("# TYPE proxy_ip_reputation_score gauge\n");
            for (ip, metrics) in per_ip.iter().take(IP_EXPORT_CAP) {
                output.push_str(&format!(
                    "proxy_ip_reputation_score{{ip=\"{}\"}} {}\n",
                    ip, metrics.reputation_score
                ));
            }
        }

        output
    }

    /// Export the roll-ups as JSON
    pub fn json(&self) -> serde_json::Value {
        let global = self.global.read();
        let per_domain = self.per_domain.read();

        serde_json::json!({
            "global": {
                "total_requests": global.total_requests,
                "requests_per_second": global.requests_per_second,
                "active_connections": global.active_connections,
                "uptime_seconds": self.uptime_secs()
            },
            "domains": per_domain.iter().map(|(name, m)| {
                (name.clone(), serde_json::json!({
                    "total_requests": m.total_requests,
                    "bypassed_requests": m.bypassed_requests,
                    "requests_per_second": m.requests_per_second,
                    "stage": m.current_stage,
                    "under_attack": m.under_attack
                }))
            }).collect::<serde_json::Map<String, serde_json::Value>>(),
            "top_attacking_ips": self.top_attacking_ips(10).into_iter()
                .map(|(ip, blocked)| serde_json::json!({ "ip": ip, "blocked": blocked }))
                .collect::<Vec<_>>()
        })
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}
