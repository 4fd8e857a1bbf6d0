//! Adaptive Rate-Limit Controller
//!
//! Two jobs: keep a per-domain multiplier that scales effective rate
//! limits with observed attack intensity, and learn a trust-list of
//! IPs whose behavior is consistently good.
//!
//! The multiplier drops multiplicatively the moment an attack is
//! flagged and recovers additively toward 1.0 once it clears, so a
//! probing attacker cannot ratchet the limits back up quickly.

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::AdaptiveConfig;

/// How long a learned entry counts as trusted after it was last seen
const TRUST_HORIZON: Duration = Duration::from_secs(24 * 3600);
/// Entries unseen for this long are evicted
const TRUST_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
/// Observations required before the demotion rule applies
const TRUST_MIN_REQUESTS: u64 = 10;
/// Success rate below which a measured entry is demoted
const TRUST_DEMOTE_RATE: f64 = 0.5;

/// Learning state for one IP
#[derive(Debug, Clone)]
struct TrustEntry {
    added_at: Instant,
    request_count: u64,
    success_rate: f64,
    last_seen: Instant,
}

/// Adaptive multiplier and trust-list controller
pub struct AdaptiveController {
    config: AdaptiveConfig,
    multipliers: RwLock<FxHashMap<String, f64>>,
    trust: RwLock<FxHashMap<String, TrustEntry>>,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self {
            config,
            multipliers: RwLock::new(FxHashMap::default()),
            trust: RwLock::new(FxHashMap::default()),
        }
    }

    /// Current multiplier for a domain, the base for unknown domains
    pub fn multiplier(&self, domain: &str) -> f64 {
        if !self.config.enabled {
            return self.config.base_multiplier;
        }
        self.multipliers
            .read()
            .get(domain)
            .copied()
            .unwrap_or(self.config.base_multiplier)
    }

    /// Retune one domain's multiplier against its attack flags
    ///
    /// A bypass attack collapses the multiplier toward the attack
    /// floor; a raw attack reduces it more moderately; with no attack
    /// in progress the multiplier recovers a fixed fraction of the
    /// remaining gap to the base per call.
    pub fn update_multiplier(&self, domain: &str, raw_attack: bool, bypass_attack: bool) {
        if !self.config.enabled {
            return;
        }

        let base = self.config.base_multiplier;
        let floor = self.config.attack_multiplier;

        let mut multipliers = self.multipliers.write();
        let current = multipliers.get(domain).copied().unwrap_or(base);

        let next = if bypass_attack {
            (current * floor).max(floor)
        } else if raw_attack {
            (current * 0.7).max(floor * 1.5)
        } else if current < base {
            (current + (base - current) * self.config.decay_rate).min(base)
        } else {
            current
        };

        multipliers.insert(domain.to_string(), next);
    }

    /// Effective rate limit for a domain given its configured base
    ///
    /// Never falls below `base × attack-multiplier` so a domain keeps a
    /// usable floor even at full attack response.
    pub fn adaptive_limit(&self, base_limit: u32, domain: &str) -> u32 {
        if !self.config.enabled {
            return base_limit;
        }

        let scaled = base_limit as f64 * self.multiplier(domain);
        let floor = base_limit as f64 * self.config.attack_multiplier;
        scaled.max(floor) as u32
    }

    /// Whether an IP is on the learned trust-list
    ///
    /// An entry counts only while it has been seen within the last
    /// 24 hours.
    pub fn is_trusted(&self, ip: &str) -> bool {
        if !self.config.learning_enabled {
            return false;
        }
        self.trust
            .read()
            .get(ip)
            .map(|entry| entry.last_seen.elapsed() <= TRUST_HORIZON)
            .unwrap_or(false)
    }

    /// Feed one request outcome into trust learning
    ///
    /// The success rate is the unbiased incremental mean of outcomes.
    /// Once an IP has ten observations, a rate below 0.5 deletes the
    /// entry; it starts from scratch if the IP reappears.
    pub fn learn(&self, ip: &str, success: bool) {
        if !self.config.learning_enabled {
            return;
        }

        let now = Instant::now();
        let mut trust = self.trust.write();
        let entry = trust.entry(ip.to_string()).or_insert_with(|| TrustEntry {
            added_at: now,
            request_count: 0,
            success_rate: 0.0,
            last_seen: now,
        });

        entry.request_count += 1;
        entry.last_seen = now;

        let n = entry.request_count as f64;
        let outcome = if success { 1.0 } else { 0.0 };
        entry.success_rate = entry.success_rate * (n - 1.0) / n + outcome / n;

        if entry.request_count >= TRUST_MIN_REQUESTS && entry.success_rate < TRUST_DEMOTE_RATE {
            trust.remove(ip);
        }
    }

    /// Evict trust entries unseen for the retention period
    pub fn cleanup_trust(&self) {
        let mut trust = self.trust.write();
        trust.retain(|_, entry| entry.last_seen.elapsed() <= TRUST_RETENTION);
    }

    /// Number of IPs currently in learning
    pub fn trust_entries(&self) -> usize {
        self.trust.read().len()
    }

    /// How long an IP has been in learning, if it is
    pub fn trust_age(&self, ip: &str) -> Option<Duration> {
        self.trust.read().get(ip).map(|e| e.added_at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> AdaptiveController {
        AdaptiveController::new(AdaptiveConfig::default())
    }

    #[test]
    fn test_unknown_domain_at_base() {
        let controller = controller();
        assert_eq!(controller.multiplier("example.com"), 1.0);
        assert_eq!(controller.adaptive_limit(100, "example.com"), 100);
    }

    #[test]
    fn test_bypass_attack_collapses_multiplier() {
        let controller = controller();
        controller.update_multiplier("example.com", false, true);
        assert!((controller.multiplier("example.com") - 0.3).abs() < 1e-9);

        // Repeated bypass ticks stay pinned at the floor
        controller.update_multiplier("example.com", false, true);
        assert!((controller.multiplier("example.com") - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_raw_attack_moderate_reduction() {
        let controller = controller();
        controller.update_multiplier("example.com", true, false);
        assert!((controller.multiplier("example.com") - 0.7).abs() < 1e-9);

        // Further ticks bottom out at 1.5x the attack floor
        for _ in 0..10 {
            controller.update_multiplier("example.com", true, false);
        }
        assert!((controller.multiplier("example.com") - 0.45).abs() < 1e-9);
    }

    #[test]
    fn test_recovery_toward_base() {
        let controller = controller();
        controller.update_multiplier("example.com", false, true);
        assert!((controller.multiplier("example.com") - 0.3).abs() < 1e-9);

        for _ in 0..10 {
            controller.update_multiplier("example.com", false, false);
        }
        // m = 0.3 + 0.7 * (1 - 0.9^10) ≈ 0.756
        let m = controller.multiplier("example.com");
        assert!(m > 0.74 && m < 0.78, "multiplier {} outside expected band", m);

        for _ in 0..200 {
            controller.update_multiplier("example.com", false, false);
        }
        assert!(controller.multiplier("example.com") <= 1.0);
        assert!(controller.multiplier("example.com") > 0.999);
    }

    #[test]
    fn test_adaptive_limit_floor() {
        let controller = controller();
        controller.update_multiplier("example.com", false, true);
        // 100 * 0.3 scaled equals the floor exactly
        assert_eq!(controller.adaptive_limit(100, "example.com"), 30);
        // The floor holds regardless of how low the multiplier goes
        assert!(controller.adaptive_limit(10, "example.com") >= 3);
    }

    #[test]
    fn test_trust_requires_observation() {
        let controller = controller();
        assert!(!controller.is_trusted("1.2.3.4"));

        controller.learn("1.2.3.4", true);
        assert!(controller.is_trusted("1.2.3.4"));
        assert_eq!(controller.trust_entries(), 1);
    }

    #[test]
    fn test_success_rate_incremental_mean() {
        let controller = controller();
        for _ in 0..3 {
            controller.learn("1.2.3.4", true);
        }
        controller.learn("1.2.3.4", false);

        let trust = controller.trust.read();
        let entry = trust.get("1.2.3.4").unwrap();
        assert_eq!(entry.request_count, 4);
        assert!((entry.success_rate - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_demotion_after_threshold() {
        let controller = controller();
        // 10 successes establish trust
        for _ in 0..10 {
            controller.learn("1.2.3.4", true);
        }
        assert!(controller.is_trusted("1.2.3.4"));

        // Failures drag the rate down; entry survives until it crosses 0.5
        for _ in 0..11 {
            controller.learn("1.2.3.4", false);
        }
        assert!(!controller.is_trusted("1.2.3.4"));
        assert_eq!(controller.trust_entries(), 0);
    }

    #[test]
    fn test_no_demotion_before_min_requests() {
        let controller = controller();
        // All failures, but below the observation threshold
        for _ in 0..9 {
            controller.learn("1.2.3.4", false);
        }
        assert_eq!(controller.trust_entries(), 1);

        // The tenth observation triggers the rule
        controller.learn("1.2.3.4", false);
        assert_eq!(controller.trust_entries(), 0);
    }

    #[test]
    fn test_retrust_after_demotion() {
        let controller = controller();
        for _ in 0..10 {
            controller.learn("1.2.3.4", false);
        }
        assert_eq!(controller.trust_entries(), 0);

        // Fresh entry starts from scratch
        controller.learn("1.2.3.4", true);
        assert!(controller.is_trusted("1.2.3.4"));
        let trust = controller.trust.read();
        assert_eq!(trust.get("1.2.3.4").unwrap().request_count, 1);
    }

    #[test]
    fn test_learning_disabled() {
        let controller = AdaptiveController::new(AdaptiveConfig {
            learning_enabled: false,
            ..Default::default()
        });
        controller.learn("1.2.3.4", true);
        assert!(!controller.is_trusted("1.2.3.4"));
        assert_eq!(controller.trust_entries(), 0);
    }

    #[test]
    fn test_disabled_controller_passes_base() {
        let controller = AdaptiveController::new(AdaptiveConfig {
            enabled: false,
            ..Default::default()
        });
        controller.update_multiplier("example.com", false, true);
        assert_eq!(controller.multiplier("example.com"), 1.0);
        assert_eq!(controller.adaptive_limit(100, "example.com"), 100);
    }
}
