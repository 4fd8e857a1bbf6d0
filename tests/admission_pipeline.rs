//! Integration tests for the admission pipeline.
//!
//! Exercises the composed core end to end: cold sources, connection
//! storms, attack-driven challenges, adaptive recovery, and the
//! reputation persistence round-trip through a real database file.

use std::sync::Arc;

use palisade_admission::config::ReputationConfig;
use palisade_admission::{
    AdmissionConfig, AdmissionCore, AdmissionDecision, DenyReason, DomainTelemetry,
    ReputationStore, ScoreReason, StaticTelemetry, TelemetrySource, WindowKind,
};
use tempfile::tempdir;

fn memory_config() -> AdmissionConfig {
    AdmissionConfig {
        reputation: ReputationConfig {
            persist_to_db: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn quiet_domain() -> DomainTelemetry {
    DomainTelemetry {
        stage: 1,
        stage2_difficulty: 5,
        base_rate_limit: 1000,
        ..Default::default()
    }
}

#[tokio::test]
async fn cold_ip_passes_and_is_credited() {
    let telemetry = StaticTelemetry::new();
    telemetry.set("example.com", quiet_domain());
    let core = AdmissionCore::new(memory_config(), telemetry).unwrap();

    assert_eq!(core.reputation.score("198.51.100.7"), 50);
    assert!(core.connections.check_limit("198.51.100.7"));

    let decision = core.evaluate("198.51.100.7", "example.com").await;
    assert_eq!(decision, AdmissionDecision::Allow);

    assert_eq!(core.windows.count("198.51.100.7", WindowKind::Burst), 1);
    assert_eq!(core.reputation.score("198.51.100.7"), 51);
    assert_eq!(
        core.metrics.ip_metrics("198.51.100.7").unwrap().total_requests,
        1
    );
}

#[tokio::test]
async fn connection_storm_is_rejected_and_debited() {
    let telemetry = StaticTelemetry::new();
    telemetry.set("example.com", quiet_domain());
    let core = AdmissionCore::new(memory_config(), telemetry).unwrap();

    // Eleven connections inside one rate window
    for _ in 0..11 {
        core.connections.increment_connection("203.0.113.9");
    }
    assert!(!core.connections.check_limit("203.0.113.9"));

    let decision = core.evaluate("203.0.113.9", "example.com").await;
    assert_eq!(
        decision,
        AdmissionDecision::Deny {
            reason: DenyReason::ConnectionLimit
        }
    );

    assert_eq!(core.reputation.score("203.0.113.9"), 47);
    let ip = core.metrics.ip_metrics("203.0.113.9").unwrap();
    assert_eq!(ip.rate_limit_hits, 1);
}

#[tokio::test]
async fn attack_with_bad_reputation_maxes_difficulty() {
    let telemetry = StaticTelemetry::new();
    telemetry.set(
        "example.com",
        DomainTelemetry {
            stage: 3,
            bypass_attack: true,
            stage2_difficulty: 5,
            ..Default::default()
        },
    );
    let core = AdmissionCore::new(memory_config(), telemetry).unwrap();
    core.reputation.update("5.5.5.5", -25, ScoreReason::Other);

    match core.evaluate("5.5.5.5", "example.com").await {
        AdmissionDecision::Challenge { difficulty } => {
            // 5 + 3 (score 25) + 2 (bypass) + 1 (stage 3), clamped to 10
            assert_eq!(difficulty, 10);
        }
        other => panic!("expected challenge, got {:?}", other),
    }
}

#[tokio::test]
async fn repeated_failures_escalate_to_reputation_block() {
    let telemetry = StaticTelemetry::new();
    telemetry.set("example.com", quiet_domain());
    let core = AdmissionCore::new(memory_config(), telemetry).unwrap();

    // Seven failed challenges drop 50 to 15, below the default threshold
    for _ in 0..7 {
        core.report_challenge_result("6.6.6.6", false);
    }
    assert!(core.reputation.is_blocked("6.6.6.6"));

    let decision = core.evaluate("6.6.6.6", "example.com").await;
    assert_eq!(
        decision,
        AdmissionDecision::Deny {
            reason: DenyReason::Reputation
        }
    );
}

#[tokio::test]
async fn adaptive_multiplier_recovers_after_attack() {
    let telemetry = StaticTelemetry::new();
    telemetry.set("example.com", quiet_domain());
    let core = AdmissionCore::new(memory_config(), telemetry).unwrap();

    core.adaptive.update_multiplier("example.com", false, true);
    assert!((core.adaptive.multiplier("example.com") - 0.3).abs() < 1e-9);

    for _ in 0..10 {
        core.adaptive.update_multiplier("example.com", false, false);
    }
    let m = core.adaptive.multiplier("example.com");
    assert!(m > 0.74 && m < 0.78, "multiplier {} outside recovery band", m);

    // Effective limits scale with the multiplier but keep the floor
    let limit = core.adaptive.adaptive_limit(1000, "example.com");
    assert!(limit >= 300 && limit < 1000);
}

#[tokio::test]
async fn trust_is_earned_lost_and_relearned() {
    let telemetry = StaticTelemetry::new();
    telemetry.set(
        "example.com",
        DomainTelemetry {
            stage: 2,
            ..Default::default()
        },
    );
    let core = AdmissionCore::new(memory_config(), telemetry).unwrap();

    // Ten clean requests earn trust; stage 2 then no longer challenges
    for _ in 0..10 {
        core.adaptive.learn("7.7.7.7", true);
    }
    assert!(core.adaptive.is_trusted("7.7.7.7"));
    assert!(core.evaluate("7.7.7.7", "example.com").await.is_allow());

    // The allowed request above was also learned, so the entry holds
    // eleven successes; twelve failures push the rate below 0.5
    for _ in 0..12 {
        core.adaptive.learn("7.7.7.7", false);
    }
    assert!(!core.adaptive.is_trusted("7.7.7.7"));
    assert!(matches!(
        core.evaluate("7.7.7.7", "example.com").await,
        AdmissionDecision::Challenge { .. }
    ));
}

#[tokio::test]
async fn background_tasks_start_and_stop() {
    let telemetry = StaticTelemetry::new();
    telemetry.set("example.com", quiet_domain());
    let core = AdmissionCore::new(memory_config(), telemetry).unwrap();

    core.start();
    let decision = core.evaluate("1.2.3.4", "example.com").await;
    assert!(decision.is_allow());
    core.shutdown().await;
}

#[test]
fn reputation_survives_reopen() {
    let dir = tempdir().unwrap();
    let db_path = dir
        .path()
        .join("reputation.db")
        .to_string_lossy()
        .into_owned();
    let config = ReputationConfig {
        db_path: db_path.clone(),
        ..Default::default()
    };

    {
        let store = ReputationStore::open(config.clone()).unwrap();
        store.update("1.1.1.1", -20, ScoreReason::RateLimitHit);
        store.update("2.2.2.2", 30, ScoreReason::Other);
        store.update("3.3.3.3", -5, ScoreReason::ChallengeFailure);
        store.close();
    }

    let reopened = ReputationStore::open(config).unwrap();
    assert_eq!(reopened.len(), 3);
    assert_eq!(reopened.score("1.1.1.1"), 30);
    assert_eq!(reopened.score("2.2.2.2"), 80);
    assert_eq!(reopened.score("3.3.3.3"), 45);
}

#[tokio::test]
async fn metrics_reflect_pipeline_traffic() {
    let telemetry = StaticTelemetry::new();
    telemetry.set(
        "example.com",
        DomainTelemetry {
            stage: 1,
            base_rate_limit: 1000,
            total_requests: 12,
            requests_per_second: 0.5,
            ..Default::default()
        },
    );
    let core = AdmissionCore::new(memory_config(), Arc::<StaticTelemetry>::clone(&telemetry)).unwrap();

    core.evaluate("9.9.9.9", "example.com").await;
    core.evaluate("9.9.9.9", "example.com").await;

    // Simulate the 10-second pull
    let tel = telemetry.telemetry("example.com").unwrap();
    core.metrics.update_domain("example.com", &tel);
    core.metrics.update_global(core.connections.tracked_ips() as u64);

    let text = core.metrics.prometheus();
    assert!(text.contains("proxy_total_requests 12"));
    assert!(text.contains("proxy_domain_requests_total{domain=\"example.com\"} 12"));
    assert!(text.contains("proxy_ip_total_requests{ip=\"9.9.9.9\"} 2"));

    let snapshot = core.metrics.snapshot();
    assert_eq!(snapshot.tracked_domains, 1);
    assert_eq!(snapshot.tracked_ips, 1);
}
