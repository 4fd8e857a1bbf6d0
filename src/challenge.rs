//! Dynamic Challenge Difficulty
//!
//! Composes reputation, attack state, and alert stage into the
//! proof-of-work difficulty issued to a (source, domain) pair. The
//! computation is pure: read-locked lookups, signed adjustments, one
//! clamp.

use std::sync::Arc;

use crate::config::ChallengeConfig;
use crate::reputation::ReputationStore;
use crate::telemetry::TelemetrySource;

/// Difficulty calculator over reputation and domain telemetry
pub struct DifficultyController {
    config: ChallengeConfig,
    reputation: Arc<ReputationStore>,
    telemetry: Arc<dyn TelemetrySource>,
}

impl DifficultyController {
    pub fn new(
        config: ChallengeConfig,
        reputation: Arc<ReputationStore>,
        telemetry: Arc<dyn TelemetrySource>,
    ) -> Self {
        Self {
            config,
            reputation,
            telemetry,
        }
    }

    /// Effective difficulty for a request
    ///
    /// Starts from the domain's configured stage-2 difficulty (the
    /// global base when unset), applies the reputation, attack, and
    /// stage adjustments, and clamps into the configured range. With
    /// dynamic difficulty off, or for an unknown domain, the base is
    /// returned unmodified.
    pub fn difficulty(&self, ip: &str, domain: &str) -> u32 {
        let Some(telemetry) = self.telemetry.telemetry(domain) else {
            return self.config.base_difficulty;
        };

        let base = if telemetry.stage2_difficulty == 0 {
            self.config.base_difficulty
        } else {
            telemetry.stage2_difficulty
        };

        if !self.config.dynamic_difficulty {
            return base;
        }

        let score = self.reputation.score(ip);
        let reputation_adjustment = if score < 30 {
            3
        } else if score < 50 {
            2
        } else if score < 70 {
            1
        } else if score >= 90 {
            -1
        } else {
            0
        };

        let attack_adjustment = if telemetry.bypass_attack {
            2
        } else if telemetry.raw_attack {
            1
        } else {
            0
        };

        let stage_adjustment = match telemetry.stage {
            3 => 1,
            2 => 0,
            _ => -1,
        };

        let difficulty =
            base as i64 + reputation_adjustment + attack_adjustment + stage_adjustment;
        difficulty.clamp(
            self.config.min_difficulty as i64,
            self.config.max_difficulty as i64,
        ) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReputationConfig;
    use crate::reputation::ScoreReason;
    use crate::telemetry::{DomainTelemetry, StaticTelemetry};

    fn harness() -> (Arc<ReputationStore>, Arc<StaticTelemetry>, DifficultyController) {
        let reputation = Arc::new(
            ReputationStore::open(ReputationConfig {
                persist_to_db: false,
                ..Default::default()
            })
            .unwrap(),
        );
        let telemetry = StaticTelemetry::new();
        let controller = DifficultyController::new(
            ChallengeConfig::default(),
            Arc::clone(&reputation),
            telemetry.clone(),
        );
        (reputation, telemetry, controller)
    }

    #[test]
    fn test_unknown_domain_gets_base() {
        let (_, _, controller) = harness();
        assert_eq!(controller.difficulty("1.2.3.4", "nowhere.test"), 5);
    }

    #[test]
    fn test_relaxed_stage_eases_difficulty() {
        let (_, telemetry, controller) = harness();
        telemetry.set(
            "example.com",
            DomainTelemetry {
                stage: 1,
                stage2_difficulty: 5,
                ..Default::default()
            },
        );
        // Default score 50 adds +1, stage 1 subtracts 1: 5 + 1 - 1 = 5.
        // A well-reputed IP goes one lower.
        assert_eq!(controller.difficulty("1.2.3.4", "example.com"), 5);
    }

    #[test]
    fn test_fresh_ip_stage_one_no_attack() {
        let (reputation, telemetry, controller) = harness();
        telemetry.set(
            "example.com",
            DomainTelemetry {
                stage: 1,
                stage2_difficulty: 5,
                ..Default::default()
            },
        );
        // Push the score into the neutral band
        reputation.update("1.2.3.4", 25, ScoreReason::Other);
        assert_eq!(controller.difficulty("1.2.3.4", "example.com"), 4);
    }

    #[test]
    fn test_bad_reputation_under_attack_clamps_high() {
        let (reputation, telemetry, controller) = harness();
        telemetry.set(
            "example.com",
            DomainTelemetry {
                stage: 3,
                bypass_attack: true,
                stage2_difficulty: 5,
                ..Default::default()
            },
        );
        reputation.update("1.2.3.4", -25, ScoreReason::Other);
        // 5 + 3 (score 25) + 2 (bypass) + 1 (stage 3) = 11, clamped to 10
        assert_eq!(controller.difficulty("1.2.3.4", "example.com"), 10);
    }

    #[test]
    fn test_good_reputation_eases() {
        let (reputation, telemetry, controller) = harness();
        telemetry.set(
            "example.com",
            DomainTelemetry {
                stage: 2,
                stage2_difficulty: 5,
                ..Default::default()
            },
        );
        reputation.update("1.2.3.4", 45, ScoreReason::Other);
        // score 95: 5 - 1 = 4
        assert_eq!(controller.difficulty("1.2.3.4", "example.com"), 4);
    }

    #[test]
    fn test_clamps_low() {
        let (reputation, telemetry, controller) = harness();
        telemetry.set(
            "example.com",
            DomainTelemetry {
                stage: 1,
                stage2_difficulty: 1,
                ..Default::default()
            },
        );
        reputation.update("1.2.3.4", 45, ScoreReason::Other);
        // 1 - 1 (score) - 1 (stage) = -1, clamped to the minimum
        assert_eq!(controller.difficulty("1.2.3.4", "example.com"), 1);
    }

    #[test]
    fn test_domain_difficulty_overrides_base() {
        let (_, telemetry, controller) = harness();
        telemetry.set(
            "hard.example.com",
            DomainTelemetry {
                stage: 2,
                stage2_difficulty: 8,
                ..Default::default()
            },
        );
        // Default score 50 adds +1: 8 + 1 = 9
        assert_eq!(controller.difficulty("1.2.3.4", "hard.example.com"), 9);
    }

    #[test]
    fn test_static_difficulty_when_disabled() {
        let (reputation, telemetry, _) = harness();
        let controller = DifficultyController::new(
            ChallengeConfig {
                dynamic_difficulty: false,
                ..Default::default()
            },
            reputation,
            telemetry.clone(),
        );
        telemetry.set(
            "example.com",
            DomainTelemetry {
                stage: 3,
                bypass_attack: true,
                stage2_difficulty: 7,
                ..Default::default()
            },
        );
        assert_eq!(controller.difficulty("1.2.3.4", "example.com"), 7);
    }
}
