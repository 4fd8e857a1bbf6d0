//! Admission Core Configuration
//!
//! Configuration for every admission subsystem: reputation scoring,
//! connection limits, adaptive rate limiting, challenge difficulty,
//! rate-limit windows, and geo/ASN filtering.
//!
//! The embedding proxy deserializes this from its own configuration
//! file and hands it to [`crate::AdmissionCore::new`]; all fields have
//! defaults so a partial document is valid.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the admission core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AdmissionConfig {
    /// Per-IP reputation scoring
    pub reputation: ReputationConfig,
    /// Per-IP connection caps
    pub connection_limits: ConnectionLimitsConfig,
    /// Adaptive rate-limit controller
    pub adaptive_rate_limit: AdaptiveConfig,
    /// Proof-of-work challenge difficulty
    pub challenge: ChallengeConfig,
    /// Multi-window rate accounting
    pub ratelimit_windows: WindowConfig,
    /// Geo/ASN filtering
    pub geo: GeoConfig,
}

/// Configuration for the reputation store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReputationConfig {
    /// Enable reputation scoring
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Scores strictly below this are blocked
    #[serde(default = "default_min_score")]
    pub min_score: i32,
    /// Persist records to the embedded database
    #[serde(default = "default_true")]
    pub persist_to_db: bool,
    /// Seconds between decay passes
    #[serde(default = "default_decay_interval")]
    pub decay_interval_secs: u64,
    /// Path of the embedded database file
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Days before an untouched default-score record is reaped
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_score: default_min_score(),
            persist_to_db: true,
            decay_interval_secs: default_decay_interval(),
            db_path: default_db_path(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_min_score() -> i32 {
    20
}

fn default_decay_interval() -> u64 {
    3600
}

fn default_db_path() -> String {
    "reputation.db".to_string()
}

fn default_retention_days() -> u64 {
    30
}

/// Configuration for the connection limiter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectionLimitsConfig {
    /// Maximum concurrent connections per IP
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_per_ip: u32,
    /// Maximum new connections per IP inside the rate window
    #[serde(default = "default_max_conn_rate")]
    pub max_connection_rate_per_ip: usize,
    /// Maximum half-open connections per IP
    #[serde(default = "default_max_half_open")]
    pub max_half_open_per_ip: u32,
    /// Track half-open connections (SYN flood protection)
    #[serde(default = "default_true")]
    pub enable_syn_flood_protection: bool,
    /// Width of the connection rate window in milliseconds
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
}

impl Default for ConnectionLimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_ip: default_max_concurrent(),
            max_connection_rate_per_ip: default_max_conn_rate(),
            max_half_open_per_ip: default_max_half_open(),
            enable_syn_flood_protection: true,
            rate_window_ms: default_rate_window_ms(),
        }
    }
}

fn default_max_concurrent() -> u32 {
    100
}

fn default_max_conn_rate() -> usize {
    10
}

fn default_max_half_open() -> u32 {
    20
}

fn default_rate_window_ms() -> u64 {
    1000
}

/// Configuration for the adaptive rate-limit controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AdaptiveConfig {
    /// Enable adaptive rate limiting
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Multiplier when no attack is in progress
    #[serde(default = "default_base_multiplier")]
    pub base_multiplier: f64,
    /// Floor multiplier under attack
    #[serde(default = "default_attack_multiplier")]
    pub attack_multiplier: f64,
    /// Fraction of the remaining gap recovered per tick
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
    /// Learn a trust-list of well-behaved IPs
    #[serde(default = "default_true")]
    pub learning_enabled: bool,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_multiplier: default_base_multiplier(),
            attack_multiplier: default_attack_multiplier(),
            decay_rate: default_decay_rate(),
            learning_enabled: true,
        }
    }
}

fn default_base_multiplier() -> f64 {
    1.0
}

fn default_attack_multiplier() -> f64 {
    0.3
}

fn default_decay_rate() -> f64 {
    0.1
}

/// Configuration for challenge difficulty
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChallengeConfig {
    /// Scale difficulty with reputation and attack intensity
    #[serde(default = "default_true")]
    pub dynamic_difficulty: bool,
    /// Lowest difficulty ever issued
    #[serde(default = "default_min_difficulty")]
    pub min_difficulty: u32,
    /// Highest difficulty ever issued
    #[serde(default = "default_max_difficulty")]
    pub max_difficulty: u32,
    /// Difficulty when a domain does not configure one
    #[serde(default = "default_base_difficulty")]
    pub base_difficulty: u32,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            dynamic_difficulty: true,
            min_difficulty: default_min_difficulty(),
            max_difficulty: default_max_difficulty(),
            base_difficulty: default_base_difficulty(),
        }
    }
}

fn default_min_difficulty() -> u32 {
    1
}

fn default_max_difficulty() -> u32 {
    10
}

fn default_base_difficulty() -> u32 {
    5
}

/// Window durations for multi-window rate accounting, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WindowConfig {
    #[serde(default = "default_burst_window")]
    pub burst: u64,
    #[serde(default = "default_short_window")]
    pub short: u64,
    #[serde(default = "default_medium_window")]
    pub medium: u64,
    #[serde(default = "default_long_window")]
    pub long: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            burst: default_burst_window(),
            short: default_short_window(),
            medium: default_medium_window(),
            long: default_long_window(),
        }
    }
}

fn default_burst_window() -> u64 {
    10
}

fn default_short_window() -> u64 {
    60
}

fn default_medium_window() -> u64 {
    300
}

fn default_long_window() -> u64 {
    3600
}

/// Country filter mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoFilterMode {
    /// Only listed countries are admitted
    Whitelist,
    /// Listed countries are rejected
    Blacklist,
}

/// Configuration for the geo/ASN resolver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GeoConfig {
    /// Enable geo/ASN filtering
    #[serde(default)]
    pub enabled: bool,
    /// Country filter mode
    #[serde(default = "default_geo_mode")]
    pub mode: GeoFilterMode,
    /// Country codes admitted in whitelist mode
    #[serde(default)]
    pub allowed: Vec<String>,
    /// Country codes rejected in blacklist mode
    #[serde(default)]
    pub blocked: Vec<String>,
    /// ASNs rejected regardless of country
    #[serde(default)]
    pub blocked_asn: Vec<u32>,
    /// Challenge (instead of admitting) IPs whose lookup failed
    #[serde(default)]
    pub challenge_unknown: bool,
    /// Lookup API base URL
    #[serde(default = "default_geo_endpoint")]
    pub endpoint: String,
    /// Cache lifetime in seconds
    #[serde(default = "default_geo_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: default_geo_mode(),
            allowed: Vec::new(),
            blocked: Vec::new(),
            blocked_asn: Vec::new(),
            challenge_unknown: false,
            endpoint: default_geo_endpoint(),
            cache_ttl_secs: default_geo_cache_ttl(),
        }
    }
}

fn default_geo_mode() -> GeoFilterMode {
    GeoFilterMode::Blacklist
}

fn default_geo_endpoint() -> String {
    "https://api.ipiz.net".to_string()
}

fn default_geo_cache_ttl() -> u64 {
    86400
}

fn default_true() -> bool {
    true
}
