//! Geo/ASN Resolution and Filtering
//!
//! Read-through cache over an external IP intelligence API. A lookup
//! that misses the cache issues a synchronous HTTPS GET; the policy
//! check layered on top blocks by ASN, then by country according to
//! the configured mode. Lookup failures fail open unless the
//! configuration asks for unknown IPs to be challenged.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{GeoConfig, GeoFilterMode};

/// Timeout for a single lookup request
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Document returned by the lookup API
///
/// Only `asn`, `country`, `country_code`, and `status` drive policy;
/// the rest rides along for consumers that want it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoRecord {
    #[serde(default)]
    pub asn: u32,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub continent_code: String,
    #[serde(default)]
    pub org_name: String,
}

struct CachedRecord {
    record: GeoRecord,
    cached_at: Instant,
}

/// Verdict from the geo policy check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeoVerdict {
    /// No policy objection
    Allow,
    /// Rejected by ASN or country policy
    Block { reason: String },
    /// Lookup failed and unknown IPs must solve a challenge
    Challenge,
}

impl GeoVerdict {
    pub fn is_block(&self) -> bool {
        matches!(self, GeoVerdict::Block { .. })
    }
}

/// Cached geo/ASN resolver with country and ASN policy
pub struct GeoResolver {
    config: GeoConfig,
    client: reqwest::Client,
    cache: RwLock<FxHashMap<String, CachedRecord>>,
}

impl GeoResolver {
    pub fn new(config: GeoConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            cache: RwLock::new(FxHashMap::default()),
        }
    }

    fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.config.cache_ttl_secs)
    }

    /// Resolve an IP, serving from cache when fresh
    ///
    /// Entries older than the TTL are refetched on access. Any
    /// transport error, non-200 response, or `status != "ok"` document
    /// is a lookup failure.
    pub async fn lookup(&self, ip: &str) -> Result<GeoRecord> {
        if !self.config.enabled {
            return Err(anyhow!("geo filtering is disabled"));
        }

        {
            let cache = self.cache.read();
            if let Some(cached) = cache.get(ip) {
                if cached.cached_at.elapsed() < self.cache_ttl() {
                    return Ok(cached.record.clone());
                }
            }
        }

        let url = format!("{}/{}", self.config.endpoint.trim_end_matches('/'), ip);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("geo lookup request failed for {ip}"))?;

        if !response.status().is_success() {
            return Err(anyhow!("geo api returned status {}", response.status()));
        }

        let record: GeoRecord = response
            .json()
            .await
            .with_context(|| format!("geo response decode failed for {ip}"))?;

        if record.status != "ok" {
            return Err(anyhow!("geo api returned error status {:?}", record.status));
        }

        debug!(ip, country = %record.country_code, asn = record.asn, "geo lookup");
        self.cache.write().insert(
            ip.to_string(),
            CachedRecord {
                record: record.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(record)
    }

    /// Apply ASN and country policy to an IP
    ///
    /// ASN blocks take precedence; country comparison is
    /// case-insensitive in both modes. A failed lookup yields
    /// [`GeoVerdict::Challenge`] when `challenge-unknown` is set and
    /// [`GeoVerdict::Allow`] otherwise.
    pub async fn check_filter(&self, ip: &str) -> GeoVerdict {
        if !self.config.enabled {
            return GeoVerdict::Allow;
        }

        let record = match self.lookup(ip).await {
            Ok(record) => record,
            Err(e) => {
                debug!(ip, error = %e, "geo lookup failed");
                if self.config.challenge_unknown {
                    return GeoVerdict::Challenge;
                }
                return GeoVerdict::Allow;
            }
        };

        self.apply_policy(&record)
    }

    fn apply_policy(&self, record: &GeoRecord) -> GeoVerdict {
        if self.config.blocked_asn.contains(&record.asn) {
            return GeoVerdict::Block {
                reason: format!("ASN {} is blocked", record.asn),
            };
        }

        match self.config.mode {
            GeoFilterMode::Whitelist => {
                let allowed = self
                    .config
                    .allowed
                    .iter()
                    .any(|c| c.eq_ignore_ascii_case(&record.country_code));
                if !allowed {
                    return GeoVerdict::Block {
                        reason: format!(
                            "country {} ({}) is not whitelisted",
                            record.country, record.country_code
                        ),
                    };
                }
            }
            GeoFilterMode::Blacklist => {
                let blocked = self
                    .config
                    .blocked
                    .iter()
                    .any(|c| c.eq_ignore_ascii_case(&record.country_code));
                if blocked {
                    return GeoVerdict::Block {
                        reason: format!(
                            "country {} ({}) is blocked",
                            record.country, record.country_code
                        ),
                    };
                }
            }
        }

        GeoVerdict::Allow
    }

    /// Cached country code for an IP, empty when unknown
    pub fn country_code(&self, ip: &str) -> String {
        self.cache
            .read()
            .get(ip)
            .map(|c| c.record.country_code.clone())
            .unwrap_or_default()
    }

    /// Cached ASN for an IP, zero when unknown
    pub fn asn(&self, ip: &str) -> u32 {
        self.cache.read().get(ip).map(|c| c.record.asn).unwrap_or(0)
    }

    /// Evict entries older than twice the TTL
    ///
    /// Entries between one and two TTLs are refetched on access;
    /// beyond two TTLs they are dropped outright.
    pub fn cleanup(&self) {
        let hard_limit = self.cache_ttl() * 2;
        let mut cache = self.cache.write();
        cache.retain(|_, cached| cached.cached_at.elapsed() <= hard_limit);
    }

    /// Number of cached records
    pub fn cached_records(&self) -> usize {
        self.cache.read().len()
    }

    #[cfg(test)]
    fn prime(&self, ip: &str, record: GeoRecord) {
        self.cache.write().insert(
            ip.to_string(),
            CachedRecord {
                record,
                cached_at: Instant::now(),
            },
        );
    }
}
