//! Per-IP Reputation Store
//!
//! Every source IP carries a score in [0, 100], starting at 50.
//! Misbehavior (failed challenges, rate-limit hits, fingerprint
//! mismatches) pulls the score down; clean traffic and a slow
//! background decay pull it back toward the default, so a wrongly
//! punished IP recovers automatically while a persistent offender
//! cannot wash its score by idling briefly.
//!
//! Records are optionally persisted to an embedded [`redb`] database
//! so judgments survive restarts. The in-memory map is authoritative
//! on the hot path; persistence failures are logged and swallowed.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::ReputationConfig;

const REPUTATION_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("reputation");

/// Score assigned to an IP never seen before
pub const DEFAULT_SCORE: i32 = 50;
/// Upper score bound
pub const MAX_SCORE: i32 = 100;
/// Lower score bound
pub const MIN_SCORE: i32 = 0;

/// Canonical delta for a failed challenge
pub const SCORE_CHALLENGE_FAILURE: i32 = -5;
/// Canonical delta for a rate-limit hit
pub const SCORE_RATE_LIMIT_HIT: i32 = -3;
/// Canonical delta for a fingerprint mismatch
pub const SCORE_FINGERPRINT_MISMATCH: i32 = -10;
/// Canonical delta for a successfully served request
pub const SCORE_SUCCESSFUL_ACCESS: i32 = 1;
/// Canonical delta for a 24-hour clean period
pub const SCORE_CLEAN_PERIOD: i32 = 10;

/// Why a score is being adjusted
///
/// The reason selects which per-event counter is incremented alongside
/// the score change; [`ScoreReason::Other`] adjusts the score and the
/// total-request counter only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreReason {
    ChallengeFailure,
    RateLimitHit,
    FingerprintMismatch,
    SuccessfulAccess,
    CleanPeriod,
    Other,
}

impl ScoreReason {
    /// The canonical delta for this reason
    pub fn default_delta(&self) -> i32 {
        match self {
            ScoreReason::ChallengeFailure => SCORE_CHALLENGE_FAILURE,
            ScoreReason::RateLimitHit => SCORE_RATE_LIMIT_HIT,
            ScoreReason::FingerprintMismatch => SCORE_FINGERPRINT_MISMATCH,
            ScoreReason::SuccessfulAccess => SCORE_SUCCESSFUL_ACCESS,
            ScoreReason::CleanPeriod => SCORE_CLEAN_PERIOD,
            ScoreReason::Other => 0,
        }
    }
}

/// Persisted reputation record for one IP
///
/// Timestamps are Unix epoch seconds. Unknown fields in a stored
/// record are tolerated on read and not written back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub ip: String,
    pub score: i32,
    pub last_updated: u64,
    pub last_decay: u64,
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub failed_challenges: u64,
    #[serde(default)]
    pub rate_limit_hits: u64,
}

impl ReputationRecord {
    fn new(ip: &str, now: u64) -> Self {
        Self {
            ip: ip.to_string(),
            score: DEFAULT_SCORE,
            last_updated: now,
            last_decay: now,
            total_requests: 0,
            failed_challenges: 0,
            rate_limit_hits: 0,
        }
    }
}

/// Score-change notification consumed by the metrics aggregator
#[derive(Debug, Clone)]
pub struct ScoreEvent {
    pub ip: String,
    pub score: i32,
}

/// Reputation store with optional embedded persistence
pub struct ReputationStore {
    config: ReputationConfig,
    records: RwLock<FxHashMap<String, ReputationRecord>>,
    db: Option<Database>,
    events: RwLock<Option<mpsc::Sender<ScoreEvent>>>,
}

impl ReputationStore {
    /// Open the store, loading persisted records when persistence is
    /// enabled
    ///
    /// With `persist-to-db` off this never touches the filesystem.
    pub fn open(config: ReputationConfig) -> Result<Self> {
        let db = if config.enabled && config.persist_to_db {
            let db = Database::create(&config.db_path)
                .with_context(|| format!("failed to open reputation db at {}", config.db_path))?;
            let tx = db.begin_write().context("failed to begin write txn")?;
            tx.open_table(REPUTATION_TABLE)
                .context("failed to create reputation table")?;
            tx.commit().context("failed to commit table creation")?;
            Some(db)
        } else {
            None
        };

        let store = Self {
            config,
            records: RwLock::new(FxHashMap::default()),
            db,
            events: RwLock::new(None),
        };
        store.load();
        Ok(store)
    }

    /// Attach the score-event channel drained by the metrics aggregator
    pub fn attach_events(&self, sender: mpsc::Sender<ScoreEvent>) {
        *self.events.write() = Some(sender);
    }

    /// Drain persisted records into memory
    ///
    /// A record that fails to decode is skipped: a corrupt entry must
    /// not fail startup.
    fn load(&self) {
        let Some(db) = &self.db else { return };

        let mut records = self.records.write();
        let tx = match db.begin_read() {
            Ok(tx) => tx,
            Err(e) => {
                warn!(error = %e, "failed to read reputation db, starting empty");
                return;
            }
        };
        let table = match tx.open_table(REPUTATION_TABLE) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to open reputation table, starting empty");
                return;
            }
        };
        let iter = match table.iter() {
            Ok(iter) => iter,
            Err(e) => {
                warn!(error = %e, "failed to scan reputation table, starting empty");
                return;
            }
        };

        let mut loaded = 0usize;
        let mut skipped = 0usize;
        for row in iter {
            let Ok((key, value)) = row else {
                skipped += 1;
                continue;
            };
            match serde_json::from_slice::<ReputationRecord>(value.value()) {
                Ok(record) => {
                    records.insert(key.value().to_string(), record);
                    loaded += 1;
                }
                Err(e) => {
                    debug!(ip = key.value(), error = %e, "skipping undecodable reputation record");
                    skipped += 1;
                }
            }
        }
        debug!(loaded, skipped, "loaded reputation records");
    }

    /// Write one record to the database, swallowing failures
    fn persist(&self, record: &ReputationRecord) {
        let Some(db) = &self.db else { return };

        let result = (|| -> Result<()> {
            let encoded = serde_json::to_vec(record)?;
            let tx = db.begin_write()?;
            {
                let mut table = tx.open_table(REPUTATION_TABLE)?;
                table.insert(record.ip.as_str(), encoded.as_slice())?;
            }
            tx.commit()?;
            Ok(())
        })();

        if let Err(e) = result {
            warn!(ip = %record.ip, error = %e, "failed to persist reputation record");
        }
    }

    /// Delete one record from the database, swallowing failures
    fn remove_persisted(&self, ip: &str) {
        let Some(db) = &self.db else { return };

        let result = (|| -> Result<()> {
            let tx = db.begin_write()?;
            {
                let mut table = tx.open_table(REPUTATION_TABLE)?;
                table.remove(ip)?;
            }
            tx.commit()?;
            Ok(())
        })();

        if let Err(e) = result {
            warn!(ip, error = %e, "failed to delete reputation record");
        }
    }

    fn publish(&self, ip: &str, score: i32) {
        if let Some(sender) = self.events.read().as_ref() {
            // A full channel drops the event; the aggregator catches up
            // from the next one.
            let _ = sender.try_send(ScoreEvent {
                ip: ip.to_string(),
                score,
            });
        }
    }

    /// Current score for an IP, the default for unknown IPs
    pub fn score(&self, ip: &str) -> i32 {
        if !self.config.enabled {
            return DEFAULT_SCORE;
        }
        self.records
            .read()
            .get(ip)
            .map(|r| r.score)
            .unwrap_or(DEFAULT_SCORE)
    }

    /// Whether an IP's score has fallen below the block threshold
    pub fn is_blocked(&self, ip: &str) -> bool {
        self.config.enabled && self.score(ip) < self.config.min_score
    }

    /// Adjust an IP's score by a signed delta
    ///
    /// Creates the record on first observation, clamps the result into
    /// [0, 100], bumps the per-event counter selected by `reason`, and
    /// persists the record before the write lock is released.
    pub fn update(&self, ip: &str, delta: i32, reason: ScoreReason) {
        if !self.config.enabled {
            return;
        }

        let now = unix_now();
        let mut records = self.records.write();
        let record = records
            .entry(ip.to_string())
            .or_insert_with(|| ReputationRecord::new(ip, now));

        record.score = (record.score + delta).clamp(MIN_SCORE, MAX_SCORE);
        record.last_updated = now;
        record.total_requests += 1;

        match reason {
            ScoreReason::ChallengeFailure => record.failed_challenges += 1,
            ScoreReason::RateLimitHit => record.rate_limit_hits += 1,
            _ => {}
        }

        let score = record.score;
        self.persist(record);
        drop(records);

        self.publish(ip, score);
    }

    /// One decay pass: move every stale score one unit toward the
    /// default
    ///
    /// A record is stale when its last decay is at least one decay
    /// interval old. Returns how many records changed.
    pub fn decay_tick(&self) -> usize {
        self.decay_tick_at(unix_now())
    }

    fn decay_tick_at(&self, now: u64) -> usize {
        if !self.config.enabled {
            return 0;
        }

        let interval = self.config.decay_interval_secs;
        let mut decayed = Vec::new();
        let mut records = self.records.write();
        for record in records.values_mut() {
            if now.saturating_sub(record.last_decay) < interval {
                continue;
            }
            record.last_decay = now;
            if record.score == DEFAULT_SCORE {
                continue;
            }
            if record.score < DEFAULT_SCORE {
                record.score += 1;
            } else {
                record.score -= 1;
            }
            self.persist(record);
            decayed.push((record.ip.clone(), record.score));
        }
        drop(records);

        for (ip, score) in &decayed {
            self.publish(ip, *score);
        }
        decayed.len()
    }

    /// Drop records that are older than `days_old` days and sitting at
    /// the default score
    ///
    /// Records away from the default are kept regardless of age so
    /// durable judgments survive. Returns how many were removed.
    pub fn cleanup(&self, days_old: u64) -> usize {
        let cutoff = unix_now().saturating_sub(days_old * 86_400);
        let mut removed = Vec::new();

        let mut records = self.records.write();
        records.retain(|ip, record| {
            let stale = record.last_updated < cutoff && record.score == DEFAULT_SCORE;
            if stale {
                removed.push(ip.clone());
            }
            !stale
        });
        for ip in &removed {
            self.remove_persisted(ip);
        }
        drop(records);

        if !removed.is_empty() {
            debug!(removed = removed.len(), "cleaned up stale reputation records");
        }
        removed.len()
    }

    /// Number of records currently tracked
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().len() == 0
    }

    /// Final synchronization pass before the store is dropped
    ///
    /// Updates are persisted as they happen, so this only rewrites the
    /// full map as a safety net against a database file that was
    /// swapped out from under a running instance.
    pub fn close(&self) {
        if self.db.is_none() {
            return;
        }
        let records = self.records.read();
        for record in records.values() {
            self.persist(record);
        }
        debug!(records = records.len(), "reputation store closed");
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
