//! Engine configuration.
//!
//! Every option has a safe default and every numeric option is clamped into
//! a sane range by [`EngineConfig::clamped`]. Out-of-range values are never
//! fatal: each adjustment is logged at `warn` level and the engine carries on
//! with the nearest valid value.
//!
//! Durations are written in humantime notation when loaded from a document:
//!
//! ```
//! use cellbox::EngineConfig;
//!
//! let config = EngineConfig::from_json(r#"{
//!     "kinds": { "heightmap": { "ttl": "2m", "max_entries": 8192 } },
//!     "batch": { "flush_delay": "25ms" },
//!     "store": { "max_bytes": 67108864, "insert_grace": "1s" }
//! }"#)?;
//!
//! assert_eq!(config.kind_policy(&"heightmap".into()).max_entries, 8192);
//! # Ok::<(), cellbox::ConfigError>(())
//! ```

use std::collections::HashMap;
use std::time::Duration;

use cellbox_backend::ArtifactFormat;
use cellbox_core::Kind;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

/// Hard upper bound for any concurrency setting.
pub const MAX_CONCURRENCY: usize = 255;

/// Per-kind cache policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindPolicy {
    /// How long a `Ready` artifact stays fresh.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Maximum entries this kind may hold in the in-memory tier.
    pub max_entries: usize,
    /// Byte estimate per entry, used by the budget ledger.
    pub approx_bytes: usize,
}

impl Default for KindPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 4096,
            approx_bytes: 64 * 1024,
        }
    }
}

impl KindPolicy {
    fn clamped(mut self, kind: &str) -> Self {
        self.ttl = clamp_duration(
            &format!("kinds.{kind}.ttl"),
            self.ttl,
            Duration::from_millis(1),
            Duration::from_secs(7 * 24 * 3600),
        );
        self.max_entries = clamp_usize(
            &format!("kinds.{kind}.max_entries"),
            self.max_entries,
            1,
            usize::MAX,
        );
        self.approx_bytes = clamp_usize(
            &format!("kinds.{kind}.approx_bytes"),
            self.approx_bytes,
            1,
            usize::MAX,
        );
        self
    }
}

/// Coalescing memoization cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoConfig {
    /// How long a failed key waits before it may be retried.
    #[serde(with = "humantime_serde")]
    pub failure_backoff: Duration,
    /// Run a prune pass every this many successful puts.
    pub prune_every: u64,
    /// Maximum entries examined by one prune pass.
    pub prune_batch: usize,
}

impl Default for MemoConfig {
    fn default() -> Self {
        Self {
            failure_backoff: Duration::from_secs(5),
            prune_every: 256,
            prune_batch: 512,
        }
    }
}

/// Adaptive concurrency limiter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Lowest limit auto-tuning may choose.
    pub floor: usize,
    /// Highest limit auto-tuning may choose. `None` means available
    /// parallelism.
    pub ceiling: Option<usize>,
    /// Fixed limit bypassing auto-tuning entirely.
    pub override_limit: Option<usize>,
    /// Minimum time between two retunes.
    #[serde(with = "humantime_serde")]
    pub retune_cooldown: Duration,
    /// Smoothed step duration at which the limit drops to the floor.
    pub load_high_ms: f64,
    /// Smoothed step duration at which the limit is capped at
    /// `elevated_cap`.
    pub load_elevated_ms: f64,
    /// Limit while the host is under elevated load.
    pub elevated_cap: usize,
    /// Weight of each new sample in the producer-duration average.
    pub duration_decay: f64,
    /// Average producer duration considered slow.
    pub slow_work_ms: f64,
    /// Average producer duration considered moderate.
    pub moderate_work_ms: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            floor: 1,
            ceiling: None,
            override_limit: None,
            retune_cooldown: Duration::from_millis(250),
            load_high_ms: 50.0,
            load_elevated_ms: 40.0,
            elevated_cap: 2,
            duration_decay: 0.125,
            slow_work_ms: 50.0,
            moderate_work_ms: 20.0,
        }
    }
}

impl LimiterConfig {
    /// Ceiling after resolving `None` against `hard_ceiling`.
    ///
    /// A floor above `hard_ceiling` is pulled down to it.
    pub fn resolved_ceiling(&self, hard_ceiling: usize) -> usize {
        let hard = hard_ceiling.max(1);
        let floor = self.floor.max(1);
        if floor > hard {
            warn!(floor, hard_ceiling = hard, "limiter floor above available parallelism");
        }
        self.ceiling.unwrap_or(hard).clamp(floor.min(hard), hard)
    }

    fn clamped(mut self) -> Self {
        self.floor = clamp_usize("limiter.floor", self.floor, 1, MAX_CONCURRENCY);
        self.ceiling = self
            .ceiling
            .map(|c| clamp_usize("limiter.ceiling", c, self.floor, MAX_CONCURRENCY));
        self.override_limit = self
            .override_limit
            .map(|o| clamp_usize("limiter.override_limit", o, 1, MAX_CONCURRENCY));
        self.retune_cooldown = clamp_duration(
            "limiter.retune_cooldown",
            self.retune_cooldown,
            Duration::ZERO,
            Duration::from_secs(60),
        );
        self.load_high_ms = clamp_f64("limiter.load_high_ms", self.load_high_ms, 0.0, 10_000.0);
        self.load_elevated_ms = clamp_f64(
            "limiter.load_elevated_ms",
            self.load_elevated_ms,
            0.0,
            self.load_high_ms,
        );
        self.elevated_cap =
            clamp_usize("limiter.elevated_cap", self.elevated_cap, 1, MAX_CONCURRENCY);
        self.duration_decay =
            clamp_f64("limiter.duration_decay", self.duration_decay, 0.001, 1.0);
        self.slow_work_ms = clamp_f64("limiter.slow_work_ms", self.slow_work_ms, 0.0, 60_000.0);
        self.moderate_work_ms = clamp_f64(
            "limiter.moderate_work_ms",
            self.moderate_work_ms,
            0.0,
            self.slow_work_ms,
        );
        self
    }
}

/// Batch dispatch queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Flush threshold under host pressure.
    pub min_threshold: usize,
    /// Flush threshold for an idle host.
    pub max_threshold: usize,
    /// Upper bound on how long a pending item waits for a deferred flush.
    #[serde(with = "humantime_serde")]
    pub flush_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_threshold: 4,
            max_threshold: 64,
            flush_delay: Duration::from_millis(40),
        }
    }
}

impl BatchConfig {
    fn clamped(mut self) -> Self {
        self.min_threshold = clamp_usize("batch.min_threshold", self.min_threshold, 1, 4096);
        self.max_threshold = clamp_usize(
            "batch.max_threshold",
            self.max_threshold,
            self.min_threshold,
            4096,
        );
        self.flush_delay = clamp_duration(
            "batch.flush_delay",
            self.flush_delay,
            Duration::from_millis(1),
            Duration::from_secs(5),
        );
        self
    }
}

/// Tiered artifact store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Nominal in-memory byte budget.
    pub max_bytes: usize,
    /// Entries read within this window are immune to capacity eviction.
    #[serde(with = "humantime_serde")]
    pub access_grace: Duration,
    /// Entries inserted within this window are immune to capacity eviction.
    #[serde(with = "humantime_serde")]
    pub insert_grace: Duration,
    /// Fraction of the budget above which aggressive cleanup runs.
    pub aggressive_ratio: f64,
    /// Maximum entries removed by one aggressive cleanup pass.
    pub aggressive_batch: usize,
    /// Memory pressure above which emergency eviction runs.
    pub emergency_ratio: f64,
    /// Fraction of unprotected entries removed by emergency eviction.
    pub emergency_fraction: f64,
    /// Minimum time between two emergency evictions.
    #[serde(with = "humantime_serde")]
    pub emergency_cooldown: Duration,
    /// Budget multiplier while the host is under elevated load.
    pub pressure_elevated_factor: f64,
    /// Budget multiplier while the host is under high load.
    pub pressure_high_factor: f64,
    /// Concurrent persistent-tier operations.
    pub io_concurrency: usize,
    /// Time-to-live of persisted entries.
    #[serde(with = "humantime_serde")]
    pub disk_ttl: Duration,
    /// Encoding of persisted artifacts.
    pub format: ArtifactFormat,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            access_grace: Duration::from_secs(10),
            insert_grace: Duration::from_secs(3),
            aggressive_ratio: 0.6,
            aggressive_batch: 50,
            emergency_ratio: 0.85,
            emergency_fraction: 0.75,
            emergency_cooldown: Duration::from_secs(30),
            pressure_elevated_factor: 0.7,
            pressure_high_factor: 0.5,
            io_concurrency: 2,
            disk_ttl: Duration::from_secs(3600),
            format: ArtifactFormat::default(),
        }
    }
}

impl StoreConfig {
    fn clamped(mut self) -> Self {
        self.max_bytes = clamp_usize("store.max_bytes", self.max_bytes, 1024, usize::MAX);
        self.access_grace = clamp_duration(
            "store.access_grace",
            self.access_grace,
            Duration::ZERO,
            Duration::from_secs(3600),
        );
        self.insert_grace = clamp_duration(
            "store.insert_grace",
            self.insert_grace,
            Duration::ZERO,
            Duration::from_secs(3600),
        );
        self.aggressive_ratio =
            clamp_f64("store.aggressive_ratio", self.aggressive_ratio, 0.05, 1.0);
        self.aggressive_batch =
            clamp_usize("store.aggressive_batch", self.aggressive_batch, 1, 100_000);
        self.emergency_ratio = clamp_f64("store.emergency_ratio", self.emergency_ratio, 0.1, 1.0);
        self.emergency_fraction =
            clamp_f64("store.emergency_fraction", self.emergency_fraction, 0.0, 1.0);
        self.emergency_cooldown = clamp_duration(
            "store.emergency_cooldown",
            self.emergency_cooldown,
            Duration::ZERO,
            Duration::from_secs(3600),
        );
        self.pressure_elevated_factor = clamp_f64(
            "store.pressure_elevated_factor",
            self.pressure_elevated_factor,
            0.05,
            1.0,
        );
        self.pressure_high_factor = clamp_f64(
            "store.pressure_high_factor",
            self.pressure_high_factor,
            0.05,
            self.pressure_elevated_factor,
        );
        self.io_concurrency = clamp_usize("store.io_concurrency", self.io_concurrency, 1, 64);
        self.disk_ttl = clamp_duration(
            "store.disk_ttl",
            self.disk_ttl,
            Duration::from_secs(1),
            Duration::from_secs(365 * 24 * 3600),
        );
        self
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-kind policies.
    pub kinds: HashMap<Kind, KindPolicy>,
    /// Policy for kinds not listed in `kinds`.
    pub default_kind: KindPolicy,
    /// Memoization cache settings.
    pub memo: MemoConfig,
    /// Concurrency limiter settings.
    pub limiter: LimiterConfig,
    /// Batch queue settings.
    pub batch: BatchConfig,
    /// Tiered store settings.
    pub store: StoreConfig,
}

impl EngineConfig {
    /// Creates a new builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Parses a JSON document and clamps it.
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(document)?;
        Ok(config.clamped())
    }

    /// Policy for `kind`, falling back to `default_kind`.
    pub fn kind_policy(&self, kind: &Kind) -> &KindPolicy {
        self.kinds.get(kind).unwrap_or(&self.default_kind)
    }

    /// Pulls every option back into its valid range.
    pub fn clamped(self) -> Self {
        Self {
            kinds: self
                .kinds
                .into_iter()
                .map(|(kind, policy)| {
                    let policy = policy.clamped(kind.as_str());
                    (kind, policy)
                })
                .collect(),
            default_kind: self.default_kind.clamped("default"),
            memo: MemoConfig {
                failure_backoff: clamp_duration(
                    "memo.failure_backoff",
                    self.memo.failure_backoff,
                    Duration::from_millis(1),
                    Duration::from_secs(3600),
                ),
                prune_every: self.memo.prune_every.max(1),
                prune_batch: clamp_usize("memo.prune_batch", self.memo.prune_batch, 1, 1_000_000),
            },
            limiter: self.limiter.clamped(),
            batch: self.batch.clamped(),
            store: self.store.clamped(),
        }
    }
}

/// Builder for [`EngineConfig`] covering the common knobs.
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Sets the policy of one kind.
    pub fn kind(mut self, kind: impl Into<Kind>, policy: KindPolicy) -> Self {
        self.config.kinds.insert(kind.into(), policy);
        self
    }

    /// Sets the policy for unlisted kinds.
    pub fn default_kind(mut self, policy: KindPolicy) -> Self {
        self.config.default_kind = policy;
        self
    }

    /// Sets the backoff after a producer failure.
    pub fn failure_backoff(mut self, backoff: Duration) -> Self {
        self.config.memo.failure_backoff = backoff;
        self
    }

    /// Sets the limiter settings.
    pub fn limiter(mut self, limiter: LimiterConfig) -> Self {
        self.config.limiter = limiter;
        self
    }

    /// Fixes the concurrency limit, bypassing auto-tuning.
    pub fn concurrency_override(mut self, limit: usize) -> Self {
        self.config.limiter.override_limit = Some(limit);
        self
    }

    /// Sets the batch settings.
    pub fn batch(mut self, batch: BatchConfig) -> Self {
        self.config.batch = batch;
        self
    }

    /// Sets the store settings.
    pub fn store(mut self, store: StoreConfig) -> Self {
        self.config.store = store;
        self
    }

    /// Builds the clamped configuration.
    pub fn build(self) -> EngineConfig {
        self.config.clamped()
    }
}

fn clamp_usize(name: &str, value: usize, min: usize, max: usize) -> usize {
    let clamped = value.clamp(min, max.max(min));
    if clamped != value {
        warn!(option = name, value, clamped, "configuration value out of range");
    }
    clamped
}

fn clamp_f64(name: &str, value: f64, min: f64, max: f64) -> f64 {
    let clamped = if value.is_nan() {
        min
    } else {
        value.clamp(min, max.max(min))
    };
    if clamped != value {
        warn!(option = name, value, clamped, "configuration value out of range");
    }
    clamped
}

fn clamp_duration(name: &str, value: Duration, min: Duration, max: Duration) -> Duration {
    let clamped = value.clamp(min, max.max(min));
    if clamped != value {
        warn!(
            option = name,
            value = ?value,
            clamped = ?clamped,
            "configuration value out of range"
        );
    }
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_already_in_range() {
        assert_eq!(EngineConfig::default().clamped(), EngineConfig::default());
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let config = EngineConfig::from_json(
            r#"{
                "limiter": { "floor": 0, "override_limit": 9000, "duration_decay": 4.0 },
                "batch": { "min_threshold": 10, "max_threshold": 2, "flush_delay": "0ms" },
                "store": { "aggressive_ratio": -1.0, "max_bytes": 3 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.limiter.floor, 1);
        assert_eq!(config.limiter.override_limit, Some(MAX_CONCURRENCY));
        assert_eq!(config.limiter.duration_decay, 1.0);
        assert_eq!(config.batch.min_threshold, 10);
        assert_eq!(config.batch.max_threshold, 10);
        assert_eq!(config.batch.flush_delay, Duration::from_millis(1));
        assert_eq!(config.store.aggressive_ratio, 0.05);
        assert_eq!(config.store.max_bytes, 1024);
    }

    #[test]
    fn unknown_kinds_use_default_policy() {
        let config = EngineConfig::builder()
            .kind(
                "noise",
                KindPolicy {
                    ttl: Duration::from_secs(1),
                    ..KindPolicy::default()
                },
            )
            .build();

        assert_eq!(config.kind_policy(&"noise".into()).ttl, Duration::from_secs(1));
        assert_eq!(config.kind_policy(&"other".into()), &KindPolicy::default());
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(EngineConfig::from_json("{ \"batch\": 3 }").is_err());
    }

    #[test]
    fn ceiling_resolves_against_parallelism() {
        let limiter = LimiterConfig::default();
        assert_eq!(limiter.resolved_ceiling(8), 8);

        let limiter = LimiterConfig {
            ceiling: Some(32),
            ..LimiterConfig::default()
        };
        assert_eq!(limiter.resolved_ceiling(8), 8);
    }

    #[test]
    fn floor_above_parallelism_is_pulled_down() {
        let limiter = LimiterConfig {
            floor: 8,
            ..LimiterConfig::default()
        }
        .clamped();
        assert_eq!(limiter.floor, 8);
        assert_eq!(limiter.resolved_ceiling(4), 4);

        let limiter = LimiterConfig {
            floor: 8,
            ceiling: Some(16),
            ..LimiterConfig::default()
        };
        assert_eq!(limiter.resolved_ceiling(2), 2);
    }

    #[test]
    fn clamping_twice_changes_nothing() {
        let config = EngineConfig::from_json(
            r#"{ "memo": { "prune_every": 0 }, "limiter": { "floor": 300 } }"#,
        )
        .unwrap();
        assert_eq!(config.memo.prune_every, 1);
        assert_eq!(config.clone().clamped(), config);
    }
}
