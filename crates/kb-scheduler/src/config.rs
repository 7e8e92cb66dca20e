//! Scheduler and monitor configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Configuration for the ingestion loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Sleep between cycles while work keeps arriving
    #[serde(default = "default_base_interval")]
    pub base_interval_secs: u64,

    /// Growth factor of the sleep interval per idle cycle
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Cap on the backoff interval
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,

    /// Consecutive idle cycles before deep sleep
    #[serde(default = "default_idle_cycles")]
    pub idle_cycles_before_deep_sleep: u32,

    /// Fixed interval while in deep sleep
    #[serde(default = "default_deep_sleep_interval")]
    pub deep_sleep_interval_secs: u64,

    /// Cleanup cadence while in manual deep sleep
    #[serde(default = "default_manual_cleanup_interval")]
    pub manual_cleanup_interval_secs: u64,

    /// Upper bound on items fetched per cycle
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Persist the index after this many successes within a batch
    #[serde(default = "default_save_every")]
    pub save_every: usize,

    /// Timeout for one embedding call
    #[serde(default = "default_embed_timeout")]
    pub embed_timeout_secs: u64,

    /// First delay before an item that failed to ingest is fetched again;
    /// doubles per attempt up to the deep sleep interval
    #[serde(default = "default_failed_retry")]
    pub failed_retry_secs: u64,

    /// Attempts against the work source per cycle (first try included)
    #[serde(default = "default_upstream_retries")]
    pub upstream_max_attempts: u32,

    /// First backoff delay between work source attempts
    #[serde(default = "default_upstream_backoff_ms")]
    pub upstream_initial_backoff_ms: u64,

    /// Stop ingesting once this fraction of the source is processed
    #[serde(default)]
    pub target_completion: Option<f64>,

    /// Claim only part of the id space
    #[serde(default)]
    pub shard: Option<ShardSpec>,
}

fn default_base_interval() -> u64 {
    30
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_interval() -> u64 {
    600
}

fn default_idle_cycles() -> u32 {
    5
}

fn default_deep_sleep_interval() -> u64 {
    3600
}

fn default_manual_cleanup_interval() -> u64 {
    900
}

fn default_max_batch_size() -> usize {
    50
}

fn default_save_every() -> usize {
    25
}

fn default_embed_timeout() -> u64 {
    30
}

fn default_failed_retry() -> u64 {
    300
}

fn default_upstream_retries() -> u32 {
    3
}

fn default_upstream_backoff_ms() -> u64 {
    500
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: default_base_interval(),
            backoff_multiplier: default_backoff_multiplier(),
            max_interval_secs: default_max_interval(),
            idle_cycles_before_deep_sleep: default_idle_cycles(),
            deep_sleep_interval_secs: default_deep_sleep_interval(),
            manual_cleanup_interval_secs: default_manual_cleanup_interval(),
            max_batch_size: default_max_batch_size(),
            save_every: default_save_every(),
            embed_timeout_secs: default_embed_timeout(),
            failed_retry_secs: default_failed_retry(),
            upstream_max_attempts: default_upstream_retries(),
            upstream_initial_backoff_ms: default_upstream_backoff_ms(),
            target_completion: None,
            shard: None,
        }
    }
}

impl SchedulerConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_secs(self.base_interval_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs.max(self.base_interval_secs))
    }

    pub fn deep_sleep_interval(&self) -> Duration {
        Duration::from_secs(self.deep_sleep_interval_secs)
    }

    pub fn manual_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.manual_cleanup_interval_secs)
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs.max(1))
    }

    pub fn failed_retry_interval(&self) -> Duration {
        Duration::from_secs(self.failed_retry_secs)
    }

    pub fn upstream_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.upstream_initial_backoff_ms)
    }

    /// Reject values the loop cannot run with.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.backoff_multiplier < 1.0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.idle_cycles_before_deep_sleep == 0 {
            return Err(SchedulerError::InvalidConfig(
                "idle_cycles_before_deep_sleep must be > 0".to_string(),
            ));
        }
        if self.max_batch_size == 0 || self.save_every == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_batch_size and save_every must be > 0".to_string(),
            ));
        }
        if let Some(target) = self.target_completion {
            if !(0.0..=1.0).contains(&target) {
                return Err(SchedulerError::InvalidConfig(format!(
                    "target_completion must be within [0, 1], got {}",
                    target
                )));
            }
        }
        if let Some(shard) = &self.shard {
            shard.validate()?;
        }
        Ok(())
    }
}

/// Disjoint slice of the upstream id space for one of `count` processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSpec {
    pub index: u32,
    pub count: u32,
}

impl ShardSpec {
    pub fn new(index: u32, count: u32) -> Result<Self, SchedulerError> {
        let shard = Self { index, count };
        shard.validate()?;
        Ok(shard)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.count == 0 || self.index >= self.count {
            return Err(SchedulerError::InvalidConfig(format!(
                "shard {}/{} is out of range",
                self.index, self.count
            )));
        }
        Ok(())
    }

    /// Stable assignment by FNV-1a hash of the upstream id.
    pub fn owns(&self, chunk_id: &str) -> bool {
        if self.count <= 1 {
            return true;
        }
        (fnv1a(chunk_id) % u64::from(self.count)) == u64::from(self.index)
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in s.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Configuration for the resource monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// CPU or memory percentage above which only one item is processed
    #[serde(default = "default_high_load")]
    pub high_load_percent: f32,

    /// System memory percentage that triggers emergency cleanup
    #[serde(default = "default_critical_memory")]
    pub critical_memory_percent: f32,

    /// Largest batch under no load
    #[serde(default = "default_max_batch_size")]
    pub max_batch: usize,

    /// Rolling history length
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// RSS growth percentage between history halves that counts as increasing
    #[serde(default = "default_leak_threshold")]
    pub leak_threshold_percent: f64,

    /// Minimum seconds between emergency cleanups (never below 300)
    #[serde(default = "default_cleanup_cooldown")]
    pub cleanup_cooldown_secs: u64,

    /// Background sampling period
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,
}

fn default_high_load() -> f32 {
    85.0
}

fn default_critical_memory() -> f32 {
    92.0
}

fn default_history_size() -> usize {
    15
}

fn default_leak_threshold() -> f64 {
    10.0
}

fn default_cleanup_cooldown() -> u64 {
    300
}

fn default_sample_interval() -> u64 {
    60
}

const MIN_CLEANUP_COOLDOWN_SECS: u64 = 300;

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            high_load_percent: default_high_load(),
            critical_memory_percent: default_critical_memory(),
            max_batch: default_max_batch_size(),
            history_size: default_history_size(),
            leak_threshold_percent: default_leak_threshold(),
            cleanup_cooldown_secs: default_cleanup_cooldown(),
            sample_interval_secs: default_sample_interval(),
        }
    }
}

impl MonitorConfig {
    pub fn cleanup_cooldown(&self) -> Duration {
        Duration::from_secs(self.cleanup_cooldown_secs.max(MIN_CLEANUP_COOLDOWN_SECS))
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs.max(1))
    }
}
