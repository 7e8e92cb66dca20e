//! Resource monitoring.
//!
//! Samples CPU, memory and process metrics into a rolling history. The
//! history drives batch sizing, leak detection and emergency cleanup.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::reclaim::{reclaim_all, ReclaimReport, Reclaimable};

/// One point-in-time reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Global CPU usage, 0-100
    pub cpu_percent: f32,
    /// System memory in use, 0-100
    pub memory_percent: f32,
    /// Resident set size of this process in bytes
    pub rss_bytes: u64,
    /// Thread count of this process, where the platform reports it
    pub threads: Option<usize>,
    /// Open file descriptors of this process, where the platform reports it
    pub open_files: Option<usize>,
    pub timestamp: DateTime<Utc>,
}

impl ResourceSnapshot {
    pub fn new(cpu_percent: f32, memory_percent: f32, rss_bytes: u64) -> Self {
        Self {
            cpu_percent,
            memory_percent,
            rss_bytes,
            threads: None,
            open_files: None,
            timestamp: Utc::now(),
        }
    }
}

/// Source of resource readings.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceSnapshot;
}

/// Sampler backed by the `sysinfo` crate.
pub struct SysinfoSampler {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| warn!(error = %e, "Cannot determine own pid, process metrics disabled"))
            .ok();
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

fn count_open_files() -> Option<usize> {
    std::fs::read_dir("/proc/self/fd")
        .ok()
        .map(|entries| entries.count())
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&self) -> ResourceSnapshot {
        let mut sys = self.system.lock().expect("sysinfo mutex poisoned");
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let total = sys.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            (sys.used_memory() as f64 / total as f64 * 100.0) as f32
        };

        let mut snapshot = ResourceSnapshot::new(sys.global_cpu_usage(), memory_percent, 0);
        if let Some(pid) = self.pid {
            sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            if let Some(process) = sys.process(pid) {
                snapshot.rss_bytes = process.memory();
                snapshot.threads = process.tasks().map(|tasks| tasks.len().max(1));
            }
        }
        snapshot.open_files = count_open_files();
        snapshot
    }
}

/// How to process the next batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    SingleItem,
    Batch,
}

/// Result of [`ResourceMonitor::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadDecision {
    pub mode: ProcessingMode,
    pub batch_size: usize,
    /// True when load forced the single-item mode
    pub limited: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTrend {
    /// Fewer than four samples
    Insufficient,
    Stable,
    Increasing,
    Decreasing,
}

/// Result of [`ResourceMonitor::detect_leak`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeakReport {
    pub leak: bool,
    pub trend: MemoryTrend,
    /// RSS growth from the first half of history to the second, in percent
    pub growth_percent: f64,
}

const MIN_LEAK_SAMPLES: usize = 4;

fn mean_rss<'a>(items: impl Iterator<Item = &'a ResourceSnapshot>) -> f64 {
    let (sum, n) = items.fold((0.0f64, 0usize), |(sum, n), snap| {
        (sum + snap.rss_bytes as f64, n + 1)
    });
    sum / n.max(1) as f64
}

/// Rolling resource history with load classification and cleanup.
pub struct ResourceMonitor {
    config: MonitorConfig,
    sampler: Box<dyn ResourceSampler>,
    history: Mutex<VecDeque<ResourceSnapshot>>,
    last_cleanup: Mutex<Option<Instant>>,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig, sampler: Box<dyn ResourceSampler>) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(config.history_size.max(1))),
            config,
            sampler,
            last_cleanup: Mutex::new(None),
        }
    }

    /// Monitor using [`SysinfoSampler`].
    pub fn with_sysinfo(config: MonitorConfig) -> Self {
        Self::new(config, Box::new(SysinfoSampler::new()))
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Take a reading and append it to the history.
    pub fn sample_now(&self) -> ResourceSnapshot {
        let snapshot = self.sampler.sample();
        self.record(snapshot.clone());
        snapshot
    }

    pub fn record(&self, snapshot: ResourceSnapshot) {
        let mut history = self.history.lock().expect("history mutex poisoned");
        history.push_back(snapshot);
        while history.len() > self.config.history_size.max(1) {
            history.pop_front();
        }
    }

    pub fn history(&self) -> Vec<ResourceSnapshot> {
        self.history
            .lock()
            .expect("history mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn latest(&self) -> Option<ResourceSnapshot> {
        self.history
            .lock()
            .expect("history mutex poisoned")
            .back()
            .cloned()
    }

    /// Batch size for the current load.
    pub fn classify(&self, snapshot: &ResourceSnapshot) -> LoadDecision {
        let high = self.config.high_load_percent;
        if snapshot.cpu_percent > high || snapshot.memory_percent > high {
            return LoadDecision {
                mode: ProcessingMode::SingleItem,
                batch_size: 1,
                limited: true,
            };
        }

        let max_batch = self.config.max_batch.max(1);
        let cpu_free = 1.0 - f64::from(snapshot.cpu_percent.clamp(0.0, 100.0)) / 100.0;
        let mem_free = 1.0 - f64::from(snapshot.memory_percent.clamp(0.0, 100.0)) / 100.0;
        let batch = (max_batch as f64 * cpu_free.min(mem_free)).round() as usize;

        LoadDecision {
            mode: ProcessingMode::Batch,
            batch_size: batch.clamp(1, max_batch),
            limited: false,
        }
    }

    /// Compare mean RSS of the older and newer halves of the history.
    pub fn detect_leak(&self) -> LeakReport {
        let history = self.history.lock().expect("history mutex poisoned");
        if history.len() < MIN_LEAK_SAMPLES {
            return LeakReport {
                leak: false,
                trend: MemoryTrend::Insufficient,
                growth_percent: 0.0,
            };
        }

        let mid = history.len() / 2;
        let first = mean_rss(history.iter().take(mid));
        let second = mean_rss(history.iter().skip(mid));

        let growth_percent = if first > 0.0 {
            (second - first) / first * 100.0
        } else {
            0.0
        };

        let threshold = self.config.leak_threshold_percent;
        let trend = if growth_percent > threshold {
            MemoryTrend::Increasing
        } else if growth_percent < -threshold {
            MemoryTrend::Decreasing
        } else {
            MemoryTrend::Stable
        };

        LeakReport {
            leak: growth_percent > threshold * 2.0,
            trend,
            growth_percent,
        }
    }

    /// Memory above the critical threshold or a leak trend.
    pub fn is_critical(&self, snapshot: &ResourceSnapshot) -> bool {
        snapshot.memory_percent > self.config.critical_memory_percent || self.detect_leak().leak
    }

    /// Time left before another emergency cleanup is allowed.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let last = *self.last_cleanup.lock().expect("cleanup mutex poisoned");
        let elapsed = last?.elapsed();
        self.config.cleanup_cooldown().checked_sub(elapsed)
    }

    /// Run every reclaimer unless a cleanup ran within the cooldown.
    pub fn emergency_cleanup<R>(&self, reclaimers: &[R]) -> Option<ReclaimReport>
    where
        R: AsRef<dyn Reclaimable>,
    {
        {
            let mut last = self.last_cleanup.lock().expect("cleanup mutex poisoned");
            if let Some(at) = *last {
                if at.elapsed() < self.config.cleanup_cooldown() {
                    debug!(
                        since_secs = at.elapsed().as_secs(),
                        "Emergency cleanup skipped, cooling down"
                    );
                    return None;
                }
            }
            *last = Some(Instant::now());
        }

        warn!(reclaimers = reclaimers.len(), "Running emergency memory cleanup");
        let report = reclaim_all(reclaimers);

        // Older readings no longer describe the process after a cleanup
        self.history.lock().expect("history mutex poisoned").clear();
        Some(report)
    }

    /// Sample on a fixed period until cancelled.
    pub async fn run_sampler(self: Arc<Self>, token: CancellationToken) {
        let period = self.config.sample_interval();
        info!(interval_secs = period.as_secs(), "Resource sampler started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(period) => {
                    let snapshot = self.sample_now();
                    debug!(
                        cpu = snapshot.cpu_percent,
                        memory = snapshot.memory_percent,
                        rss = snapshot.rss_bytes,
                        "Resource sample"
                    );
                }
            }
        }
        info!("Resource sampler stopped");
    }
}
