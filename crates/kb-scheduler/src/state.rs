//! Scheduler state machine.
//!
//! Pure transitions with no I/O, driven by the loop in `scheduler.rs`.
//!
//! ```text
//! Active --idle--> Backoff --N idle--> DeepSleep --work/notify--> Active
//!   any --force_deep_sleep--> ManualDeepSleep --exit_deep_sleep--> Active
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;

/// Externally visible phase, derived from [`SchedulerState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    Active,
    Backoff,
    DeepSleep,
    ManualDeepSleep,
    Stopped,
}

impl SchedulerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerPhase::Active => "active",
            SchedulerPhase::Backoff => "backoff",
            SchedulerPhase::DeepSleep => "deep_sleep",
            SchedulerPhase::ManualDeepSleep => "manual_deep_sleep",
            SchedulerPhase::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for SchedulerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an idle cycle did to the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleTransition {
    /// Interval grew (or stayed at the cap)
    Backoff,
    /// Threshold reached on this cycle; run a memory-reduction pass
    EnteredDeepSleep,
    /// Already sleeping
    StillDeepSleep,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub running: bool,
    #[serde(with = "duration_secs")]
    pub sleep_interval: Duration,
    pub consecutive_idle_cycles: u32,
    pub in_deep_sleep: bool,
    pub manual_override: bool,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs_f64(f64::deserialize(d)?.max(0.0)))
    }
}

impl SchedulerState {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            running: false,
            sleep_interval: config.base_interval(),
            consecutive_idle_cycles: 0,
            in_deep_sleep: false,
            manual_override: false,
        }
    }

    pub fn phase(&self) -> SchedulerPhase {
        if !self.running {
            SchedulerPhase::Stopped
        } else if self.manual_override {
            SchedulerPhase::ManualDeepSleep
        } else if self.in_deep_sleep {
            SchedulerPhase::DeepSleep
        } else if self.consecutive_idle_cycles > 0 {
            SchedulerPhase::Backoff
        } else {
            SchedulerPhase::Active
        }
    }

    /// No work this cycle.
    pub fn on_idle(&mut self, config: &SchedulerConfig) -> IdleTransition {
        self.consecutive_idle_cycles = self.consecutive_idle_cycles.saturating_add(1);

        if self.in_deep_sleep {
            self.sleep_interval = config.deep_sleep_interval();
            return IdleTransition::StillDeepSleep;
        }

        if self.consecutive_idle_cycles >= config.idle_cycles_before_deep_sleep {
            self.in_deep_sleep = true;
            self.sleep_interval = config.deep_sleep_interval();
            return IdleTransition::EnteredDeepSleep;
        }

        let grown = self.sleep_interval.as_secs_f64() * config.backoff_multiplier;
        self.sleep_interval = Duration::from_secs_f64(grown).min(config.max_interval());
        IdleTransition::Backoff
    }

    /// Work found. Returns true if this woke the loop from deep sleep.
    pub fn on_work(&mut self, config: &SchedulerConfig) -> bool {
        let woke = self.in_deep_sleep;
        self.consecutive_idle_cycles = 0;
        self.in_deep_sleep = false;
        self.sleep_interval = config.base_interval();
        woke
    }

    /// New work was announced; leave automatic deep sleep. Manual sleep holds.
    pub fn wake(&mut self, config: &SchedulerConfig) {
        if !self.manual_override {
            self.on_work(config);
        }
    }

    pub fn enter_manual_deep_sleep(&mut self, config: &SchedulerConfig) {
        self.manual_override = true;
        self.sleep_interval = config.manual_cleanup_interval();
    }

    pub fn exit_manual_deep_sleep(&mut self, config: &SchedulerConfig) {
        self.manual_override = false;
        self.on_work(config);
    }
}
