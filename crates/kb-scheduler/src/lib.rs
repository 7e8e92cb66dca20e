//! Incremental ingestion scheduler.
//!
//! A single tokio task pulls unprocessed work items from a [`WorkSource`],
//! embeds them and adds them to the shared index. Between cycles it sleeps
//! for an interval chosen by a small state machine:
//!
//! - **Active**: work was found on the last cycle, base interval
//! - **Backoff**: no work, interval grows geometrically up to a cap
//! - **DeepSleep**: sustained idleness, fixed long interval, memory released
//! - **ManualDeepSleep**: operator-requested, no processing until released
//!
//! Batch size follows current CPU and memory load ([`ResourceMonitor`]), and
//! a critical memory condition or a leak trend triggers an emergency cleanup
//! through every registered [`Reclaimable`].
//!
//! # Example
//!
//! ```ignore
//! use kb_scheduler::{IngestionScheduler, SchedulerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let scheduler = Arc::new(IngestionScheduler::new(config, deps));
//! let token = CancellationToken::new();
//! let handle = tokio::spawn(scheduler.clone().run(token.clone()));
//!
//! scheduler.force_deep_sleep();
//! token.cancel();
//! handle.await??;
//! ```

mod config;
mod error;
mod monitor;
mod reclaim;
mod retry;
mod scheduler;
mod source;
mod state;

pub use config::{MonitorConfig, SchedulerConfig, ShardSpec};
pub use error::SchedulerError;
pub use monitor::{
    LeakReport, LoadDecision, MemoryTrend, ProcessingMode, ResourceMonitor, ResourceSampler,
    ResourceSnapshot, SysinfoSampler,
};
pub use reclaim::{reclaim_all, IndexUnloader, ReclaimReport, Reclaimable};
pub use scheduler::{
    CycleOutcome, CycleReport, IngestionScheduler, SchedulerDeps, SchedulerStatus,
};
pub use source::{FetchRequest, InMemoryWorkSource, JsonlWorkSource, WorkItem, WorkSource};
pub use state::{IdleTransition, SchedulerPhase, SchedulerState};
