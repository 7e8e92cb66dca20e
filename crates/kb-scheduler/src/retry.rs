//! Per-run bookkeeping for items that failed to ingest.
//!
//! A failed id is held back from fetches until its retry time so that a
//! chunk the embedder always rejects cannot occupy every batch. The delay
//! doubles with each attempt up to a cap. The ledger lives in memory: a
//! restart gives every failed item one fresh attempt.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct FailedAttempt {
    attempts: u32,
    retry_at: Instant,
}

/// Failed ids with attempt counts and retry times.
#[derive(Debug)]
pub struct RetryLedger {
    base: Duration,
    cap: Duration,
    entries: HashMap<String, FailedAttempt>,
}

impl RetryLedger {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            entries: HashMap::new(),
        }
    }

    /// Record a failure at `now`; returns the attempt count and the delay
    /// before the id is fetched again.
    pub fn record_failure(&mut self, id: &str, now: Instant) -> (u32, Duration) {
        let entry = self.entries.entry(id.to_string()).or_insert(FailedAttempt {
            attempts: 0,
            retry_at: now,
        });
        entry.attempts = entry.attempts.saturating_add(1);

        let factor = 2u32.saturating_pow(entry.attempts.saturating_sub(1).min(16));
        let delay = self.base.saturating_mul(factor).min(self.cap);
        entry.retry_at = now + delay;
        (entry.attempts, delay)
    }

    pub fn record_success(&mut self, id: &str) {
        self.entries.remove(id);
    }

    /// Ids still waiting for their retry time.
    pub fn deferred(&self, now: Instant) -> HashSet<String> {
        self.entries
            .iter()
            .filter(|(_, attempt)| attempt.retry_at > now)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn attempts(&self, id: &str) -> u32 {
        self.entries.get(id).map_or(0, |a| a.attempts)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
