//! Persisted ingestion progress.
//!
//! Written next to the index snapshot so a restarted process resumes its
//! counters and can tell how close it is to a completion target.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::IndexingError;

pub const PROGRESS_FILE: &str = "progress.json";

/// Counters for items taken from the work source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestProgress {
    /// Items embedded and indexed
    pub processed_count: u64,

    /// Items that failed and were skipped
    pub failed_count: u64,

    /// Upstream id of the most recent success
    pub last_chunk_id: Option<String>,

    /// Timestamp of last processing (milliseconds since epoch for JSON compatibility)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_processed_time: DateTime<Utc>,

    /// When this record was first created (milliseconds since epoch)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl Default for IngestProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestProgress {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            processed_count: 0,
            failed_count: 0,
            last_chunk_id: None,
            last_processed_time: now,
            created_at: now,
        }
    }

    pub fn record_success(&mut self, chunk_id: impl Into<String>) {
        self.processed_count += 1;
        self.last_chunk_id = Some(chunk_id.into());
        self.last_processed_time = Utc::now();
    }

    pub fn record_failure(&mut self) {
        self.failed_count += 1;
        self.last_processed_time = Utc::now();
    }

    /// Fraction of `total` processed, in `[0, 1]`. An empty source is complete.
    pub fn completion(&self, total: u64) -> f64 {
        if total == 0 {
            return 1.0;
        }
        (self.processed_count as f64 / total as f64).min(1.0)
    }

    /// Serialize to JSON bytes for storage
    pub fn to_bytes(&self) -> Result<Vec<u8>, IndexingError> {
        serde_json::to_vec_pretty(self).map_err(IndexingError::from)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexingError> {
        serde_json::from_slice(bytes).map_err(IndexingError::from)
    }

    /// Load from `path`; a missing or unreadable file starts fresh.
    pub fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(bytes) => Self::from_bytes(&bytes).unwrap_or_else(|e| {
                warn!(path = ?path, error = %e, "Progress file unreadable, starting fresh");
                Self::new()
            }),
            Err(_) => Self::new(),
        }
    }

    /// Write atomically via a temp file and rename.
    pub fn save(&self, path: &Path) -> Result<(), IndexingError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&self.to_bytes()?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)
            .map_err(|e| IndexingError::Checkpoint(format!("install progress file: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_counts() {
        let mut progress = IngestProgress::new();
        progress.record_success("a");
        progress.record_success("b");
        progress.record_failure();

        assert_eq!(progress.processed_count, 2);
        assert_eq!(progress.failed_count, 1);
        assert_eq!(progress.last_chunk_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_completion() {
        let mut progress = IngestProgress::new();
        assert_eq!(progress.completion(0), 1.0);
        assert_eq!(progress.completion(4), 0.0);
        progress.record_success("a");
        assert_eq!(progress.completion(4), 0.25);
        for id in ["b", "c", "d", "e"] {
            progress.record_success(id);
        }
        assert_eq!(progress.completion(4), 1.0);
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join(PROGRESS_FILE);

        let mut progress = IngestProgress::new();
        progress.record_success("up-1");
        progress.save(&path).unwrap();

        let loaded = IngestProgress::load(&path);
        assert_eq!(loaded.processed_count, 1);
        assert_eq!(loaded.last_chunk_id.as_deref(), Some("up-1"));
        assert_eq!(
            loaded.created_at.timestamp_millis(),
            progress.created_at.timestamp_millis()
        );
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_missing_or_corrupt_starts_fresh() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(PROGRESS_FILE);
        assert_eq!(IngestProgress::load(&path).processed_count, 0);

        fs::write(&path, b"{ broken").unwrap();
        assert_eq!(IngestProgress::load(&path).processed_count, 0);
    }

    #[test]
    fn test_json_format() {
        let json_str = String::from_utf8(IngestProgress::new().to_bytes().unwrap()).unwrap();
        assert!(json_str.contains("\"processed_count\": 0"));
        assert!(json_str.contains("\"last_processed_time\":"));
        assert!(json_str.contains("\"created_at\":"));
    }
}
