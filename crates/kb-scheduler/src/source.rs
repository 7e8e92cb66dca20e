//! Work sources feeding the scheduler.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use kb_types::ChunkMetadata;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ShardSpec;
use crate::error::SchedulerError;

/// One chunk waiting to be embedded, as produced by content extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Upstream id; becomes `metadata.chunk_id` once indexed
    pub chunk_id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl WorkItem {
    pub fn new(chunk_id: impl Into<String>, text: impl Into<String>, metadata: ChunkMetadata) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            text: text.into(),
            metadata,
        }
    }

    /// Metadata with the upstream id recorded.
    pub fn indexed_metadata(&self) -> ChunkMetadata {
        let mut metadata = self.metadata.clone();
        metadata.chunk_id = Some(self.chunk_id.clone());
        metadata
    }
}

/// What the scheduler asks a source for on one cycle.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    /// Ids already indexed
    pub processed: &'a HashSet<String>,
    /// Ids that recently failed and wait for their retry time
    pub deferred: &'a HashSet<String>,
    pub limit: usize,
    pub shard: Option<ShardSpec>,
}

impl FetchRequest<'_> {
    /// Not yet processed, not deferred and owned by this shard.
    pub fn wants(&self, chunk_id: &str) -> bool {
        !self.processed.contains(chunk_id)
            && !self.deferred.contains(chunk_id)
            && self.shard.map_or(true, |s| s.owns(chunk_id))
    }
}

/// Upstream store of extracted chunks.
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Up to `limit` items the request wants, in source order.
    async fn fetch_unprocessed(
        &self,
        request: FetchRequest<'_>,
    ) -> Result<Vec<WorkItem>, SchedulerError>;

    /// Total items in the source, if known.
    async fn total(&self) -> Result<Option<u64>, SchedulerError> {
        Ok(None)
    }
}

/// Work source held in memory.
#[derive(Default)]
pub struct InMemoryWorkSource {
    items: Mutex<Vec<WorkItem>>,
}

impl InMemoryWorkSource {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }

    pub fn push(&self, item: WorkItem) {
        self.items.lock().expect("work source mutex poisoned").push(item);
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("work source mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl WorkSource for InMemoryWorkSource {
    async fn fetch_unprocessed(
        &self,
        request: FetchRequest<'_>,
    ) -> Result<Vec<WorkItem>, SchedulerError> {
        let items = self.items.lock().expect("work source mutex poisoned");
        Ok(items
            .iter()
            .filter(|item| request.wants(&item.chunk_id))
            .take(request.limit)
            .cloned()
            .collect())
    }

    async fn total(&self) -> Result<Option<u64>, SchedulerError> {
        Ok(Some(self.len() as u64))
    }
}

/// JSON-lines spool file, one [`WorkItem`] per line.
///
/// The file is re-read every fetch so an extractor can keep appending to it.
pub struct JsonlWorkSource {
    path: PathBuf,
}

impl JsonlWorkSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<WorkItem>, SchedulerError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.path, "Spool file not present yet");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(SchedulerError::UpstreamConnection(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let mut items = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<WorkItem>(line) {
                Ok(item) => items.push(item),
                Err(e) => warn!(
                    path = ?self.path,
                    line = line_no + 1,
                    error = %e,
                    "Skipping malformed spool line"
                ),
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl WorkSource for JsonlWorkSource {
    async fn fetch_unprocessed(
        &self,
        request: FetchRequest<'_>,
    ) -> Result<Vec<WorkItem>, SchedulerError> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|item| request.wants(&item.chunk_id))
            .take(request.limit)
            .collect())
    }

    async fn total(&self) -> Result<Option<u64>, SchedulerError> {
        Ok(Some(self.read_all().await?.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_types::SourceType;
    use tempfile::TempDir;

    fn item(id: &str) -> WorkItem {
        WorkItem::new(
            id,
            format!("text of {}", id),
            ChunkMetadata::new(SourceType::Pdf),
        )
    }

    #[tokio::test]
    async fn test_in_memory_skips_processed_and_limits() {
        let source = InMemoryWorkSource::new(vec![item("a"), item("b"), item("c")]);
        let processed: HashSet<String> = ["a".to_string()].into_iter().collect();
        let deferred: HashSet<String> = ["b".to_string()].into_iter().collect();

        let fetched = source
            .fetch_unprocessed(FetchRequest {
                processed: &processed,
                deferred: &deferred,
                limit: 1,
                shard: None,
            })
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].chunk_id, "c");
        assert_eq!(source.total().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_shard_filter() {
        let items: Vec<WorkItem> = (0..30).map(|n| item(&format!("id-{}", n))).collect();
        let source = InMemoryWorkSource::new(items);
        let processed = HashSet::new();

        let mut seen = 0;
        for index in 0..2 {
            let fetched = source
                .fetch_unprocessed(FetchRequest {
                    processed: &processed,
                    deferred: &processed,
                    limit: 100,
                    shard: Some(ShardSpec::new(index, 2).unwrap()),
                })
                .await
                .unwrap();
            seen += fetched.len();
        }
        assert_eq!(seen, 30);
    }

    #[test]
    fn test_indexed_metadata_records_upstream_id() {
        let meta = item("up-7").indexed_metadata();
        assert_eq!(meta.chunk_id.as_deref(), Some("up-7"));
    }

    #[tokio::test]
    async fn test_jsonl_source() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("spool.jsonl");
        let lines = [
            serde_json::to_string(&item("a")).unwrap(),
            "not json".to_string(),
            String::new(),
            serde_json::to_string(&item("b")).unwrap(),
        ];
        std::fs::write(&path, lines.join("\n")).unwrap();

        let source = JsonlWorkSource::new(&path);
        let processed = HashSet::new();
        let fetched = source
            .fetch_unprocessed(FetchRequest {
                processed: &processed,
                deferred: &processed,
                limit: 10,
                shard: None,
            })
            .await
            .unwrap();
        let ids: Vec<&str> = fetched.iter().map(|i| i.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(source.total().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_jsonl_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let source = JsonlWorkSource::new(temp.path().join("absent.jsonl"));
        assert_eq!(source.total().await.unwrap(), Some(0));
    }
}
