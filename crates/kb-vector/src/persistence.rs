//! Snapshot persistence for the index and the chunk store.
//!
//! Two co-located files:
//! - `index.vec`: binary vector block (magic `KBVI`, version, dimension,
//!   count, little-endian f32 data)
//! - `store.json`: `{chunks, counts, pending}`, where `pending` holds chunks
//!   whose vectors still have to be rebuilt
//!
//! Each file is written independently: temp file + fsync, live file renamed
//! to `.bak`, temp renamed into place. A crash at any point leaves either the
//! new file, the previous file, or the previous file under `.bak`, and load
//! falls back to the backup when the live copy is missing or unreadable.
//! Saves through one [`SnapshotStore`] (and its clones) are serialized.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use kb_types::Chunk;
use tracing::{debug, error, info, warn};

use crate::error::VectorError;
use crate::store::{ChunkStore, StoreSnapshot};

pub const INDEX_FILE: &str = "index.vec";
pub const STORE_FILE: &str = "store.json";

const MAGIC: &[u8; 4] = b"KBVI";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

/// Raw vectors read back from `index.vec`.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorBlock {
    pub dimension: usize,
    pub data: Vec<f32>,
}

impl VectorBlock {
    pub fn count(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }
}

/// Outcome of a save; each file succeeds or fails on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaveReport {
    pub index_saved: bool,
    pub store_saved: bool,
}

impl SaveReport {
    pub fn is_complete(&self) -> bool {
        self.index_saved && self.store_saved
    }
}

/// Where a loaded file came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSource {
    /// Neither live nor backup exists
    Missing,
    Live,
    Backup,
    /// Both copies exist in some form but neither decodes
    Unreadable,
}

/// Result of [`SnapshotStore::load`].
#[derive(Debug)]
pub struct LoadedSnapshot {
    /// `None` when the index file is missing or unreadable
    pub vectors: Option<VectorBlock>,
    pub chunks: Vec<Chunk>,
    /// Chunks stored without vectors
    pub pending: Vec<Chunk>,
    /// The `.bak` vector block, read when the live copy loaded; a partial save
    /// can leave the live index one step ahead of the store
    pub vector_backup: Option<VectorBlock>,
    pub index_source: FileSource,
    pub store_source: FileSource,
}

/// Reads and writes the snapshot pair in one directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    /// Both saves share the same `.tmp` paths
    save_lock: Arc<Mutex<()>>,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            save_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    pub fn store_path(&self) -> PathBuf {
        self.dir.join(STORE_FILE)
    }

    /// Persist both files. Never returns an error: failures are logged and
    /// reported per file so a long-running ingest loop keeps going.
    pub fn save(&self, dimension: usize, raw_vectors: &[f32], store: &ChunkStore) -> SaveReport {
        self.save_with_pending(dimension, raw_vectors, store, &[])
    }

    /// Like [`Self::save`], also recording chunks that have no vector yet.
    pub fn save_with_pending(
        &self,
        dimension: usize,
        raw_vectors: &[f32],
        store: &ChunkStore,
        pending: &[Chunk],
    ) -> SaveReport {
        // A poisoned lock only means another save panicked; the files are
        // still written through tmp + rename.
        let _guard = self
            .save_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut report = SaveReport::default();

        match write_atomic(&self.index_path(), &encode_vectors(dimension, raw_vectors)) {
            Ok(()) => report.index_saved = true,
            Err(e) => error!(path = ?self.index_path(), error = %e, "Failed to save vector index"),
        }

        let mut snapshot = store.to_snapshot();
        snapshot.pending = pending.to_vec();
        let store_bytes = serde_json::to_vec(&snapshot)
            .map_err(VectorError::from)
            .and_then(|bytes| write_atomic(&self.store_path(), &bytes));
        match store_bytes {
            Ok(()) => report.store_saved = true,
            Err(e) => error!(path = ?self.store_path(), error = %e, "Failed to save chunk store"),
        }

        if report.is_complete() {
            info!(
                dir = ?self.dir,
                vectors = store.len(),
                pending = pending.len(),
                "Saved snapshot"
            );
        }
        report
    }

    /// Load both files. Missing files mean an empty store. Only a chunk store
    /// that is unreadable in both live and backup copies is an error.
    pub fn load(&self) -> Result<LoadedSnapshot, VectorError> {
        let (vectors, index_source) = read_with_fallback(&self.index_path(), decode_vectors);
        let (store, store_source) = read_with_fallback(&self.store_path(), |bytes| {
            serde_json::from_slice::<StoreSnapshot>(bytes).map_err(VectorError::from)
        });

        if store_source == FileSource::Unreadable {
            return Err(VectorError::PersistenceCorrupt(format!(
                "{} and its backup are unreadable",
                self.store_path().display()
            )));
        }

        let vector_backup = if index_source == FileSource::Live {
            read_backup(&self.index_path(), decode_vectors)
        } else {
            None
        };

        let (chunks, pending) = store.map(|s| (s.chunks, s.pending)).unwrap_or_default();
        debug!(
            chunks = chunks.len(),
            pending = pending.len(),
            vectors = vectors.as_ref().map(VectorBlock::count).unwrap_or(0),
            ?index_source,
            ?store_source,
            "Loaded snapshot"
        );

        Ok(LoadedSnapshot {
            vectors,
            chunks,
            pending,
            vector_backup,
            index_source,
            store_source,
        })
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

pub(crate) fn backup_path(path: &Path) -> PathBuf {
    sibling(path, ".bak")
}

/// tmp + fsync, live → .bak, tmp → live.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), VectorError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = sibling(path, ".tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    if path.exists() {
        fs::rename(path, backup_path(path))
            .map_err(|e| VectorError::PersistenceWriteFailed(format!("rotate to .bak: {}", e)))?;
    }
    fs::rename(&tmp, path)
        .map_err(|e| VectorError::PersistenceWriteFailed(format!("install: {}", e)))?;
    Ok(())
}

fn read_backup<T>(path: &Path, decode: impl Fn(&[u8]) -> Result<T, VectorError>) -> Option<T> {
    let backup = backup_path(path);
    if !backup.exists() {
        return None;
    }
    fs::read(&backup)
        .map_err(VectorError::from)
        .and_then(|b| decode(&b))
        .map_err(|e| debug!(path = ?backup, error = %e, "Backup snapshot not usable"))
        .ok()
}

fn read_with_fallback<T>(
    path: &Path,
    decode: impl Fn(&[u8]) -> Result<T, VectorError>,
) -> (Option<T>, FileSource) {
    let backup = backup_path(path);
    let live_exists = path.exists();
    let backup_exists = backup.exists();

    if !live_exists && !backup_exists {
        return (None, FileSource::Missing);
    }

    if live_exists {
        match fs::read(path).map_err(VectorError::from).and_then(|b| decode(&b)) {
            Ok(value) => return (Some(value), FileSource::Live),
            Err(e) => warn!(path = ?path, error = %e, "Live snapshot unreadable, trying backup"),
        }
    }

    if backup_exists {
        match fs::read(&backup)
            .map_err(VectorError::from)
            .and_then(|b| decode(&b))
        {
            Ok(value) => {
                warn!(path = ?backup, "Recovered from backup snapshot");
                return (Some(value), FileSource::Backup);
            }
            Err(e) => error!(path = ?backup, error = %e, "Backup snapshot unreadable"),
        }
    }

    (None, FileSource::Unreadable)
}

pub(crate) fn encode_vectors(dimension: usize, raw: &[f32]) -> Vec<u8> {
    let count = if dimension == 0 { 0 } else { raw.len() / dimension };
    let mut out = Vec::with_capacity(HEADER_LEN + raw.len() * 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(dimension as u32).to_le_bytes());
    out.extend_from_slice(&(count as u64).to_le_bytes());
    for v in raw {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub(crate) fn decode_vectors(bytes: &[u8]) -> Result<VectorBlock, VectorError> {
    let corrupt = |msg: &str| VectorError::PersistenceCorrupt(msg.to_string());

    if bytes.len() < HEADER_LEN || &bytes[0..4] != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = u32::from_le_bytes(read4(&bytes[4..8]));
    if version != FORMAT_VERSION {
        return Err(corrupt(&format!("unsupported version {}", version)));
    }
    let dimension = u32::from_le_bytes(read4(&bytes[8..12])) as usize;
    let count = u64::from_le_bytes(read8(&bytes[12..20])) as usize;

    let expected = count
        .checked_mul(dimension)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| corrupt("size overflow"))?;
    let body = &bytes[HEADER_LEN..];
    if body.len() != expected {
        return Err(corrupt(&format!(
            "expected {} bytes of vectors, found {}",
            expected,
            body.len()
        )));
    }

    let data = body
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes(read4(b)))
        .collect();
    Ok(VectorBlock { dimension, data })
}

fn read4(b: &[u8]) -> [u8; 4] {
    [b[0], b[1], b[2], b[3]]
}

fn read8(b: &[u8]) -> [u8; 8] {
    [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]
}
