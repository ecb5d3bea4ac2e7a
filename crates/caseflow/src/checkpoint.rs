// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Checkpoint store.
//!
//! Progress is persisted as one run-header record (configuration snapshot -
//! credentials are never part of the configuration - plus aggregate counters)
//! and an append-only log of per-item outcomes. On resume, items already
//! recorded as successful are skipped.
//!
//! The store is pluggable: [`MemoryCheckpointStore`] for tests and ephemeral
//! runs, [`FileCheckpointStore`] for durable local state. The file layout
//! frames every record with a magic/version/CRC32/length header so torn
//! writes and corruption are detected instead of silently resumed from, and
//! writes go through temp-file + fsync + atomic rename under a cross-process
//! `fs2` lock.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RunConfig;
use crate::context::OperationStatus;
use crate::error::{Error, ErrorKind, Result};

/// Magic bytes identifying a caseflow checkpoint frame: "CFCK".
const CHECKPOINT_MAGIC: &[u8; 4] = b"CFCK";

/// Current checkpoint frame format version.
const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Frame header: magic(4) + version(4) + crc32(4) + length(8) = 20 bytes.
const FRAME_HEADER_SIZE: usize = 20;

/// Aggregate counters persisted with the run header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    /// Items enumerated for this run.
    pub total: u64,
    /// Items migrated successfully.
    pub succeeded: u64,
    /// Items that failed.
    pub failed: u64,
    /// Items skipped (already migrated, or filtered on resume).
    pub skipped: u64,
}

/// One run's header record: configuration snapshot plus counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHeader {
    /// Run identifier.
    pub run_id: String,
    /// Configuration snapshot (credentials are registered with the session
    /// manager, never serialized here).
    pub config: RunConfig,
    /// Run start instant.
    pub started_at: DateTime<Utc>,
    /// Aggregate counters at the last header write.
    pub counters: RunCounters,
}

/// Append-only per-item outcome record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Run this record belongs to.
    pub run_id: String,
    /// Source artifact identifier.
    pub source_id: String,
    /// Created target identifier, when the item reached the target.
    pub target_id: Option<String>,
    /// Terminal item status.
    pub status: OperationStatus,
    /// Taxonomy kind on failure.
    pub error_kind: Option<ErrorKind>,
    /// Short human-readable message on failure.
    pub message: Option<String>,
    /// True for records written by the compensation pass.
    pub compensation: bool,
    /// When the item reached this outcome.
    pub finished_at: DateTime<Utc>,
}

impl ItemRecord {
    /// A success record.
    pub fn success(run_id: &str, source_id: &str, target_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.to_string(),
            source_id: source_id.to_string(),
            target_id: Some(target_id.into()),
            status: OperationStatus::Success,
            error_kind: None,
            message: None,
            compensation: false,
            finished_at: Utc::now(),
        }
    }

    /// A failure record.
    pub fn failure(run_id: &str, source_id: &str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            run_id: run_id.to_string(),
            source_id: source_id.to_string(),
            target_id: None,
            status: if kind == ErrorKind::Cancelled {
                OperationStatus::Cancelled
            } else {
                OperationStatus::Failure
            },
            error_kind: Some(kind),
            message: Some(message.into()),
            compensation: false,
            finished_at: Utc::now(),
        }
    }

    /// A skip record (resume, or selection filtered after enumeration).
    pub fn skipped(run_id: &str, source_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            source_id: source_id.to_string(),
            target_id: None,
            status: OperationStatus::Skipped,
            error_kind: None,
            message: None,
            compensation: false,
            finished_at: Utc::now(),
        }
    }

    /// Mark this record as written by the compensation pass.
    #[must_use]
    pub fn compensating(mut self) -> Self {
        self.compensation = true;
        self
    }
}

/// Pluggable progress store. Implementations must provide atomic append and
/// ordered read.
#[async_trait]
pub trait CheckpointStore: Send + Sync + std::fmt::Debug {
    /// Write (or overwrite) the run header.
    async fn write_header(&self, header: &RunHeader) -> Result<()>;

    /// Read the run header, if the run is known.
    async fn read_header(&self, run_id: &str) -> Result<Option<RunHeader>>;

    /// Append item records atomically, preserving order.
    async fn append_items(&self, records: &[ItemRecord]) -> Result<()>;

    /// Read a run's item records in append order.
    async fn read_items(&self, run_id: &str) -> Result<Vec<ItemRecord>>;
}

/// Source ids already recorded successful for a run (non-compensation records).
pub async fn completed_source_ids(
    store: &dyn CheckpointStore,
    run_id: &str,
) -> Result<std::collections::HashSet<String>> {
    Ok(store
        .read_items(run_id)
        .await?
        .into_iter()
        .filter(|r| !r.compensation && r.status == OperationStatus::Success)
        .map(|r| r.source_id)
        .collect())
}

// ============================================================================
// In-memory store
// ============================================================================

/// Keeps checkpoints in process memory. State does not survive a restart;
/// intended for tests and fire-and-forget runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    headers: Mutex<HashMap<String, RunHeader>>,
    items: Mutex<HashMap<String, Vec<ItemRecord>>>,
}

impl MemoryCheckpointStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn write_header(&self, header: &RunHeader) -> Result<()> {
        self.headers
            .lock()
            .insert(header.run_id.clone(), header.clone());
        Ok(())
    }

    async fn read_header(&self, run_id: &str) -> Result<Option<RunHeader>> {
        Ok(self.headers.lock().get(run_id).cloned())
    }

    async fn append_items(&self, records: &[ItemRecord]) -> Result<()> {
        let mut items = self.items.lock();
        for record in records {
            items
                .entry(record.run_id.clone())
                .or_default()
                .push(record.clone());
        }
        Ok(())
    }

    async fn read_items(&self, run_id: &str) -> Result<Vec<ItemRecord>> {
        Ok(self.items.lock().get(run_id).cloned().unwrap_or_default())
    }
}

// ============================================================================
// File store
// ============================================================================

/// Why a frame failed verification. Each variant names the exact defect so
/// operators (and tests) can tell a torn append from bit rot from a format
/// skew.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes than a frame header.
    #[error("frame header truncated: {available} of {FRAME_HEADER_SIZE} bytes")]
    TruncatedHeader {
        /// Bytes available where a header was expected.
        available: usize,
    },
    /// The magic bytes are not `CFCK`.
    #[error("bad frame magic: expected {expected:?}, found {found:?}")]
    BadMagic {
        /// The expected magic bytes.
        expected: [u8; 4],
        /// The bytes found.
        found: [u8; 4],
    },
    /// Frame written by a newer format version.
    #[error("unsupported frame version: found {found}, supported up to {supported}")]
    UnsupportedVersion {
        /// Version found in the frame header.
        found: u32,
        /// Highest version this build reads.
        supported: u32,
    },
    /// Declared payload length exceeds the bytes on disk (torn append).
    #[error("frame payload truncated: declared {declared} bytes, {available} available")]
    TruncatedPayload {
        /// Length declared in the header.
        declared: u64,
        /// Bytes actually present after the header.
        available: u64,
    },
    /// CRC32 disagreement between header and payload (corruption).
    #[error("frame checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Checksum stored in the header.
        stored: u32,
        /// Checksum computed from the payload.
        computed: u32,
    },
}

/// Frame one serialized record with the integrity header.
fn wrap_frame(payload: &[u8]) -> Vec<u8> {
    let checksum = crc32fast::hash(payload);
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(CHECKPOINT_MAGIC);
    frame.extend_from_slice(&CHECKPOINT_FORMAT_VERSION.to_le_bytes());
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Verify and strip one frame; returns the payload and the bytes consumed.
fn unwrap_frame(data: &[u8]) -> std::result::Result<(&[u8], usize), FrameError> {
    if data.len() < FRAME_HEADER_SIZE {
        return Err(FrameError::TruncatedHeader {
            available: data.len(),
        });
    }
    let mut found = [0u8; 4];
    found.copy_from_slice(&data[0..4]);
    if &found != CHECKPOINT_MAGIC {
        return Err(FrameError::BadMagic {
            expected: *CHECKPOINT_MAGIC,
            found,
        });
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version > CHECKPOINT_FORMAT_VERSION {
        return Err(FrameError::UnsupportedVersion {
            found: version,
            supported: CHECKPOINT_FORMAT_VERSION,
        });
    }
    let stored = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    let declared = u64::from_le_bytes([
        data[12], data[13], data[14], data[15], data[16], data[17], data[18], data[19],
    ]);
    let available = (data.len() - FRAME_HEADER_SIZE) as u64;
    if declared > available {
        return Err(FrameError::TruncatedPayload { declared, available });
    }
    let end = FRAME_HEADER_SIZE + declared as usize;
    let payload = &data[FRAME_HEADER_SIZE..end];
    let computed = crc32fast::hash(payload);
    if computed != stored {
        return Err(FrameError::ChecksumMismatch { stored, computed });
    }
    Ok((payload, end))
}

/// Holds the store's writer lock; `fs2` releases it when the guard drops.
/// One lock file per store directory serializes header replacement and log
/// appends across threads and processes.
#[derive(Debug)]
struct DirLock {
    _guard: std::fs::File,
}

impl DirLock {
    fn take(directory: &Path) -> std::io::Result<Self> {
        let guard = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(directory.join(".caseflow.lock"))?;
        fs2::FileExt::lock_exclusive(&guard)?;
        Ok(Self { _guard: guard })
    }
}

/// Replace `path` with `bytes` without ever exposing a torn file: write a
/// staging sibling, fsync it, rename over the target, then best-effort sync
/// the directory so the rename survives power loss. Callers hold the
/// [`DirLock`], which is what makes the fixed staging name collision-free.
fn replace_file(directory: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let staging = path.with_extension("staging");
    {
        let mut out = std::fs::File::create(&staging)?;
        out.write_all(bytes)?;
        out.sync_all()?;
    }
    std::fs::rename(&staging, path)?;
    // Opening a directory read-only fails on some platforms; skipping the
    // sync there only weakens durability, never correctness.
    if let Ok(dir) = std::fs::File::open(directory) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Durable checkpoint store: one `<run_id>.header` file plus one
/// `<run_id>.log` append-only file per run under a directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    directory: PathBuf,
}

impl FileCheckpointStore {
    /// Store rooted at `directory` (created if absent).
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    fn header_path(&self, run_id: &str) -> PathBuf {
        self.directory.join(format!("{run_id}.header"))
    }

    fn log_path(&self, run_id: &str) -> PathBuf {
        self.directory.join(format!("{run_id}.log"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn write_header(&self, header: &RunHeader) -> Result<()> {
        let directory = self.directory.clone();
        let path = self.header_path(&header.run_id);
        let payload = bincode::serialize(header)
            .map_err(|e| Error::Checkpoint(format!("header serialization failed: {e}")))?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let _lock = DirLock::take(&directory)?;
            replace_file(&directory, &path, &wrap_frame(&payload))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Checkpoint(format!("header write task failed: {e}")))?
    }

    async fn read_header(&self, run_id: &str) -> Result<Option<RunHeader>> {
        let path = self.header_path(run_id);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (payload, _) = unwrap_frame(&data)?;
        let header = bincode::deserialize(payload)
            .map_err(|e| Error::Checkpoint(format!("header deserialization failed: {e}")))?;
        Ok(Some(header))
    }

    async fn append_items(&self, records: &[ItemRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let directory = self.directory.clone();
        let by_run: Vec<(PathBuf, Vec<u8>)> = {
            let mut frames: HashMap<String, Vec<u8>> = HashMap::new();
            for record in records {
                let payload = bincode::serialize(record)
                    .map_err(|e| Error::Checkpoint(format!("record serialization failed: {e}")))?;
                frames
                    .entry(record.run_id.clone())
                    .or_default()
                    .extend_from_slice(&wrap_frame(&payload));
            }
            frames
                .into_iter()
                .map(|(run_id, bytes)| (self.log_path(&run_id), bytes))
                .collect()
        };

        tokio::task::spawn_blocking(move || -> Result<()> {
            let _lock = DirLock::take(&directory)?;
            for (path, bytes) in by_run {
                let mut log = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)?;
                log.write_all(&bytes)?;
                log.sync_all()?;
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Checkpoint(format!("append task failed: {e}")))?
    }

    async fn read_items(&self, run_id: &str) -> Result<Vec<ItemRecord>> {
        let path = self.log_path(run_id);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            match unwrap_frame(&data[offset..]) {
                Ok((payload, consumed)) => {
                    let record: ItemRecord = bincode::deserialize(payload).map_err(|e| {
                        Error::Checkpoint(format!("record deserialization failed: {e}"))
                    })?;
                    records.push(record);
                    offset += consumed;
                }
                Err(e) => {
                    // A torn tail frame loses at most the final record; the
                    // prefix stays usable for resume.
                    tracing::warn!(
                        run_id,
                        offset,
                        error = %e,
                        "checkpoint log tail unreadable, using prefix"
                    );
                    break;
                }
            }
        }
        Ok(records)
    }
}
