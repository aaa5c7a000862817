//! On-disk layout management for the revision store
//!
//! Owns the directory tree rooted at the store directory:
//! ```text
//! <root>/
//!   uuids/<u0:4>/<u4:8>/<uuid>/<revisionId>/   # one dir per revision
//!   hashes/<h0:4>/<h4:8>/<hash>                # one file per unique blob
//!   commits/<yyyy-mm>/<commitId>               # one immutable XML file
//!   snapshots/<yyyy-mm>/<snapshotId>           # one immutable XML file
//!   tmp/                                       # scratch, purged at open
//! ```

use crate::error::{RcsError, Result};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};

/// Tunables injected at store open; no process-wide statics
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Retry budget for revision-folder and log-id allocation
    pub alloc_retries: u32,
    /// Whether an EQUAL restore still triggers a live-store reindex
    pub reindex_on_equal: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            alloc_retries: 100,
            reindex_on_equal: true,
        }
    }
}

/// Which of the two log families an id belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Commit,
    Snapshot,
}

impl LogKind {
    /// Top-level directory name for this log family
    pub fn dir_name(&self) -> &'static str {
        match self {
            LogKind::Commit => "commits",
            LogKind::Snapshot => "snapshots",
        }
    }

    /// Root element name in the log's XML file
    pub fn element_name(&self) -> &'static str {
        match self {
            LogKind::Commit => "commit",
            LogKind::Snapshot => "snapshot",
        }
    }
}

/// A collision-checked, lexically-sortable log identifier
///
/// Rendered from the allocation timestamp as `yyyymmdd-hhmmss-mmm`, so the
/// lexical order of ids matches their allocation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogId {
    kind: LogKind,
    text: String,
    ts_ms: i64,
}

impl LogId {
    fn render(kind: LogKind, ts_ms: i64) -> Option<Self> {
        let dt = Utc.timestamp_millis_opt(ts_ms).single()?;
        Some(Self {
            kind,
            text: dt.format("%Y%m%d-%H%M%S-%3f").to_string(),
            ts_ms,
        })
    }

    pub fn kind(&self) -> LogKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Date shard (`yyyy-mm`) the log file lives under
    pub fn shard(&self) -> String {
        format!("{}-{}", &self.text[0..4], &self.text[4..6])
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.ts_ms
    }
}

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// Owner of the store's directory tree and the two id allocators
pub struct StoreLayout {
    root: PathBuf,
    config: StoreConfig,
    // Probe-and-retry allocation is serialized per allocator; the
    // filesystem (atomic create) resolves races with other processes.
    revision_alloc: Mutex<()>,
    log_alloc: Mutex<()>,
}

impl StoreLayout {
    /// Open the store layout, creating missing directories and purging scratch
    pub fn open(root: impl Into<PathBuf>, config: StoreConfig) -> Result<Self> {
        let root = root.into();

        for dir in ["uuids", "hashes", "commits", "snapshots", "tmp"] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|e| RcsError::io(&path, e))?;
        }

        let layout = Self {
            root,
            config,
            revision_alloc: Mutex::new(()),
            log_alloc: Mutex::new(()),
        };
        layout.purge_scratch()?;
        Ok(layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Root of the blob store
    pub fn hashes_dir(&self) -> PathBuf {
        self.root.join("hashes")
    }

    /// Scratch directory for in-flight writes
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Unique scratch-file path for one in-flight write
    pub fn scratch_file(&self) -> PathBuf {
        self.tmp_dir().join(uuid::Uuid::new_v4().to_string())
    }

    /// Sharded directory holding all revisions of one uuid
    ///
    /// One fixed-width split, `uuids/<id[0..4]>/<id[4..8]>/<id>`, applied
    /// uniformly; this is the only place the offsets are computed.
    pub fn uuid_dir(&self, uuid: &str) -> PathBuf {
        let (first, second) = if uuid.len() >= 8 {
            (&uuid[0..4], &uuid[4..8])
        } else {
            // Degenerate ids still get a stable (unsharded) home.
            ("0000", "0000")
        };
        self.root.join("uuids").join(first).join(second).join(uuid)
    }

    /// Directory of one specific revision
    pub fn revision_dir(&self, uuid: &str, revision_id: u64) -> PathBuf {
        self.uuid_dir(uuid).join(revision_id.to_string())
    }

    /// Claim a fresh revision folder for the given uuid
    ///
    /// The id starts at the current time in milliseconds; an already-claimed
    /// id probes id+1, up to the configured retry budget. `create_dir` is the
    /// atomic claim, so concurrent writers for the same uuid cannot share an
    /// id even across processes.
    pub fn allocate_revision_dir(&self, uuid: &str) -> Result<(u64, PathBuf)> {
        let _guard = self.revision_alloc.lock();

        let base = self.uuid_dir(uuid);
        fs::create_dir_all(&base).map_err(|e| RcsError::io(&base, e))?;

        let start = now_ms() as u64;
        for attempt in 0..self.config.alloc_retries {
            let id = start + attempt as u64;
            let dir = base.join(id.to_string());
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((id, dir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(RcsError::io(&dir, e)),
            }
        }

        Err(RcsError::CollisionExhausted {
            what: format!("revision folder for uuid {uuid}"),
            attempts: self.config.alloc_retries,
        })
    }

    /// Path of a log file given its id
    pub fn log_path(&self, id: &LogId) -> PathBuf {
        self.root
            .join(id.kind().dir_name())
            .join(id.shard())
            .join(id.as_str())
    }

    /// Allocate a collision-free log id and claim its file
    ///
    /// Ids are timestamp-derived sortable strings; on collision the
    /// millisecond is incremented and re-probed. `create_new` is the atomic
    /// claim. Returns the id and the (empty, claimed) file path.
    pub fn allocate_log_id(&self, kind: LogKind) -> Result<(LogId, PathBuf)> {
        let _guard = self.log_alloc.lock();

        let start = now_ms();
        for attempt in 0..self.config.alloc_retries {
            let id = LogId::render(kind, start + attempt as i64).ok_or_else(|| {
                RcsError::CollisionExhausted {
                    what: format!("unrepresentable {} timestamp", kind.dir_name()),
                    attempts: attempt,
                }
            })?;
            let path = self.log_path(&id);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| RcsError::io(parent, e))?;
            }
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok((id, path)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(RcsError::io(&path, e)),
            }
        }

        Err(RcsError::CollisionExhausted {
            what: format!("{} log id", kind.dir_name()),
            attempts: self.config.alloc_retries,
        })
    }

    /// Delete everything under `tmp/` (incomplete writes from a crash)
    fn purge_scratch(&self) -> Result<()> {
        let tmp = self.tmp_dir();
        for entry in fs::read_dir(&tmp).map_err(|e| RcsError::io(&tmp, e))? {
            let entry = entry.map_err(|e| RcsError::io(&tmp, e))?;
            let path = entry.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match removed {
                Ok(()) => tracing::warn!(path = %path.display(), "removed incomplete scratch write"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to purge scratch entry"),
            }
        }
        Ok(())
    }
}

/// Current time in unix milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_layout_dirs() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let _layout = StoreLayout::open(temp.path(), StoreConfig::default())?;

        for dir in ["uuids", "hashes", "commits", "snapshots", "tmp"] {
            assert!(temp.path().join(dir).is_dir(), "{dir} missing");
        }
        Ok(())
    }

    #[test]
    fn test_open_purges_scratch() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let tmp = temp.path().join("tmp");
        std::fs::create_dir_all(&tmp)?;
        std::fs::write(tmp.join("half-written"), b"junk")?;
        std::fs::create_dir(tmp.join("half-dir"))?;

        let _layout = StoreLayout::open(temp.path(), StoreConfig::default())?;

        assert_eq!(std::fs::read_dir(&tmp)?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_uuid_dir_sharding() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let layout = StoreLayout::open(temp.path(), StoreConfig::default())?;

        let dir = layout.uuid_dir("abcdefgh-rest");
        let rel = dir.strip_prefix(temp.path())?;
        assert_eq!(rel, Path::new("uuids/abcd/efgh/abcdefgh-rest"));
        Ok(())
    }

    #[test]
    fn test_revision_allocation_is_strictly_increasing() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let layout = StoreLayout::open(temp.path(), StoreConfig::default())?;

        let (id1, dir1) = layout.allocate_revision_dir("uuid-aaaa")?;
        let (id2, dir2) = layout.allocate_revision_dir("uuid-aaaa")?;
        let (id3, _) = layout.allocate_revision_dir("uuid-aaaa")?;

        assert!(dir1.is_dir());
        assert!(dir2.is_dir());
        assert!(id1 < id2 && id2 < id3, "{id1} {id2} {id3}");
        Ok(())
    }

    #[test]
    fn test_revision_allocation_exhaustion() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let layout = StoreLayout::open(
            temp.path(),
            StoreConfig {
                alloc_retries: 0,
                ..Default::default()
            },
        )?;

        let err = layout.allocate_revision_dir("uuid-bbbb").unwrap_err();
        assert!(matches!(err, RcsError::CollisionExhausted { .. }));
        Ok(())
    }

    #[test]
    fn test_log_id_allocation_claims_file() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let layout = StoreLayout::open(temp.path(), StoreConfig::default())?;

        let (id, path) = layout.allocate_log_id(LogKind::Commit)?;
        assert!(path.is_file());
        assert!(path.starts_with(temp.path().join("commits").join(id.shard())));

        let (id2, _) = layout.allocate_log_id(LogKind::Commit)?;
        assert_ne!(id.as_str(), id2.as_str());
        assert!(id.as_str() < id2.as_str(), "log ids must sort by allocation order");
        Ok(())
    }

    #[test]
    fn test_log_id_shard_matches_timestamp() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let layout = StoreLayout::open(temp.path(), StoreConfig::default())?;

        let (id, _) = layout.allocate_log_id(LogKind::Snapshot)?;
        // yyyymmdd-hhmmss-mmm -> yyyy-mm
        assert_eq!(id.shard(), format!("{}-{}", &id.as_str()[0..4], &id.as_str()[4..6]));
        Ok(())
    }
}
