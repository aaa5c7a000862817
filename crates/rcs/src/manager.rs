//! Top-level revision store manager
//!
//! Owns the on-disk layout and the blob store, allocates collision-free
//! commit/snapshot ids, tracks in-flight commit writers so abandoned ones
//! roll back cleanly, and fans out finished logs to registered listeners.

use crate::history::ResourceHistory;
use crate::live::{IdRegistry, LiveKind, LiveStore, RcsHandler};
use crate::log::{Change, ChangeLog, ChangeOp, CommitParts, CommitWriter};
use crate::restore::{Engine, RestoreOptions, RestoreOutcome};
use crate::revision::Revision;
use crate::snapshot::SnapshotWalker;
use dashmap::DashMap;
use parking_lot::RwLock;
use rcs_core::{layout::now_ms, BlobStore, LogId, LogKind, RcsError, Result, StoreConfig, StoreLayout};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Entry point to the revision control subsystem
///
/// Explicitly constructed and dependency-injected; one instance per store
/// root, no process-wide state.
pub struct RevisionStoreManager {
    layout: StoreLayout,
    blobs: BlobStore,
    live: Arc<dyn LiveStore>,
    registry: Arc<dyn IdRegistry>,
    listeners: RwLock<Vec<Box<dyn RcsHandler>>>,
    /// Open commit writers: token -> opened-at unix ms
    in_flight: DashMap<u64, i64>,
    next_token: AtomicU64,
}

impl RevisionStoreManager {
    /// Open (or initialize) the store rooted at `root`
    ///
    /// Creates missing layout directories and purges the scratch directory
    /// left over from any unclean shutdown.
    pub fn open(
        root: impl Into<std::path::PathBuf>,
        config: StoreConfig,
        live: Arc<dyn LiveStore>,
        registry: Arc<dyn IdRegistry>,
    ) -> Result<Self> {
        let layout = StoreLayout::open(root, config)?;
        let blobs = BlobStore::new(&layout);
        tracing::info!(root = %layout.root().display(), "revision store opened");

        Ok(Self {
            layout,
            blobs,
            live,
            registry,
            listeners: RwLock::new(Vec::new()),
            in_flight: DashMap::new(),
            next_token: AtomicU64::new(1),
        })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.blobs
    }

    /// Register a listener notified after every finished commit/snapshot log
    pub fn add_listener(&self, listener: Box<dyn RcsHandler>) {
        self.listeners.write().push(listener);
    }

    /// Number of commit writers currently open
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Open a commit writer
    ///
    /// The writer must be closed with `done()` or `abort()`; dropping it
    /// without either rolls it back (no log reaches disk).
    pub fn open_commit(&self, handler: Arc<dyn RcsHandler>) -> CommitWriter<'_> {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.in_flight.insert(token, now_ms());
        CommitWriter::new(self, handler, token)
    }

    /// Per-resource revision chain for one uuid
    pub fn resource(&self, uuid: &str) -> ResourceHistory {
        ResourceHistory::new(&self.layout, uuid)
    }

    /// Restore one revision into the live store
    pub fn restore(&self, revision: &Revision, options: &RestoreOptions) -> Result<RestoreOutcome> {
        self.engine().restore(revision, options)
    }

    /// Restore the newest revision of a uuid, if it has any history
    pub fn restore_latest(
        &self,
        uuid: &str,
        options: &RestoreOptions,
    ) -> Result<Option<RestoreOutcome>> {
        match self.resource(uuid).latest()? {
            Some(revision) => self.restore(&revision, options).map(Some),
            None => Ok(None),
        }
    }

    /// Snapshot a live collection subtree into one snapshot log
    pub fn snapshot(&self, root_collection: &str, handler: &dyn RcsHandler) -> Result<ChangeLog> {
        let (id, path) = self.layout.allocate_log_id(LogKind::Snapshot)?;
        let log = match self.build_snapshot(root_collection, &id, &path, handler) {
            Ok(log) => log,
            Err(e) => {
                self.discard_claim(&path);
                return Err(e);
            }
        };
        tracing::info!(id = %log.id, entries = log.changes.len(), "snapshot written");

        handler.log_written(&log);
        self.dispatch(&log);
        Ok(log)
    }

    fn build_snapshot(
        &self,
        root_collection: &str,
        id: &LogId,
        path: &std::path::Path,
        handler: &dyn RcsHandler,
    ) -> Result<ChangeLog> {
        let log_ref = log_reference(id);
        let engine = self.engine();
        let walker = SnapshotWalker::new(&engine, handler);
        let changes = walker.walk(root_collection, &log_ref)?;

        let log = ChangeLog {
            id: id.as_str().to_string(),
            kind: LogKind::Snapshot,
            author: None,
            message: None,
            metadata: Vec::new(),
            changes,
        };
        self.persist_log(&log, path)?;
        Ok(log)
    }

    /// All logs of one kind, oldest first
    pub fn logs(&self, kind: LogKind) -> Result<Vec<ChangeLog>> {
        let dir = self.layout.root().join(kind.dir_name());
        let mut logs = Vec::new();
        for entry in walkdir::WalkDir::new(&dir).min_depth(2).max_depth(2).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                RcsError::io(&dir, e.into_io_error().unwrap_or_else(|| std::io::Error::other("walk error")))
            })?;
            if entry.file_type().is_file() {
                let meta = entry.metadata().map_err(|e| {
                    RcsError::io(entry.path(), e.into_io_error().unwrap_or_else(|| std::io::Error::other("walk error")))
                })?;
                // A zero-byte file is a claimed id whose writer crashed
                // before the rename; it carries no log.
                if meta.len() == 0 {
                    tracing::warn!(path = %entry.path().display(), "skipping empty claimed log file");
                    continue;
                }
                logs.push(ChangeLog::read_xml(entry.path())?);
            }
        }
        Ok(logs)
    }

    pub(crate) fn engine(&self) -> Engine<'_> {
        Engine {
            layout: &self.layout,
            blobs: &self.blobs,
            live: self.live.as_ref(),
            registry: self.registry.as_ref(),
        }
    }

    /// Finalize one commit writer: allocate the log id, capture a revision
    /// per queued action, write the log, notify listeners
    ///
    /// One entry's failure is recorded on that entry and never stops the
    /// others. The writer is deregistered on every exit path.
    pub(crate) fn finalize_commit(
        &self,
        token: u64,
        parts: CommitParts,
        handler: Arc<dyn RcsHandler>,
    ) -> Result<ChangeLog> {
        let result = self.write_commit(parts, handler.as_ref());
        // Deregister even when finalization failed internally.
        self.in_flight.remove(&token);

        let log = result?;
        handler.log_written(&log);
        self.dispatch(&log);
        Ok(log)
    }

    fn write_commit(&self, parts: CommitParts, handler: &dyn RcsHandler) -> Result<ChangeLog> {
        let (id, path) = self.layout.allocate_log_id(LogKind::Commit)?;
        let log_ref = log_reference(&id);
        let engine = self.engine();

        let mut changes = Vec::with_capacity(parts.actions.len());
        for (op, uri) in parts.actions {
            let change = self.apply_action(&engine, op, uri, &log_ref, handler);
            handler.entry_written(&change);
            changes.push(change);
        }

        let log = ChangeLog {
            id: id.as_str().to_string(),
            kind: LogKind::Commit,
            author: parts.author,
            message: parts.message,
            metadata: parts.metadata,
            changes,
        };
        if let Err(e) = self.persist_log(&log, &path) {
            self.discard_claim(&path);
            return Err(e);
        }
        tracing::info!(id = %log.id, entries = log.changes.len(), "commit written");
        Ok(log)
    }

    /// Move a finished log onto its claimed path
    ///
    /// The XML goes to a scratch file first and is renamed over the claim,
    /// so the claimed path only ever holds an empty placeholder or a
    /// complete well-formed log.
    fn persist_log(&self, log: &ChangeLog, path: &std::path::Path) -> Result<()> {
        let scratch = self.layout.scratch_file();
        if let Err(e) = log.write_xml(&scratch) {
            let _ = std::fs::remove_file(&scratch);
            return Err(e);
        }
        std::fs::rename(&scratch, path).map_err(|e| {
            let _ = std::fs::remove_file(&scratch);
            RcsError::io(path, e)
        })
    }

    /// Remove a claimed-but-never-written log file after a failed
    /// finalization, so `logs()` never trips over an empty placeholder
    fn discard_claim(&self, path: &std::path::Path) {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to discard claimed log file");
        }
    }

    /// Capture one queued action into a change entry; failures are
    /// downgraded to the entry's `error` attribute
    fn apply_action(
        &self,
        engine: &Engine<'_>,
        op: ChangeOp,
        uri: String,
        log_ref: &str,
        handler: &dyn RcsHandler,
    ) -> Change {
        let captured = match op {
            ChangeOp::Create | ChangeOp::Update => match self.live.kind_of(&uri) {
                Ok(Some(LiveKind::Collection)) => engine.capture_collection(&uri, log_ref),
                Ok(Some(_)) => engine.capture_document(&uri, log_ref),
                Ok(None) => Err(RcsError::Identity(format!("no live resource at {uri}"))),
                Err(e) => Err(e),
            },
            ChangeOp::Delete => match self.registry.uuid_for(&uri) {
                Some(uuid) => engine.capture_tombstone(&uuid, &uri, log_ref),
                None => Err(RcsError::Identity(format!("no uuid recorded for {uri}"))),
            },
        };

        match captured {
            Ok(revision) => Change {
                op,
                uuid: Some(revision.uuid.clone()),
                uri: Some(uri),
                revision_path: Some(self.layout.revision_dir(&revision.uuid, revision.revision_id)),
                error: None,
            },
            Err(error) => {
                handler.resource_error(&uri, &error);
                Change {
                    op,
                    uuid: self.registry.uuid_for(&uri),
                    uri: Some(uri),
                    revision_path: None,
                    error: Some(error.to_string()),
                }
            }
        }
    }

    /// Roll back an open writer: nothing reaches disk, the token is forgotten
    pub(crate) fn rollback(&self, token: u64) {
        self.in_flight.remove(&token);
    }

    /// Notify registered listeners; a listener panic is logged, never
    /// propagated into commit finalization
    fn dispatch(&self, log: &ChangeLog) {
        for listener in self.listeners.read().iter() {
            if catch_unwind(AssertUnwindSafe(|| listener.log_written(log))).is_err() {
                tracing::warn!(id = %log.id, "commit listener panicked; ignoring");
            }
        }
    }
}

/// Back-reference string stored in each revision: `commits/<yyyy-mm>/<id>`
fn log_reference(id: &LogId) -> String {
    format!("{}/{}/{}", id.kind().dir_name(), id.shard(), id.as_str())
}
