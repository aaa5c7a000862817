//! Collaborator interfaces to the live document store
//!
//! The live database is out of scope for this subsystem; capture and restore
//! reach it only through these capability traits. Locks are acquired through
//! scoped closures so that release is guaranteed on every exit path,
//! including errors raised mid-callback.
//!
//! [`MemoryLiveStore`] and [`MemoryRegistry`] are in-crate doubles: the test
//! backends, and the reference implementations of the locking discipline.

use crate::log::{Change, ChangeLog};
use crate::revision::Permission;
use parking_lot::RwLock;
use rcs_core::{layout::now_ms, RcsError, Result};
use std::collections::HashMap;
use std::io::{Read, Write};

/// What a live resource currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveKind {
    XmlDocument,
    BinaryDocument,
    Collection,
}

/// Metadata readable from, and reappliable to, a live resource
#[derive(Debug, Clone)]
pub struct ResourceMeta {
    pub mime_type: String,
    /// Unix milliseconds
    pub created: i64,
    /// Unix milliseconds
    pub last_modified: i64,
    pub permission: Permission,
    /// Free-form key/value resource metadata
    pub extension: Vec<(String, String)>,
}

impl Default for ResourceMeta {
    fn default() -> Self {
        let now = now_ms();
        Self {
            mime_type: "application/xml".to_string(),
            created: now,
            last_modified: now,
            permission: Permission::default(),
            extension: Vec::new(),
        }
    }
}

/// A live resource handle, valid only inside the lock scope it was issued for
pub trait LiveResource {
    fn kind(&self) -> LiveKind;
    /// Last path segment
    fn name(&self) -> String;
    fn path(&self) -> String;
    /// Stream the resource's content: XML documents through the database
    /// serializer, binary documents as raw bytes. Collections have no
    /// content and must return an error.
    fn serialize_to(&self, out: &mut dyn Write) -> Result<()>;
    fn metadata(&self) -> ResourceMeta;
    /// Paths of direct document children (collections only)
    fn child_documents(&self) -> Result<Vec<String>>;
    /// Paths of direct subcollections (collections only)
    fn child_collections(&self) -> Result<Vec<String>>;
}

/// Callback invoked while a resource lock is held
///
/// `None` means the path resolved to no live resource.
pub type LockedFn<'a> = dyn FnMut(Option<&dyn LiveResource>) -> Result<()> + 'a;

/// Capability surface of the live document store
pub trait LiveStore: Send + Sync {
    /// Current kind of the resource at `path`, if it exists
    fn kind_of(&self, path: &str) -> Result<Option<LiveKind>>;

    /// Run `f` with a read lock on `path`; the lock is released when `f`
    /// returns, on every exit path
    fn with_read_lock(&self, path: &str, f: &mut LockedFn<'_>) -> Result<()>;

    /// Run `f` with a write lock on `path`
    fn with_write_lock(&self, path: &str, f: &mut LockedFn<'_>) -> Result<()>;

    /// Run `f` inside one live-store transaction; a failure rolls the
    /// transaction back and is returned
    fn with_transaction(&self, f: &mut dyn FnMut() -> Result<()>) -> Result<()>;

    /// Create or fully replace a document from a content stream
    fn create_or_replace(&self, path: &str, kind: LiveKind, content: &mut dyn Read) -> Result<()>;

    /// Create an (empty) collection if absent
    fn create_collection(&self, path: &str) -> Result<()>;

    /// Remove a document, or a collection and everything beneath it.
    /// Removing an absent path is a no-op.
    fn remove(&self, path: &str) -> Result<()>;

    /// Reapply metadata (owner, group, mode, mime type, timestamps)
    fn set_metadata(&self, path: &str, meta: &ResourceMeta) -> Result<()>;

    /// Refresh derived index state for the resource
    fn reindex(&self, path: &str) -> Result<()>;
}

/// Stable-identifier registry: `uuid -> path` and `path -> uuid`
///
/// A uuid is assigned once at first sight of a path and never reused; it
/// stays constant across renames and moves, which rebind it via [`bind`].
///
/// [`bind`]: IdRegistry::bind
pub trait IdRegistry: Send + Sync {
    fn uuid_for(&self, path: &str) -> Option<String>;
    fn path_for(&self, uuid: &str) -> Option<String>;
    /// Existing uuid for `path`, or a freshly minted one
    fn assign(&self, path: &str) -> String;
    /// Rebind a known uuid to a (possibly new) path, e.g. after restore
    fn bind(&self, uuid: &str, path: &str);
}

/// Progress/error callback surface for commit, snapshot and restore
///
/// All methods default to no-ops; implementors override what they need.
pub trait RcsHandler: Send + Sync {
    fn entry_written(&self, _change: &Change) {}
    fn resource_error(&self, _uri: &str, _error: &RcsError) {}
    fn log_written(&self, _log: &ChangeLog) {}
}

/// Handler that ignores everything
pub struct NoopHandler;

impl RcsHandler for NoopHandler {}

// ---------------------------------------------------------------------------
// In-memory doubles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct LiveEntry {
    kind: LiveKind,
    content: Vec<u8>,
    meta: ResourceMeta,
    /// When set, serialization fails (unreadable-resource injection)
    poisoned: bool,
    reindex_count: u32,
}

/// In-memory live store
///
/// The map's `RwLock` is the locking discipline: read-lock scopes hold the
/// read guard, mutations take the write guard. Guards drop on scope exit, so
/// release is guaranteed on every path.
#[derive(Default)]
pub struct MemoryLiveStore {
    entries: RwLock<HashMap<String, LiveEntry>>,
}

struct MemoryResource<'a> {
    path: &'a str,
    entry: &'a LiveEntry,
    all: &'a HashMap<String, LiveEntry>,
}

impl MemoryResource<'_> {
    fn children(&self, want_collection: bool) -> Vec<String> {
        let prefix = format!("{}/", self.path.trim_end_matches('/'));
        let mut out: Vec<String> = self
            .all
            .iter()
            .filter(|(path, entry)| {
                path.starts_with(&prefix)
                    && !path[prefix.len()..].contains('/')
                    && (entry.kind == LiveKind::Collection) == want_collection
            })
            .map(|(path, _)| path.clone())
            .collect();
        out.sort();
        out
    }
}

impl LiveResource for MemoryResource<'_> {
    fn kind(&self) -> LiveKind {
        self.entry.kind
    }

    fn name(&self) -> String {
        self.path.rsplit('/').next().unwrap_or(self.path).to_string()
    }

    fn path(&self) -> String {
        self.path.to_string()
    }

    fn serialize_to(&self, out: &mut dyn Write) -> Result<()> {
        if self.entry.poisoned {
            return Err(RcsError::Live(format!("resource {} is unreadable", self.path)));
        }
        if self.entry.kind == LiveKind::Collection {
            return Err(RcsError::Live(format!("collection {} has no content", self.path)));
        }
        out.write_all(&self.entry.content)
            .map_err(|e| RcsError::Live(e.to_string()))
    }

    fn metadata(&self) -> ResourceMeta {
        self.entry.meta.clone()
    }

    fn child_documents(&self) -> Result<Vec<String>> {
        Ok(self.children(false))
    }

    fn child_collections(&self) -> Result<Vec<String>> {
        Ok(self.children(true))
    }
}

impl MemoryLiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document with default metadata
    pub fn insert_document(&self, path: &str, kind: LiveKind, content: &[u8]) {
        let meta = ResourceMeta {
            mime_type: match kind {
                LiveKind::XmlDocument => "application/xml".to_string(),
                LiveKind::BinaryDocument => "application/octet-stream".to_string(),
                LiveKind::Collection => String::new(),
            },
            ..Default::default()
        };
        self.entries.write().insert(
            path.to_string(),
            LiveEntry {
                kind,
                content: content.to_vec(),
                meta,
                poisoned: false,
                reindex_count: 0,
            },
        );
    }

    pub fn insert_collection(&self, path: &str) {
        self.entries.write().insert(
            path.to_string(),
            LiveEntry {
                kind: LiveKind::Collection,
                content: Vec::new(),
                meta: ResourceMeta::default(),
                poisoned: false,
                reindex_count: 0,
            },
        );
    }

    /// Make serialization of `path` fail (simulates an unreadable resource)
    pub fn poison(&self, path: &str) {
        if let Some(entry) = self.entries.write().get_mut(path) {
            entry.poisoned = true;
        }
    }

    pub fn content_of(&self, path: &str) -> Option<Vec<u8>> {
        self.entries.read().get(path).map(|e| e.content.clone())
    }

    pub fn meta_of(&self, path: &str) -> Option<ResourceMeta> {
        self.entries.read().get(path).map(|e| e.meta.clone())
    }

    pub fn reindex_count(&self, path: &str) -> u32 {
        self.entries.read().get(path).map(|e| e.reindex_count).unwrap_or(0)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.entries.read().contains_key(path)
    }

    fn locked(&self, path: &str, f: &mut LockedFn<'_>) -> Result<()> {
        let guard = self.entries.read();
        let map: &HashMap<String, LiveEntry> = &guard;
        match map.get(path) {
            Some(entry) => {
                let resource = MemoryResource {
                    path,
                    entry,
                    all: map,
                };
                f(Some(&resource))
            }
            None => f(None),
        }
    }
}

impl LiveStore for MemoryLiveStore {
    fn kind_of(&self, path: &str) -> Result<Option<LiveKind>> {
        Ok(self.entries.read().get(path).map(|e| e.kind))
    }

    fn with_read_lock(&self, path: &str, f: &mut LockedFn<'_>) -> Result<()> {
        self.locked(path, f)
    }

    fn with_write_lock(&self, path: &str, f: &mut LockedFn<'_>) -> Result<()> {
        // The double has no writer concurrency to defend against; the read
        // guard gives the same scoped-release behavior.
        self.locked(path, f)
    }

    fn with_transaction(&self, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        // No real transaction in the double; failures simply propagate.
        f()
    }

    fn create_or_replace(&self, path: &str, kind: LiveKind, content: &mut dyn Read) -> Result<()> {
        let mut body = Vec::new();
        content
            .read_to_end(&mut body)
            .map_err(|e| RcsError::Live(e.to_string()))?;
        self.insert_document(path, kind, &body);
        Ok(())
    }

    fn create_collection(&self, path: &str) -> Result<()> {
        if !self.exists(path) {
            self.insert_collection(path);
        }
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut map = self.entries.write();
        map.remove(path);
        map.retain(|p, _| !p.starts_with(&prefix));
        Ok(())
    }

    fn set_metadata(&self, path: &str, meta: &ResourceMeta) -> Result<()> {
        let mut map = self.entries.write();
        let entry = map
            .get_mut(path)
            .ok_or_else(|| RcsError::Identity(format!("no live resource at {path}")))?;
        entry.meta = meta.clone();
        Ok(())
    }

    fn reindex(&self, path: &str) -> Result<()> {
        let mut map = self.entries.write();
        let entry = map
            .get_mut(path)
            .ok_or_else(|| RcsError::Identity(format!("no live resource at {path}")))?;
        entry.reindex_count += 1;
        Ok(())
    }
}

/// In-memory `uuid <-> path` registry
#[derive(Default)]
pub struct MemoryRegistry {
    by_path: RwLock<HashMap<String, String>>,
    by_uuid: RwLock<HashMap<String, String>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdRegistry for MemoryRegistry {
    fn uuid_for(&self, path: &str) -> Option<String> {
        self.by_path.read().get(path).cloned()
    }

    fn path_for(&self, uuid: &str) -> Option<String> {
        self.by_uuid.read().get(uuid).cloned()
    }

    fn assign(&self, path: &str) -> String {
        if let Some(existing) = self.uuid_for(path) {
            return existing;
        }
        let uuid = uuid::Uuid::new_v4().to_string();
        self.by_path.write().insert(path.to_string(), uuid.clone());
        self.by_uuid.write().insert(uuid.clone(), path.to_string());
        uuid
    }

    fn bind(&self, uuid: &str, path: &str) {
        self.by_path.write().insert(path.to_string(), uuid.to_string());
        self.by_uuid.write().insert(uuid.to_string(), path.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_lock_scopes_resource() -> anyhow::Result<()> {
        let store = MemoryLiveStore::new();
        store.insert_document("/db/x.xml", LiveKind::XmlDocument, b"<r/>");

        let mut seen = None;
        store.with_read_lock("/db/x.xml", &mut |res| {
            let res = res.ok_or_else(|| RcsError::Identity("gone".into()))?;
            let mut buf = Vec::new();
            res.serialize_to(&mut buf)?;
            seen = Some((res.kind(), res.name(), buf));
            Ok(())
        })?;

        let (kind, name, buf) = seen.unwrap();
        assert_eq!(kind, LiveKind::XmlDocument);
        assert_eq!(name, "x.xml");
        assert_eq!(buf, b"<r/>");
        Ok(())
    }

    #[test]
    fn test_lock_released_after_error() {
        let store = MemoryLiveStore::new();
        store.insert_document("/db/x.xml", LiveKind::XmlDocument, b"<r/>");
        store.poison("/db/x.xml");

        let result = store.with_read_lock("/db/x.xml", &mut |res| {
            res.unwrap().serialize_to(&mut Vec::new())
        });
        assert!(result.is_err());

        // A leaked read guard would deadlock this write.
        store.insert_document("/db/y.xml", LiveKind::XmlDocument, b"<s/>");
        assert!(store.exists("/db/y.xml"));
    }

    #[test]
    fn test_children_are_direct_only() -> anyhow::Result<()> {
        let store = MemoryLiveStore::new();
        store.insert_collection("/db");
        store.insert_collection("/db/sub");
        store.insert_document("/db/a.xml", LiveKind::XmlDocument, b"<a/>");
        store.insert_document("/db/sub/b.xml", LiveKind::XmlDocument, b"<b/>");

        store.with_read_lock("/db", &mut |res| {
            let res = res.unwrap();
            assert_eq!(res.child_documents()?, vec!["/db/a.xml".to_string()]);
            assert_eq!(res.child_collections()?, vec!["/db/sub".to_string()]);
            Ok(())
        })?;
        Ok(())
    }

    #[test]
    fn test_registry_assign_is_stable() {
        let registry = MemoryRegistry::new();
        let uuid1 = registry.assign("/db/x.xml");
        let uuid2 = registry.assign("/db/x.xml");
        assert_eq!(uuid1, uuid2);
        assert_eq!(registry.path_for(&uuid1).as_deref(), Some("/db/x.xml"));
    }

    #[test]
    fn test_remove_is_recursive_and_idempotent() -> anyhow::Result<()> {
        let store = MemoryLiveStore::new();
        store.insert_collection("/db/a");
        store.insert_document("/db/a/x.xml", LiveKind::XmlDocument, b"<r/>");

        store.remove("/db/a")?;
        assert!(!store.exists("/db/a"));
        assert!(!store.exists("/db/a/x.xml"));

        store.remove("/db/a")?;
        Ok(())
    }
}
