//! Capture (live -> revision) and verify-and-restore (revision -> live)
//!
//! Capture serializes a live resource under its read lock, releases the
//! lock, and only then touches the blob store and history. Restore
//! recomputes the live resource's digest through the same serialization
//! path used at capture time and only re-materializes content when it has
//! actually diverged.

use crate::live::{IdRegistry, LiveKind, LiveStore, ResourceMeta};
use crate::revision::{ResourceKind, Revision};
use rcs_core::{BlobStore, HashingWriter, RcsError, Result, StoreConfig, StoreLayout};
use std::io::Write;

/// Result of comparing a live resource against a target revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Live content already matched; only metadata was reapplied
    Equal,
    /// Live content was stale and has been replaced from the blob store
    Different,
    /// No comparison was possible (resource absent, unknown kind, or no
    /// recorded digest); the resource was unconditionally restored
    Unknown,
    /// A tombstone revision was applied: the live resource is gone
    Removed,
}

/// Per-restore tunables
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Reindex the live resource even when content compared `Equal`.
    /// Conservative default; the live store may key derived index state off
    /// metadata that the restore just reapplied.
    pub reindex_on_equal: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            reindex_on_equal: true,
        }
    }
}

impl RestoreOptions {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            reindex_on_equal: config.reindex_on_equal,
        }
    }
}

/// Capture/restore engine bound to one store's components
pub struct Engine<'a> {
    pub layout: &'a StoreLayout,
    pub blobs: &'a BlobStore,
    pub live: &'a dyn LiveStore,
    pub registry: &'a dyn IdRegistry,
}

impl Engine<'_> {
    /// Capture a live document into a new revision
    ///
    /// The read lock covers the serialization pass only; blob and history
    /// writes happen after release.
    pub fn capture_document(&self, path: &str, log_ref: &str) -> Result<Revision> {
        let uuid = self.registry.assign(path);

        let mut kind = None;
        let mut body = Vec::new();
        let mut meta: Option<ResourceMeta> = None;

        self.live.with_read_lock(path, &mut |res| {
            let res = res
                .ok_or_else(|| RcsError::Identity(format!("no live resource at {path}")))?;
            match res.kind() {
                LiveKind::Collection => {
                    return Err(RcsError::Live(format!("{path} is a collection, not a document")))
                }
                k => kind = Some(k),
            }
            res.serialize_to(&mut body)?;
            meta = Some(res.metadata());
            Ok(())
        })?;

        let meta = meta.ok_or_else(|| RcsError::Live(format!("{path} yielded no metadata")))?;
        let kind = match kind {
            Some(LiveKind::XmlDocument) => ResourceKind::Xml,
            _ => ResourceKind::Binary,
        };

        let hash = self.blobs.put_bytes(&body)?;
        self.write_revision(&uuid, kind, Some(hash), path, log_ref, meta)
    }

    /// Capture a live collection: metadata only, no content digest
    pub fn capture_collection(&self, path: &str, log_ref: &str) -> Result<Revision> {
        let uuid = self.registry.assign(path);

        let mut meta: Option<ResourceMeta> = None;
        self.live.with_read_lock(path, &mut |res| {
            let res = res
                .ok_or_else(|| RcsError::Identity(format!("no live collection at {path}")))?;
            if res.kind() != LiveKind::Collection {
                return Err(RcsError::Live(format!("{path} is not a collection")));
            }
            meta = Some(res.metadata());
            Ok(())
        })?;

        let meta = meta.ok_or_else(|| RcsError::Live(format!("{path} yielded no metadata")))?;
        self.write_revision(&uuid, ResourceKind::Collection, None, path, log_ref, meta)
    }

    /// Record that the resource no longer exists
    pub fn capture_tombstone(&self, uuid: &str, uri: &str, log_ref: &str) -> Result<Revision> {
        self.write_revision(uuid, ResourceKind::Tombstone, None, uri, log_ref, ResourceMeta::default())
    }

    fn write_revision(
        &self,
        uuid: &str,
        kind: ResourceKind,
        hash: Option<rcs_core::ContentHash>,
        path: &str,
        log_ref: &str,
        meta: ResourceMeta,
    ) -> Result<Revision> {
        let parent_uuid = parent_path(path).and_then(|p| self.registry.uuid_for(p));
        let (revision_id, dir) = self.layout.allocate_revision_dir(uuid)?;

        let revision = Revision {
            uuid: uuid.to_string(),
            revision_id,
            kind,
            hash,
            log_path: log_ref.to_string(),
            file_name: file_name(path).to_string(),
            file_path: path.to_string(),
            parent_uuid,
            mime_type: meta.mime_type,
            created: meta.created,
            last_modified: meta.last_modified,
            permission: meta.permission,
            extension: meta.extension,
        };
        revision.write_to_dir(&dir)?;
        Ok(revision)
    }

    /// Re-materialize a revision into the live store
    ///
    /// All live-store writes for the resource happen inside one transaction;
    /// a failure aborts this resource's restore only.
    pub fn restore(&self, revision: &Revision, options: &RestoreOptions) -> Result<RestoreOutcome> {
        let path = self
            .registry
            .path_for(&revision.uuid)
            .unwrap_or_else(|| revision.file_path.clone());

        match revision.kind {
            ResourceKind::Tombstone => {
                self.live.with_transaction(&mut || self.live.remove(&path))?;
                Ok(RestoreOutcome::Removed)
            }
            ResourceKind::Collection => {
                let meta = revision_meta(revision);
                self.live.with_transaction(&mut || {
                    self.live.create_collection(&path)?;
                    self.live.set_metadata(&path, &meta)
                })?;
                self.registry.bind(&revision.uuid, &path);
                Ok(RestoreOutcome::Unknown)
            }
            ResourceKind::Xml | ResourceKind::Binary => {
                self.restore_document(revision, &path, options)
            }
        }
    }

    fn restore_document(
        &self,
        revision: &Revision,
        path: &str,
        options: &RestoreOptions,
    ) -> Result<RestoreOutcome> {
        // Recompute the live digest through the same streaming path used at
        // capture time. None = absent live resource or a kind we cannot
        // serialize for comparison.
        let mut live_hash = None;
        self.live.with_read_lock(path, &mut |res| {
            if let Some(res) = res {
                if res.kind() != LiveKind::Collection {
                    let mut hasher = HashingWriter::new(std::io::sink());
                    res.serialize_to(&mut hasher)?;
                    hasher.flush().map_err(|e| RcsError::Live(e.to_string()))?;
                    let (_, hash, _) = hasher.finish();
                    live_hash = Some(hash);
                }
            }
            Ok(())
        })?;

        let meta = revision_meta(revision);

        match (live_hash, revision.hash) {
            (Some(live), Some(stored)) if live == stored => {
                // Content already matches: reapply metadata only, never
                // rewrite the blob.
                self.live.with_transaction(&mut || {
                    self.live.set_metadata(path, &meta)?;
                    if options.reindex_on_equal {
                        self.live.reindex(path)?;
                    }
                    Ok(())
                })?;
                Ok(RestoreOutcome::Equal)
            }
            (Some(_), Some(_)) => {
                self.replace_from_blob(revision, path, &meta)?;
                Ok(RestoreOutcome::Different)
            }
            _ => {
                self.replace_from_blob(revision, path, &meta)?;
                Ok(RestoreOutcome::Unknown)
            }
        }
    }

    fn replace_from_blob(&self, revision: &Revision, path: &str, meta: &ResourceMeta) -> Result<()> {
        let stored = revision.hash.ok_or_else(|| {
            RcsError::Identity(format!(
                "revision {}/{} records no content digest",
                revision.uuid, revision.revision_id
            ))
        })?;

        // Digest-verified read; corruption surfaces here, before any live
        // mutation.
        let data = self.blobs.read(&stored)?;
        let live_kind = match revision.kind {
            ResourceKind::Xml => LiveKind::XmlDocument,
            _ => LiveKind::BinaryDocument,
        };

        self.live.with_transaction(&mut || {
            self.live.create_or_replace(path, live_kind, &mut &data[..])?;
            // Metadata goes on after the upload: the live store may run
            // post-processing on stored content that would clobber
            // earlier-applied metadata.
            self.live.set_metadata(path, meta)?;
            self.live.reindex(path)
        })?;

        self.registry.bind(&revision.uuid, path);
        Ok(())
    }
}

/// Metadata carried by a revision, in live-store form
fn revision_meta(revision: &Revision) -> ResourceMeta {
    ResourceMeta {
        mime_type: revision.mime_type.clone(),
        created: revision.created,
        last_modified: revision.last_modified,
        permission: revision.permission.clone(),
        extension: revision.extension.clone(),
    }
}

/// Containing collection path, if any ("/db/a/x.xml" -> "/db/a")
fn parent_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", _)) | None => None,
        Some((parent, _)) => Some(parent),
    }
}

/// Last path segment ("/db/a/x.xml" -> "x.xml")
fn file_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/db/a/x.xml"), Some("/db/a"));
        assert_eq!(parent_path("/db"), None);
        assert_eq!(parent_path("db"), None);
        assert_eq!(parent_path("/db/a/"), Some("/db"));
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("/db/a/x.xml"), "x.xml");
        assert_eq!(file_name("/db/a/"), "a");
        assert_eq!(file_name("x"), "x");
    }
}
