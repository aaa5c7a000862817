//! Per-resource revision chains
//!
//! All revisions of one uuid live under its sharded directory, one folder
//! per revision keyed by a strictly-increasing numeric id. The chain is
//! rebuilt from the directory on demand; the current revision is the one
//! with the numerically largest id.

use crate::revision::Revision;
use rcs_core::{RcsError, Result, StoreLayout};
use std::path::PathBuf;

/// Read-side view over one resource's revision chain
pub struct ResourceHistory {
    uuid: String,
    dir: PathBuf,
}

impl ResourceHistory {
    /// Bind a history view to one uuid
    pub fn new(layout: &StoreLayout, uuid: &str) -> Self {
        Self {
            uuid: uuid.to_string(),
            dir: layout.uuid_dir(uuid),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// All revision ids, newest first
    pub fn revision_ids(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(RcsError::io(&self.dir, e)),
        };

        for entry in entries {
            let entry = entry.map_err(|e| RcsError::io(&self.dir, e))?;
            match entry.file_name().to_string_lossy().parse::<u64>() {
                Ok(id) => ids.push(id),
                Err(_) => {
                    tracing::warn!(
                        uuid = %self.uuid,
                        name = %entry.file_name().to_string_lossy(),
                        "skipping non-numeric entry in revision dir"
                    );
                }
            }
        }

        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    /// All revisions, newest first
    ///
    /// An unreadable revision folder is skipped with a warning rather than
    /// failing the whole chain.
    pub fn revisions(&self) -> Result<Vec<Revision>> {
        let mut out = Vec::new();
        for id in self.revision_ids()? {
            match Revision::read_from_dir(&self.dir.join(id.to_string()), id) {
                Ok(rev) => out.push(rev),
                Err(e) => {
                    tracing::warn!(uuid = %self.uuid, revision = id, error = %e, "skipping unreadable revision");
                }
            }
        }
        Ok(out)
    }

    /// The revision with the numerically largest id, if any
    pub fn latest(&self) -> Result<Option<Revision>> {
        for id in self.revision_ids()? {
            match Revision::read_from_dir(&self.dir.join(id.to_string()), id) {
                Ok(rev) => return Ok(Some(rev)),
                Err(e) => {
                    tracing::warn!(uuid = %self.uuid, revision = id, error = %e, "skipping unreadable revision");
                }
            }
        }
        Ok(None)
    }

    /// Load one specific revision by id
    pub fn revision(&self, id: u64) -> Result<Option<Revision>> {
        let dir = self.dir.join(id.to_string());
        if !dir.exists() {
            return Ok(None);
        }
        Revision::read_from_dir(&dir, id).map(Some)
    }

    /// Whether the resource has any recorded history
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.revision_ids()?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::{Permission, ResourceKind};
    use rcs_core::StoreConfig;
    use tempfile::TempDir;

    fn bare_revision(uuid: &str, revision_id: u64) -> Revision {
        Revision {
            uuid: uuid.to_string(),
            revision_id,
            kind: ResourceKind::Collection,
            hash: None,
            log_path: "snapshots/2026-08/x".to_string(),
            file_name: "a".to_string(),
            file_path: "/db/a".to_string(),
            parent_uuid: None,
            mime_type: String::new(),
            created: 0,
            last_modified: 0,
            permission: Permission::default(),
            extension: Vec::new(),
        }
    }

    #[test]
    fn test_empty_history() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let layout = StoreLayout::open(temp.path(), StoreConfig::default())?;

        let history = ResourceHistory::new(&layout, "never-seen-uuid");
        assert!(history.is_empty()?);
        assert!(history.latest()?.is_none());
        assert!(history.revisions()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_revisions_are_newest_first() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let layout = StoreLayout::open(temp.path(), StoreConfig::default())?;
        let uuid = "aaaabbbb-hist";

        let mut ids = Vec::new();
        for _ in 0..3 {
            let (id, dir) = layout.allocate_revision_dir(uuid)?;
            bare_revision(uuid, id).write_to_dir(&dir)?;
            ids.push(id);
        }

        let history = ResourceHistory::new(&layout, uuid);
        let got: Vec<u64> = history.revisions()?.iter().map(|r| r.revision_id).collect();

        let mut expected = ids.clone();
        expected.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(got, expected);

        // Strictly decreasing, and latest equals the maximum.
        assert!(got.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(history.latest()?.unwrap().revision_id, *ids.iter().max().unwrap());
        Ok(())
    }

    #[test]
    fn test_unreadable_revision_is_skipped() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let layout = StoreLayout::open(temp.path(), StoreConfig::default())?;
        let uuid = "ccccdddd-hist";

        let (good_id, good_dir) = layout.allocate_revision_dir(uuid)?;
        bare_revision(uuid, good_id).write_to_dir(&good_dir)?;

        let (bad_id, bad_dir) = layout.allocate_revision_dir(uuid)?;
        std::fs::write(bad_dir.join(crate::revision::METADATA_FILE), "not xml at all <")?;

        let history = ResourceHistory::new(&layout, uuid);
        let revisions = history.revisions()?;
        assert_eq!(revisions.len(), 1);
        assert_eq!(revisions[0].revision_id, good_id);
        assert!(history.revision(bad_id).is_err());
        Ok(())
    }
}
