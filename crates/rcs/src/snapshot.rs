//! Breadth-first snapshot walker
//!
//! Traverses a live collection subtree and produces one change entry per
//! visited document and subcollection. The walk keeps an explicit frontier
//! and never descends while a lock is held: each frontier collection is
//! read-locked only long enough to enumerate its direct children, and each
//! document capture takes its own short read lock afterwards. This
//! lock-release-before-descent discipline avoids deadlocking against
//! writers that lock child-then-parent elsewhere in the live store.

use crate::live::RcsHandler;
use crate::log::{Change, ChangeOp};
use crate::restore::Engine;
use rcs_core::{RcsError, Result};

/// Walks a collection subtree, capturing one revision per resource
pub struct SnapshotWalker<'a> {
    engine: &'a Engine<'a>,
    handler: &'a dyn RcsHandler,
}

impl<'a> SnapshotWalker<'a> {
    pub fn new(engine: &'a Engine<'a>, handler: &'a dyn RcsHandler) -> Self {
        Self { engine, handler }
    }

    /// Snapshot the subtree rooted at `root`
    ///
    /// A failure against the root collection is fatal; failures against any
    /// other resource become error-bearing entries and do not stop the walk.
    pub fn walk(&self, root: &str, log_ref: &str) -> Result<Vec<Change>> {
        let mut changes = Vec::new();

        // The root's own metadata revision comes first; if even that cannot
        // be captured there is nothing to walk.
        let root_change = self.capture_collection_entry(root, log_ref);
        if let Some(error) = &root_change.error {
            return Err(RcsError::Live(format!("cannot snapshot {root}: {error}")));
        }
        self.handler.entry_written(&root_change);
        changes.push(root_change);

        let mut frontier = vec![root.to_string()];
        while !frontier.is_empty() {
            let mut next_frontier = Vec::new();

            for collection in &frontier {
                let mut documents = Vec::new();
                let mut subcollections = Vec::new();

                // Enumeration happens under the collection's read lock; the
                // scoped closure guarantees release before any capture below.
                let enumerated = self.engine.live.with_read_lock(collection, &mut |res| {
                    let res = res.ok_or_else(|| {
                        RcsError::Identity(format!("collection {collection} vanished mid-walk"))
                    })?;
                    documents = res.child_documents()?;
                    subcollections = res.child_collections()?;
                    Ok(())
                });

                if let Err(error) = enumerated {
                    self.handler.resource_error(collection, &error);
                    let change = Change {
                        op: ChangeOp::Update,
                        uuid: self.engine.registry.uuid_for(collection),
                        uri: Some(collection.clone()),
                        revision_path: None,
                        error: Some(error.to_string()),
                    };
                    self.handler.entry_written(&change);
                    changes.push(change);
                    continue;
                }

                for document in documents {
                    let change = self.capture_document_entry(&document, log_ref);
                    self.handler.entry_written(&change);
                    changes.push(change);
                }

                for subcollection in subcollections {
                    let change = self.capture_collection_entry(&subcollection, log_ref);
                    self.handler.entry_written(&change);
                    changes.push(change);
                    // Descend even past a failed metadata capture; the
                    // children may still be readable.
                    next_frontier.push(subcollection);
                }
            }

            frontier = next_frontier;
        }

        Ok(changes)
    }

    fn capture_document_entry(&self, path: &str, log_ref: &str) -> Change {
        match self.engine.capture_document(path, log_ref) {
            Ok(revision) => Change {
                op: ChangeOp::Update,
                uuid: Some(revision.uuid.clone()),
                uri: Some(path.to_string()),
                revision_path: Some(
                    self.engine
                        .layout
                        .revision_dir(&revision.uuid, revision.revision_id),
                ),
                error: None,
            },
            Err(error) => {
                self.handler.resource_error(path, &error);
                Change {
                    op: ChangeOp::Update,
                    uuid: self.engine.registry.uuid_for(path),
                    uri: Some(path.to_string()),
                    revision_path: None,
                    error: Some(error.to_string()),
                }
            }
        }
    }

    fn capture_collection_entry(&self, path: &str, log_ref: &str) -> Change {
        match self.engine.capture_collection(path, log_ref) {
            Ok(revision) => Change {
                op: ChangeOp::Update,
                uuid: Some(revision.uuid.clone()),
                uri: Some(path.to_string()),
                revision_path: Some(
                    self.engine
                        .layout
                        .revision_dir(&revision.uuid, revision.revision_id),
                ),
                error: None,
            },
            Err(error) => {
                self.handler.resource_error(path, &error);
                Change {
                    op: ChangeOp::Update,
                    uuid: self.engine.registry.uuid_for(path),
                    uri: Some(path.to_string()),
                    revision_path: None,
                    error: Some(error.to_string()),
                }
            }
        }
    }
}
