//! Revision control subsystem for a native XML database
//!
//! Snapshots documents and collections from a live store into a
//! content-addressed, append-only history on disk, and restores any past
//! state back into the live store. This crate provides:
//! - Revision records and their on-disk XML metadata files
//! - Per-resource revision chains keyed by stable surrogate uuids
//! - Immutable commit/snapshot logs and the `CommitWriter` protocol
//! - The breadth-first snapshot walker
//! - The capture / verify-and-restore engine
//! - The top-level `RevisionStoreManager`
//!
//! The live document store itself is out of scope and reached only through
//! the collaborator traits in [`live`].

pub mod history;
pub mod live;
pub mod log;
pub mod manager;
pub mod restore;
pub mod revision;
pub mod snapshot;

mod xml;

// Re-exports
pub use history::ResourceHistory;
pub use live::{
    IdRegistry, LiveKind, LiveResource, LiveStore, MemoryLiveStore, MemoryRegistry, NoopHandler,
    RcsHandler, ResourceMeta,
};
pub use log::{Change, ChangeLog, ChangeOp, CommitWriter};
pub use manager::RevisionStoreManager;
pub use rcs_core::{BlobStore, ContentHash, LogId, LogKind, RcsError, StoreConfig, StoreLayout};
pub use restore::{RestoreOptions, RestoreOutcome};
pub use revision::{AclEntry, Permission, ResourceKind, Revision};

/// Result type for revision store operations
pub type Result<T> = rcs_core::Result<T>;
