//! Revision store core - content-addressed storage primitives
//!
//! This crate provides the foundational storage layer for the revision
//! control subsystem:
//! - SHA-512 hashing with streaming accumulators
//! - Deduplicating blob storage with atomic ingest
//! - On-disk store layout, scratch recovery, and id allocation

pub mod blob;
pub mod error;
pub mod hash;
pub mod layout;

// Re-export main types for convenience
pub use blob::BlobStore;
pub use error::{RcsError, Result};
pub use hash::{hash_bytes, hash_reader, ContentHash, HashingWriter};
pub use layout::{LogId, LogKind, StoreConfig, StoreLayout};
