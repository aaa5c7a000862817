//! Deduplicating, content-addressed blob storage
//!
//! Blobs are stored verbatim at a path derived from their SHA-512 digest.
//! Ingest streams through a digest accumulator into a scratch file and only
//! moves the file into place (atomic rename) once the full write has
//! succeeded, so a partially-written blob is never visible under its digest
//! name. Writing an already-present digest is a no-op.

use crate::error::{RcsError, Result};
use crate::hash::{hash_reader, ContentHash, HashingWriter};
use crate::layout::StoreLayout;
use dashmap::DashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;

/// Content-addressed blob store rooted at `hashes/`
pub struct BlobStore {
    /// Root directory for blob storage (`<store>/hashes`)
    root: PathBuf,
    /// Scratch directory for in-flight ingests (`<store>/tmp`)
    tmp: PathBuf,
    /// Presence cache: digests known to be on disk
    present: DashMap<ContentHash, ()>,
}

impl BlobStore {
    /// Create a blob store over the given layout's directories
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            root: layout.hashes_dir(),
            tmp: layout.tmp_dir(),
            present: DashMap::new(),
        }
    }

    /// Stream a payload into the store, returning its digest
    ///
    /// The input is hashed while being written to a scratch file; the final
    /// sharded location is only claimed after the write fully succeeds. If
    /// the digest already exists the scratch file is deleted instead of
    /// overwriting (dedup short-circuit). An I/O error mid-stream removes
    /// the scratch file and leaves no trace in the store.
    pub fn put<R: Read>(&self, mut reader: R) -> Result<ContentHash> {
        let temp_path = self.tmp.join(format!("{}-ingest", uuid::Uuid::new_v4()));

        let temp_file = File::create(&temp_path).map_err(|e| RcsError::io(&temp_path, e))?;
        let mut writer = HashingWriter::new(temp_file);

        let streamed = io::copy(&mut reader, &mut writer).and_then(|_| writer.flush());
        if let Err(e) = streamed {
            let _ = fs::remove_file(&temp_path);
            return Err(RcsError::io(&temp_path, e));
        }
        let (temp_file, hash, _written) = writer.finish();

        if let Err(e) = temp_file.sync_all() {
            let _ = fs::remove_file(&temp_path);
            return Err(RcsError::io(&temp_path, e));
        }
        drop(temp_file);

        let blob_path = self.blob_path(&hash);
        if blob_path.exists() {
            // Already stored; identical content, so the scratch copy is junk.
            fs::remove_file(&temp_path).map_err(|e| RcsError::io(&temp_path, e))?;
            self.present.insert(hash, ());
            return Ok(hash);
        }

        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent).map_err(|e| RcsError::io(parent, e))?;
        }
        fs::rename(&temp_path, &blob_path).map_err(|e| RcsError::io(&blob_path, e))?;

        // Fsync parent directory for durability (best effort, may fail on
        // some filesystems).
        if let Some(parent) = blob_path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        self.present.insert(hash, ());
        Ok(hash)
    }

    /// Convenience ingest of an in-memory payload
    pub fn put_bytes(&self, data: &[u8]) -> Result<ContentHash> {
        self.put(data)
    }

    /// Open a blob for streaming reads
    pub fn get(&self, hash: &ContentHash) -> Result<File> {
        let path = self.blob_path(hash);
        File::open(&path).map_err(|e| RcsError::io(&path, e))
    }

    /// Read a blob fully, verifying its digest
    ///
    /// A digest mismatch means the stored file is corrupt and surfaces as an
    /// integrity error.
    pub fn read(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        let path = self.blob_path(hash);
        let data = fs::read(&path).map_err(|e| RcsError::io(&path, e))?;

        let (actual, _) = hash_reader(&data[..])?;
        if actual != *hash {
            return Err(RcsError::Integrity {
                expected: hash.to_hex(),
                computed: actual.to_hex(),
            });
        }
        Ok(data)
    }

    /// Check whether a digest is present in the store
    pub fn contains(&self, hash: &ContentHash) -> bool {
        if self.present.contains_key(hash) {
            return true;
        }
        if self.blob_path(hash).exists() {
            self.present.insert(*hash, ());
            return true;
        }
        false
    }

    /// Sharded filesystem path for a digest: `<h0:4>/<h4:8>/<hash>`
    pub fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join(&hex[0..4]).join(&hex[4..8]).join(hex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use crate::layout::StoreConfig;
    use tempfile::TempDir;

    fn open_store(temp: &TempDir) -> (StoreLayout, BlobStore) {
        let layout = StoreLayout::open(temp.path(), StoreConfig::default()).unwrap();
        let store = BlobStore::new(&layout);
        (layout, store)
    }

    #[test]
    fn test_put_and_read_roundtrip() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let (_layout, store) = open_store(&temp);

        let data = b"<root><child/></root>";
        let hash = store.put_bytes(data)?;

        assert_eq!(hash, hash_bytes(data));
        assert!(store.contains(&hash));
        assert_eq!(store.read(&hash)?, data);
        Ok(())
    }

    #[test]
    fn test_put_is_deduplicating() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let (_layout, store) = open_store(&temp);

        let data = vec![7u8; 32 * 1024];
        let hash1 = store.put_bytes(&data)?;
        let path = store.blob_path(&hash1);
        let mtime1 = std::fs::metadata(&path)?.modified()?;

        let hash2 = store.put_bytes(&data)?;
        assert_eq!(hash1, hash2);

        // Exactly one file on disk, untouched by the second put.
        let mtime2 = std::fs::metadata(&path)?.modified()?;
        assert_eq!(mtime1, mtime2);

        let files: Vec<_> = walk_files(&temp.path().join("hashes"));
        assert_eq!(files.len(), 1);
        Ok(())
    }

    #[test]
    fn test_put_leaves_no_scratch_behind() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let (layout, store) = open_store(&temp);

        store.put_bytes(b"payload")?;
        store.put_bytes(b"payload")?;

        assert_eq!(std::fs::read_dir(layout.tmp_dir())?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_read_detects_corruption() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let (_layout, store) = open_store(&temp);

        let hash = store.put_bytes(b"pristine")?;
        std::fs::write(store.blob_path(&hash), b"tampered")?;

        let err = store.read(&hash).unwrap_err();
        assert!(matches!(err, RcsError::Integrity { .. }));
        Ok(())
    }

    #[test]
    fn test_get_missing_blob_is_io_error() {
        let temp = TempDir::new().unwrap();
        let (_layout, store) = open_store(&temp);

        let hash = hash_bytes(b"never stored");
        assert!(!store.contains(&hash));
        assert!(matches!(store.get(&hash), Err(RcsError::Io { .. })));
    }

    fn walk_files(dir: &std::path::Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(d) = stack.pop() {
            for entry in std::fs::read_dir(&d).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    out.push(path);
                }
            }
        }
        out
    }
}
