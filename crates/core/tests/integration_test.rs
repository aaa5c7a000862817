//! Integration tests for the storage primitives

use rcs_core::{hash_bytes, BlobStore, LogKind, StoreConfig, StoreLayout};

#[test]
fn test_full_storage_pipeline() -> anyhow::Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let layout = StoreLayout::open(temp_dir.path(), StoreConfig::default())?;
    let blobs = BlobStore::new(&layout);

    // Ingest some payloads
    let blob1_data = b"<doc><title>first</title></doc>".to_vec();
    let blob2_data = b"<doc><title>second</title></doc>".to_vec();
    let blob3_data = vec![0u8; 64 * 1024];

    let hash1 = blobs.put_bytes(&blob1_data)?;
    let hash2 = blobs.put_bytes(&blob2_data)?;
    let hash3 = blobs.put(&blob3_data[..])?;

    assert_eq!(hash1, hash_bytes(&blob1_data));
    assert_ne!(hash1, hash2);

    // Verified reads
    assert_eq!(blobs.read(&hash1)?, blob1_data);
    assert_eq!(blobs.read(&hash2)?, blob2_data);
    assert_eq!(blobs.read(&hash3)?, blob3_data);

    // Revision folders for two uuids, then a commit and a snapshot id
    let (rev_a, dir_a) = layout.allocate_revision_dir("feedbeef-0001")?;
    let (rev_b, _) = layout.allocate_revision_dir("feedbeef-0001")?;
    assert!(rev_a < rev_b);
    assert!(dir_a.starts_with(temp_dir.path().join("uuids/feed/beef")));

    let (commit_id, commit_path) = layout.allocate_log_id(LogKind::Commit)?;
    let (snapshot_id, snapshot_path) = layout.allocate_log_id(LogKind::Snapshot)?;
    assert!(commit_path.is_file());
    assert!(snapshot_path.is_file());
    assert_eq!(commit_id.shard(), snapshot_id.shard());

    // Nothing in scratch once ingests are done
    assert_eq!(std::fs::read_dir(layout.tmp_dir())?.count(), 0);
    Ok(())
}

#[test]
fn test_reopen_preserves_store_and_purges_scratch() -> anyhow::Result<()> {
    let temp_dir = tempfile::tempdir()?;

    let hash = {
        let layout = StoreLayout::open(temp_dir.path(), StoreConfig::default())?;
        let blobs = BlobStore::new(&layout);
        let hash = blobs.put_bytes(b"survives reopen")?;
        // Simulate a crash mid-ingest.
        std::fs::write(layout.tmp_dir().join("dangling-ingest"), b"partial")?;
        hash
    };

    let layout = StoreLayout::open(temp_dir.path(), StoreConfig::default())?;
    let blobs = BlobStore::new(&layout);

    assert!(blobs.contains(&hash));
    assert_eq!(blobs.read(&hash)?, b"survives reopen");
    assert_eq!(std::fs::read_dir(layout.tmp_dir())?.count(), 0);
    Ok(())
}
