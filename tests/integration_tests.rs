//! Integration tests across storage backends and readers.

use std::sync::Arc;
use std::thread;

use kv_radix_cache::cache::{Cache, CacheBuilder, KvLayout, VersionAuthority};
use kv_radix_cache::config::{Config, StorageBackend};
use kv_radix_cache::storage::{open_store, DiskStore, MemoryStore, ObjectStore};

#[test]
fn test_disk_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let layout = KvLayout::new(16, 4, 8).unwrap();
    let authority = VersionAuthority::new();

    let meta = {
        let store = Arc::new(DiskStore::open(dir.path().to_path_buf(), 1 << 24, Some(3)).unwrap());
        let mut builder = CacheBuilder::new(layout, 128, store).unwrap();
        for t in 0..20 {
            let kv = vec![t as u8; layout.slot_bytes()];
            builder.update(&[0, t / 4], t, &kv).unwrap();
        }
        builder.seal(&authority).unwrap().meta().clone()
    };

    // Reopen the directory as a fresh store.
    let store = DiskStore::open(dir.path().to_path_buf(), 1 << 24, Some(3)).unwrap();
    let cache = Cache::resolve(&meta, &store).unwrap();
    assert_eq!(cache.len(), 20);
    for t in 0..20 {
        let state = cache.query(&[0, t / 4], t).unwrap();
        assert_eq!(state.layers(), 4);
        assert_eq!(state.layer(3).unwrap(), &[t as u8; 16][..]);
    }
}

#[test]
fn test_store_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Disk;
    config.storage.path = dir.path().join("objects");
    config.storage.zstd_compression = false;
    config.cache.tensor_nbytes = 4;
    config.cache.layer = 2;

    let store: Arc<dyn ObjectStore> = open_store(&config.storage).unwrap();
    let mut builder = CacheBuilder::from_config(&config.cache, store.clone()).unwrap();
    builder.update(&[1, 2], 3, &[5; 8]).unwrap();
    let cache = builder.seal(&VersionAuthority::new()).unwrap();

    let resolved = Cache::resolve(cache.meta(), &*store).unwrap();
    assert_eq!(resolved.query(&[1, 2], 3).unwrap().as_bytes(), &[5; 8]);
    assert!(dir.path().join("objects").is_dir());
}

#[test]
fn test_concurrent_readers() {
    let store = Arc::new(MemoryStore::new(1 << 24));
    let layout = KvLayout::new(4, 2, 4).unwrap();
    let mut builder = CacheBuilder::new(layout, 1024, store).unwrap();
    for t in 0..100 {
        builder.update(&[t % 7, t % 3], t, &[t as u8; 8]).unwrap();
    }
    let cache = Arc::new(builder.seal(&VersionAuthority::new()).unwrap());

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || {
                for t in 0..100 {
                    let state = cache.query(&[t % 7, t % 3], t).unwrap();
                    assert_eq!(state.as_bytes(), &[t as u8; 8]);
                    assert_eq!(cache.match_prefix(&[t % 7, t % 3, t, 1000]), 3);
                }
            })
        })
        .collect();
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn test_next_revision_does_not_touch_snapshot() {
    let store = Arc::new(MemoryStore::new(1 << 24));
    let layout = KvLayout::new(2, 2, 4).unwrap();
    let authority = VersionAuthority::new();

    let mut builder = CacheBuilder::new(layout, 64, store.clone()).unwrap();
    builder.update(&[1], 2, &[1; 4]).unwrap();
    builder.update(&[1], 3, &[2; 4]).unwrap();
    let cache = builder.seal(&authority).unwrap();

    let mut next = CacheBuilder::from_cache(&cache, store);
    next.update(&[1], 2, &[9; 4]).unwrap();
    next.update(&[4], 4, &[4; 4]).unwrap();
    next.remove(&[1], 3).unwrap();

    assert_eq!(cache.query(&[1], 2).unwrap().as_bytes(), &[1; 4]);
    assert_eq!(cache.query(&[1], 3).unwrap().as_bytes(), &[2; 4]);
    assert!(cache.query(&[4], 4).is_err());
    assert_eq!(next.query(&[1], 2).unwrap().as_bytes(), &[9; 4]);

    // Abandoning the revision leaves the published cache intact.
    next.close();
    assert_eq!(cache.query(&[1], 2).unwrap().as_bytes(), &[1; 4]);
    assert_eq!(authority.published(), cache.version());
}
