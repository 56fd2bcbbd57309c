//! Entry lifecycle tests against a plain (non-tile) owning cache.
//!
//! These drive the public entry API end-to-end: hash-derived backing
//! file naming, RAM fallback, the single-allocation guarantee under
//! concurrency, and the notification protocol that keeps a host's
//! accounting balanced.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use cache_storage::{
    CacheEntry, CacheHost, EntryKey, EntryParams, StorageMode, StorageTally, TimeValue,
};
use tempfile::tempdir;

struct TestKey {
    hash: u64,
    time: TimeValue,
}

impl EntryKey for TestKey {
    fn hash_key(&self) -> u64 {
        self.hash
    }

    fn time(&self) -> TimeValue {
        self.time
    }
}

/// Plain disk cache double: names backing files under a root directory
/// and records every notification.
///
/// Mapped entries are accounted as RAM while resident; the
/// ram-to-disk storage change on deallocation moves the bytes to the
/// disk column, mirroring how a cache tracks files that stay behind.
struct PlainCache {
    root: PathBuf,
    tally: StorageTally,
    allocated: Mutex<Vec<(TimeValue, usize, StorageMode)>>,
    destroyed: Mutex<Vec<(TimeValue, usize, StorageMode)>>,
    storage_changed: Mutex<Vec<(StorageMode, StorageMode, usize)>>,
    size_changed: Mutex<Vec<(usize, usize)>>,
    memory_deallocated: AtomicUsize,
    files_closed: AtomicUsize,
}

impl PlainCache {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            tally: StorageTally::new(),
            allocated: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
            storage_changed: Mutex::new(Vec::new()),
            size_changed: Mutex::new(Vec::new()),
            memory_deallocated: AtomicUsize::new(0),
            files_closed: AtomicUsize::new(0),
        }
    }
}

impl CacheHost for PlainCache {
    fn cache_path(&self) -> PathBuf {
        self.root.clone()
    }

    fn is_tile_cache(&self) -> bool {
        false
    }

    fn notify_entry_size_changed(&self, old_size: usize, new_size: usize) {
        self.size_changed.lock().unwrap().push((old_size, new_size));
        self.tally.resize(StorageMode::Ram, old_size, new_size);
    }

    fn notify_entry_allocated(&self, time: TimeValue, size: usize, storage: StorageMode) {
        self.allocated.lock().unwrap().push((time, size, storage));
        // mapped files are resident while allocated
        let column = if storage == StorageMode::Disk {
            StorageMode::Ram
        } else {
            storage
        };
        self.tally.add(column, size);
    }

    fn notify_entry_destroyed(&self, time: TimeValue, size: usize, storage: StorageMode) {
        self.destroyed.lock().unwrap().push((time, size, storage));
        self.tally.sub(storage, size);
    }

    fn notify_entry_storage_changed(
        &self,
        old_storage: StorageMode,
        new_storage: StorageMode,
        _time: TimeValue,
        size: usize,
    ) {
        self.storage_changed
            .lock()
            .unwrap()
            .push((old_storage, new_storage, size));
        self.tally.migrate(old_storage, new_storage, size);
    }

    fn notify_memory_deallocated(&self) {
        self.memory_deallocated.fetch_add(1, Ordering::SeqCst);
    }

    fn backing_file_closed(&self) {
        self.files_closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn disk_entry(
    hash: u64,
    count: usize,
    host: &Arc<dyn CacheHost>,
) -> CacheEntry<u8, TestKey> {
    CacheEntry::new(
        TestKey { hash, time: 0.0 },
        Arc::new(EntryParams::new(StorageMode::Disk, count)),
        Some(host),
    )
}

#[test]
fn test_disk_entry_uses_hash_fanout_path() {
    let dir = tempdir().expect("tempdir failed");
    let cache = Arc::new(PlainCache::new(dir.path().to_path_buf()));
    let host: Arc<dyn CacheHost> = cache.clone();

    let entry = disk_entry(0x1A2B3C, 64, &host);
    entry.allocate_memory().expect("allocate failed");

    let expected = dir.path().join("1a").join("2b3c.tc");
    assert_eq!(entry.file_path(), Some(expected.clone()));
    assert!(expected.exists());
    assert_eq!(entry.storage_mode(), StorageMode::Disk);
    assert_eq!(entry.data_size(), 64);

    let allocated = cache.allocated.lock().unwrap();
    assert_eq!(allocated.as_slice(), &[(0.0, 64, StorageMode::Disk)]);
}

#[test]
fn test_same_hash_gets_collision_suffix() {
    let dir = tempdir().expect("tempdir failed");
    let cache = Arc::new(PlainCache::new(dir.path().to_path_buf()));
    let host: Arc<dyn CacheHost> = cache.clone();

    let first = disk_entry(0x1A2B3C, 16, &host);
    first.allocate_memory().expect("first allocate failed");

    let second = disk_entry(0x1A2B3C, 16, &host);
    second.allocate_memory().expect("second allocate failed");

    let third = disk_entry(0x1A2B3C, 16, &host);
    third.allocate_memory().expect("third allocate failed");

    assert_eq!(
        first.file_path(),
        Some(dir.path().join("1a").join("2b3c.tc"))
    );
    assert_eq!(
        second.file_path(),
        Some(dir.path().join("1a").join("2b3c_0.tc"))
    );
    assert_eq!(
        third.file_path(),
        Some(dir.path().join("1a").join("2b3c_1.tc"))
    );
}

#[test]
fn test_unwritable_fanout_falls_back_to_ram() {
    let dir = tempdir().expect("tempdir failed");
    // block the fan-out directory with a plain file
    std::fs::write(dir.path().join("1a"), b"in the way").expect("write failed");

    let cache = Arc::new(PlainCache::new(dir.path().to_path_buf()));
    let host: Arc<dyn CacheHost> = cache.clone();

    let entry = disk_entry(0x1A2B3C, 32, &host);
    entry.allocate_memory().expect("fallback should absorb the failure");

    assert_eq!(entry.storage_mode(), StorageMode::Ram);
    assert!(entry.file_path().is_none());
    assert_eq!(entry.data_size(), 32);

    let allocated = cache.allocated.lock().unwrap();
    assert_eq!(allocated.as_slice(), &[(0.0, 32, StorageMode::Ram)]);
}

#[test]
fn test_concurrent_allocation_happens_once() {
    let dir = tempdir().expect("tempdir failed");
    let cache = Arc::new(PlainCache::new(dir.path().to_path_buf()));
    let host: Arc<dyn CacheHost> = cache.clone();

    let allocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&allocations);
    let entry = Arc::new(
        disk_entry(0xF00D, 128, &host).with_allocation_hook(Box::new(move |_buffer| {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    );

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let entry = Arc::clone(&entry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                entry.allocate_memory().expect("allocate failed");
                // every caller observes the entry allocated afterwards
                assert!(entry.is_allocated());
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread panicked");
    }

    assert_eq!(allocations.load(Ordering::SeqCst), 1);
    assert_eq!(cache.allocated.lock().unwrap().len(), 1);
}

#[test]
fn test_accounting_balances_over_full_lifecycle() {
    let dir = tempdir().expect("tempdir failed");
    let cache = Arc::new(PlainCache::new(dir.path().to_path_buf()));
    let host: Arc<dyn CacheHost> = cache.clone();

    let entry = disk_entry(0xBEEF, 64, &host);
    entry.allocate_memory().expect("allocate failed");
    assert_eq!(cache.tally.snapshot().ram_bytes, 64);

    // releasing the mapping moves the bytes to the disk column
    entry.deallocate().expect("deallocate failed");
    let snapshot = cache.tally.snapshot();
    assert_eq!(snapshot.ram_bytes, 0);
    assert_eq!(snapshot.disk_bytes, 64);
    assert!(cache.memory_deallocated.load(Ordering::SeqCst) >= 1);
    assert_eq!(
        cache.storage_changed.lock().unwrap().as_slice(),
        &[(StorageMode::Ram, StorageMode::Disk, 64)]
    );

    // removing the backing file clears the disk column
    entry
        .remove_any_backing_file()
        .expect("remove backing file failed");
    assert_eq!(cache.files_closed.load(Ordering::SeqCst), 1);
    assert_eq!(cache.tally.snapshot().total_bytes(), 0);

    let destroyed = cache.destroyed.lock().unwrap();
    assert_eq!(destroyed.as_slice(), &[(0.0, 64, StorageMode::Disk)]);
}

#[test]
fn test_ram_entry_reports_destroy() {
    let dir = tempdir().expect("tempdir failed");
    let cache = Arc::new(PlainCache::new(dir.path().to_path_buf()));
    let host: Arc<dyn CacheHost> = cache.clone();

    let entry: CacheEntry<f32, TestKey> = CacheEntry::new(
        TestKey {
            hash: 0xCAFE,
            time: 12.0,
        },
        Arc::new(EntryParams::new(StorageMode::Ram, 100)),
        Some(&host),
    );

    entry.allocate_memory().expect("allocate failed");
    assert_eq!(cache.tally.snapshot().ram_bytes, 400);

    entry.deallocate().expect("deallocate failed");
    let destroyed = cache.destroyed.lock().unwrap();
    assert_eq!(destroyed.as_slice(), &[(12.0, 400, StorageMode::Ram)]);
    assert_eq!(cache.tally.snapshot().total_bytes(), 0);
}

#[test]
fn test_restore_reports_none_to_disk_change() {
    let dir = tempdir().expect("tempdir failed");
    let cache = Arc::new(PlainCache::new(dir.path().to_path_buf()));
    let host: Arc<dyn CacheHost> = cache.clone();

    let artifact = dir.path().join("1a").join("2b3c.tc");
    std::fs::create_dir_all(artifact.parent().unwrap()).expect("mkdir failed");
    std::fs::write(&artifact, vec![0u8; 48]).expect("write failed");

    let entry = disk_entry(0x1A2B3C, 48, &host);
    entry
        .restore_metadata_from_file(48, &artifact, 0)
        .expect("restore failed");

    assert_eq!(
        cache.storage_changed.lock().unwrap().as_slice(),
        &[(StorageMode::None, StorageMode::Disk, 48)]
    );
    assert!(cache.allocated.lock().unwrap().is_empty());
    assert_eq!(entry.file_path(), Some(artifact));
}

#[test]
fn test_resize_reports_size_change() {
    let dir = tempdir().expect("tempdir failed");
    let cache = Arc::new(PlainCache::new(dir.path().to_path_buf()));
    let host: Arc<dyn CacheHost> = cache.clone();

    let entry: CacheEntry<u8, TestKey> = CacheEntry::new(
        TestKey {
            hash: 0xABCD,
            time: 0.0,
        },
        Arc::new(EntryParams::new(StorageMode::Ram, 32)),
        Some(&host),
    );
    entry.allocate_memory().expect("allocate failed");
    entry.resize_storage(96).expect("resize failed");

    assert_eq!(cache.size_changed.lock().unwrap().as_slice(), &[(32, 96)]);
    assert_eq!(entry.data_size(), 96);
    assert_eq!(cache.tally.snapshot().ram_bytes, 96);
}

#[test]
fn test_entry_survives_host_teardown() {
    let dir = tempdir().expect("tempdir failed");
    let cache = Arc::new(PlainCache::new(dir.path().to_path_buf()));
    let host: Arc<dyn CacheHost> = cache.clone();

    let entry = disk_entry(0x77, 16, &host);
    entry.allocate_memory().expect("allocate failed");

    // the owning cache goes away first; the entry must tolerate it
    drop(host);
    drop(cache);

    entry.deallocate().expect("deallocate after host teardown failed");
    assert!(!entry.is_allocated());
}
