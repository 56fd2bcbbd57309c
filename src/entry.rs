//! Cache entries: the externally-visible unit of caching.
//!
//! A [`CacheEntry`] ties together an identity key, a shared
//! [`EntryParams`] descriptor, one [`StorageBuffer`] and a weak
//! back-reference to the owning cache. It adds what the bare buffer
//! does not have: a per-entry reader/writer lock, the
//! at-most-one-allocation guarantee, hash-derived on-disk naming, and
//! the notification protocol that keeps cache-wide accounting correct.
//!
//! # Thread Safety
//!
//! Each entry owns an independent lock; unrelated entries never
//! contend. `allocate_memory` uses double-checked locking so concurrent
//! callers produce exactly one physical allocation and one allocation
//! notification. `data_size` never blocks: it try-locks and falls back
//! to an atomic snapshot of the last known size.

use std::hash::{BuildHasher, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::warn;
use parking_lot::RwLock;

use crate::buffer::{StorageBuffer, StorageMode};
use crate::error::{StorageError, StorageResult};
use crate::host::{CacheHost, TimeValue};
use crate::params::EntryParams;

/// Extension of hash-named backing files.
pub const CACHE_FILE_EXT: &str = "tc";

/// Identity of a cache entry: an immutable key reduced to a stable
/// 64-bit content hash, plus the frame time the entry belongs to.
pub trait EntryKey: Send + Sync {
    /// Stable content hash of the key. Equal keys hash equal across
    /// runs: the hash names the entry's backing file on disk.
    fn hash_key(&self) -> u64;

    /// Frame time of the entry, reported to accounting callbacks.
    fn time(&self) -> TimeValue {
        0.0
    }
}

/// Incremental hasher for building [`EntryKey::hash_key`]
/// implementations.
///
/// Wraps a fixed-seed hasher so the same key fields produce the same
/// hash in every process: on-disk names derived from the hash must be
/// reproducible across restarts.
pub struct KeyHasher {
    hasher: ahash::AHasher,
}

impl KeyHasher {
    /// Create a hasher with the crate's fixed seed.
    pub fn new() -> Self {
        // Seeds are arbitrary but must never change: they are baked
        // into every on-disk cache file name.
        let state = ahash::RandomState::with_seeds(
            0x51ab_97be_6d5b_41c3,
            0x3c91_07d2_aa85_64f9,
            0x8e44_2c5f_19b0_d7a6,
            0x27f8_6e03_c4d9_125b,
        );
        Self {
            hasher: state.build_hasher(),
        }
    }

    /// Mix in an unsigned integer.
    pub fn append_u64(&mut self, value: u64) {
        self.hasher.write_u64(value);
    }

    /// Mix in a signed integer.
    pub fn append_i64(&mut self, value: i64) {
        self.hasher.write_i64(value);
    }

    /// Mix in a float by its bit pattern.
    pub fn append_f64(&mut self, value: f64) {
        self.hasher.write_u64(value.to_bits());
    }

    /// Mix in raw bytes.
    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.hasher.write(bytes);
    }

    /// Mix in a string.
    pub fn append_str(&mut self, value: &str) {
        self.hasher.write(value.as_bytes());
    }

    /// Finish and return the 64-bit hash.
    pub fn finish(&self) -> u64 {
        self.hasher.finish()
    }
}

impl Default for KeyHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive the on-disk location of the entry with content hash `hash`
/// under the cache root.
///
/// The hash is rendered as lowercase hex (padded to three digits for
/// very small values); the first two characters become a one-level
/// fan-out subdirectory, the remainder the file stem:
/// `<root>/<2 hex chars>/<remaining hex>.<ext>`.
///
/// Pure: the same `(root, hash)` always yields the same path. The root
/// must be a non-empty, existing directory.
pub fn cache_file_path(root: &Path, hash: u64) -> StorageResult<PathBuf> {
    if root.as_os_str().is_empty() || !root.is_dir() {
        return Err(StorageError::InvalidCacheRoot);
    }

    let hex = if hash < 0x100 {
        format!("{hash:03x}")
    } else {
        format!("{hash:x}")
    };
    let (fan_out, stem) = hex.split_at(2);
    Ok(root.join(fan_out).join(format!("{stem}.{CACHE_FILE_EXT}")))
}

/// Derive a not-yet-existing on-disk location for `hash`: the plain
/// derived name when free, otherwise the first free `_0`, `_1`, …
/// suffixed variant (the very first collision gets `_0`).
pub fn collision_free_path(root: &Path, hash: u64) -> StorageResult<PathBuf> {
    let base = cache_file_path(root, hash)?;
    if !base.exists() {
        return Ok(base);
    }

    let dir = base.parent().expect("derived path always has a parent");
    let stem = base
        .file_stem()
        .and_then(|stem| stem.to_str())
        .expect("derived stem is always valid UTF-8");

    let mut index = 0u64;
    loop {
        let candidate = dir.join(format!("{stem}_{index}.{CACHE_FILE_EXT}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
        index += 1;
    }
}

/// Hook run right after a successful device allocation, while the
/// entry's write lock is still held. The seam for entry kinds that
/// initialize their freshly allocated storage.
pub type AllocationHook<T> = Box<dyn Fn(&mut StorageBuffer<T>) + Send + Sync>;

/// One cached artifact: key, descriptor, storage, and the owning-cache
/// back-reference.
///
/// Entries may be detached (no owning cache); every notification and
/// policy lookup tolerates an absent or already-dropped host.
pub struct CacheEntry<T: Copy + Default, K: EntryKey> {
    key: K,
    params: Arc<EntryParams>,
    host: Option<Weak<dyn CacheHost>>,
    buffer: RwLock<StorageBuffer<T>>,
    /// Last size reported by an allocation or release, for the
    /// non-blocking `data_size` fast path.
    cached_size: AtomicUsize,
    /// Sticky: remove the backing file during teardown.
    pending_removal: AtomicBool,
    on_allocated: Option<AllocationHook<T>>,
}

impl<T: Copy + Default, K: EntryKey> CacheEntry<T, K> {
    /// Create an entry with an unallocated buffer.
    ///
    /// `host` is the owning cache, held weakly; `None` creates a
    /// detached entry.
    pub fn new(key: K, params: Arc<EntryParams>, host: Option<&Arc<dyn CacheHost>>) -> Self {
        Self {
            key,
            params,
            host: host.map(Arc::downgrade),
            buffer: RwLock::new(StorageBuffer::new()),
            cached_size: AtomicUsize::new(0),
            pending_removal: AtomicBool::new(false),
            on_allocated: None,
        }
    }

    /// Install a post-allocation hook, run under the write lock right
    /// after the device allocation succeeds.
    pub fn with_allocation_hook(mut self, hook: AllocationHook<T>) -> Self {
        self.on_allocated = Some(hook);
        self
    }

    /// The entry's key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The entry's content hash.
    pub fn hash_key(&self) -> u64 {
        self.key.hash_key()
    }

    /// The entry's frame time.
    pub fn time(&self) -> TimeValue {
        self.key.time()
    }

    /// The shared descriptor.
    pub fn params(&self) -> &Arc<EntryParams> {
        &self.params
    }

    /// The owning cache, when attached and still alive.
    fn host(&self) -> Option<Arc<dyn CacheHost>> {
        self.host.as_ref()?.upgrade()
    }

    /// Materialize the entry's storage on the device its descriptor
    /// asks for. At most one physical allocation ever happens,
    /// regardless of concurrent callers; once any call returns, every
    /// thread observes the entry as allocated.
    ///
    /// A descriptor mode of [`StorageMode::None`] is a legal no-op.
    /// Heap or device exhaustion surfaces as
    /// [`StorageError::AllocationFailed`]; disk and tile trouble is
    /// absorbed by the RAM fallback inside the buffer.
    pub fn allocate_memory(&self) -> StorageResult<()> {
        {
            let buffer = self.buffer.read();
            if buffer.is_allocated() {
                return Ok(());
            }
        }

        let (size, storage) = {
            let mut buffer = self.buffer.write();
            // another thread may have won the race between the locks
            if buffer.is_allocated() {
                return Ok(());
            }

            let storage = self.params.storage_mode();
            if storage == StorageMode::None {
                return Ok(());
            }

            self.allocate_locked(&mut buffer, storage)?;
            if let Some(hook) = &self.on_allocated {
                hook(&mut buffer);
            }

            let size = buffer.size_bytes();
            self.cached_size.store(size, Ordering::Release);
            (size, buffer.storage_mode())
        };

        if let Some(host) = self.host() {
            host.notify_entry_allocated(self.key.time(), size, storage);
        }
        Ok(())
    }

    /// The actual device allocation. Private; runs under the write
    /// lock held by the caller and takes no locks itself.
    fn allocate_locked(
        &self,
        buffer: &mut StorageBuffer<T>,
        storage: StorageMode,
    ) -> StorageResult<()> {
        let count = self.params.element_count();
        match storage {
            StorageMode::None => Ok(()),
            StorageMode::Ram => buffer.allocate_ram(count),
            StorageMode::Disk => {
                let host = self.host();
                if let Some(host) = &host {
                    if host.is_tile_cache() {
                        return buffer.allocate_tile(host, count);
                    }
                }

                // a restored entry reopens its recorded file; a fresh one
                // gets a collision-free hash-derived name
                let path = match buffer.file_path() {
                    Some(path) => path.to_path_buf(),
                    None => {
                        let root = host
                            .as_ref()
                            .map(|host| host.cache_path())
                            .unwrap_or_default();
                        collision_free_path(&root, self.key.hash_key())?
                    }
                };
                buffer.allocate_mmap(count, path)
            }
            StorageMode::Texture => {
                let rect = self
                    .params
                    .texture_rect()
                    .ok_or(StorageError::Unsupported)?;
                let context = self
                    .params
                    .gl_context()
                    .ok_or(StorageError::Unsupported)?;
                buffer.allocate_texture(&context, rect, self.params.texture_target())
            }
        }
    }

    /// Release the entry's storage. Idempotent; also run from drop.
    ///
    /// Size, time and mode are captured before the buffer is cleared so
    /// the release notification matches what allocation reported. RAM
    /// and texture storage always report a destroy; disk storage
    /// reports a destroy for tile caches and a RAM-to-disk storage
    /// change for plain caches (the on-disk copy survives and switches
    /// accounting columns).
    pub fn deallocate(&self) -> StorageResult<()> {
        let (size, storage, time) = {
            let mut buffer = self.buffer.write();
            if !buffer.is_allocated() {
                return Ok(());
            }

            let size = buffer.size_bytes();
            let storage = buffer.storage_mode();
            let time = self.key.time();
            buffer.deallocate()?;
            self.cached_size.store(0, Ordering::Release);
            (size, storage, time)
        };

        if let Some(host) = self.host() {
            match storage {
                StorageMode::Ram | StorageMode::Texture => {
                    host.notify_entry_destroyed(time, size, storage);
                }
                StorageMode::Disk => {
                    if host.is_tile_cache() {
                        host.notify_entry_destroyed(time, size, storage);
                    } else {
                        host.notify_entry_storage_changed(
                            StorageMode::Ram,
                            StorageMode::Disk,
                            time,
                            size,
                        );
                    }
                }
                StorageMode::None => {}
            }
            host.notify_memory_deallocated();
        }
        Ok(())
    }

    /// Re-attach the entry to a pre-existing on-disk artifact (process
    /// restart), without re-allocating.
    ///
    /// Only meaningful for disk-mode descriptors. The artifact must
    /// exist: a missing file is a hard
    /// [`StorageError::MissingArtifact`] failure, never absorbed. Tile
    /// caches re-lease the tile at `offset` and account through the
    /// allocation callback; plain caches record the path unmapped and
    /// account a none-to-disk storage change.
    pub fn restore_metadata_from_file(
        &self,
        size: usize,
        path: &Path,
        offset: usize,
    ) -> StorageResult<()> {
        if self.params.storage_mode() != StorageMode::Disk {
            return Err(StorageError::Unsupported);
        }
        if !path.exists() {
            return Err(StorageError::MissingArtifact(path.to_path_buf()));
        }

        let host = self.host();
        let is_tile = host.as_ref().map(|host| host.is_tile_cache()).unwrap_or(false);
        let time = self.key.time();

        if is_tile {
            let host = host.expect("tile restore requires a live host");
            let lease = host.get_tile_cache_file(path, offset)?.with_host(&host);
            {
                let mut buffer = self.buffer.write();
                buffer.set_from_lease(lease);
                self.cached_size
                    .store(buffer.size_bytes(), Ordering::Release);
            }
            host.notify_entry_allocated(time, size, StorageMode::Disk);
        } else {
            {
                let mut buffer = self.buffer.write();
                buffer.set_from_file(path.to_path_buf());
            }
            if let Some(host) = host {
                host.notify_entry_storage_changed(
                    StorageMode::None,
                    StorageMode::Disk,
                    time,
                    size,
                );
            }
        }
        Ok(())
    }

    /// Resize the live allocation in place and report the size change.
    pub fn resize_storage(&self, new_count: usize) -> StorageResult<()> {
        let (old_size, new_size) = {
            let mut buffer = self.buffer.write();
            let old_size = buffer.size_bytes();
            buffer.resize(new_count)?;
            let new_size = buffer.size_bytes();
            self.cached_size.store(new_size, Ordering::Release);
            (old_size, new_size)
        };

        if let Some(host) = self.host() {
            host.notify_entry_size_changed(old_size, new_size);
        }
        Ok(())
    }

    /// Physically remove the entry's private backing file.
    ///
    /// No-op for tile caches (tiles live in the shared pool) and for
    /// entries not on disk. Otherwise the file is deleted, the host is
    /// told the file was closed, and a destroy is reported sized by the
    /// entry's NOMINAL element count: the live buffer may already read
    /// zero when only path metadata remains.
    pub fn remove_any_backing_file(&self) -> StorageResult<()> {
        let host = self.host();
        if let Some(host) = &host {
            if host.is_tile_cache() {
                return Ok(());
            }
        }

        {
            let mut buffer = self.buffer.write();
            if buffer.storage_mode() != StorageMode::Disk {
                return Ok(());
            }
            buffer.remove_backing_file()?;
            self.cached_size.store(0, Ordering::Release);
        }

        if let Some(host) = host {
            host.backing_file_closed();
            let nominal = self.params.element_count() * std::mem::size_of::<T>();
            host.notify_entry_destroyed(self.key.time(), nominal, StorageMode::Disk);
        }
        Ok(())
    }

    /// Mark the entry so teardown removes its backing file: an evicted
    /// entry vanishes from disk, while normal process exit leaves files
    /// behind for reuse. Sticky.
    pub fn schedule_for_destruction(&self) {
        self.pending_removal.store(true, Ordering::Release);
    }

    /// Best-effort size of the entry's storage in bytes. Never blocks:
    /// when the entry lock cannot be taken immediately, the last size
    /// recorded by an allocation or release is returned instead.
    pub fn data_size(&self) -> usize {
        match self.buffer.try_read() {
            Some(buffer) => buffer.size_bytes(),
            None => self.cached_size.load(Ordering::Acquire),
        }
    }

    /// The device currently backing this entry.
    pub fn storage_mode(&self) -> StorageMode {
        self.buffer.read().storage_mode()
    }

    /// Whether the entry's storage is materialized.
    pub fn is_allocated(&self) -> bool {
        self.buffer.read().is_allocated()
    }

    /// Path of the entry's backing file, when it has one.
    pub fn file_path(&self) -> Option<PathBuf> {
        self.buffer.read().file_path().map(Path::to_path_buf)
    }

    /// Queue a flush of the entry's backed bytes (tile leases flush
    /// only their own range).
    pub fn sync_backing_file(&self) -> StorageResult<()> {
        self.buffer.read().sync_backing_file()
    }

    /// Run `f` over the entry's readable storage, or return `None` when
    /// the entry has no CPU-addressable bytes.
    pub fn with_readable<R>(&self, f: impl FnOnce(*const T, usize) -> R) -> Option<R> {
        let buffer = self.buffer.read();
        let ptr = buffer.readable()?;
        Some(f(ptr, buffer.element_count()))
    }

    /// Run `f` over the entry's writable storage, or return `None` when
    /// the entry has no CPU-addressable bytes.
    pub fn with_writable<R>(&self, f: impl FnOnce(*mut T, usize) -> R) -> Option<R> {
        let mut buffer = self.buffer.write();
        let ptr = buffer.writable()?;
        let count = buffer.element_count();
        Some(f(ptr, count))
    }
}

impl<T: Copy + Default, K: EntryKey> Drop for CacheEntry<T, K> {
    fn drop(&mut self) {
        if self.pending_removal.load(Ordering::Acquire) {
            if let Err(err) = self.remove_any_backing_file() {
                warn!("failed to remove backing file during teardown: {err}");
            }
        }
        if let Err(err) = self.deallocate() {
            warn!("failed to release entry storage during teardown: {err}");
        }
    }
}
