//! The owning-cache contract.
//!
//! Entries do not know the cache that owns them beyond the narrow
//! [`CacheHost`] trait: path policy, the tile pool, and accounting
//! callbacks. Every allocate/deallocate/migrate path in the entry calls
//! exactly one documented notification variant so cache-wide accounting
//! never drifts.
//!
//! Entries hold the host weakly. A host may be torn down while entries
//! are still alive, and entries may be created detached (no host at
//! all); every call site tolerates both.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::buffer::StorageMode;
use crate::error::{StorageError, StorageResult};
use crate::tile_file::{TileLease, TileSlotFile};

/// Frame time an entry was computed at, as used by accounting
/// callbacks.
pub type TimeValue = f64;

/// Cache-wide policy and bookkeeping, consumed by entries.
///
/// Two collaborator kinds exist: tile caches (`is_tile_cache() == true`)
/// hand out leases into pooled slot files and account disk-backed
/// entries through `notify_entry_allocated`/`notify_entry_destroyed`;
/// plain caches name private backing files under `cache_path()` and
/// account the disk copy through `notify_entry_storage_changed`.
pub trait CacheHost: Send + Sync {
    /// Root directory for hash-named private backing files.
    fn cache_path(&self) -> PathBuf;

    /// Whether this cache hands out pooled tile leases instead of
    /// private backing files.
    fn is_tile_cache(&self) -> bool;

    /// Size of one pooled tile in bytes. Zero for non-tile caches.
    fn tile_size_bytes(&self) -> usize {
        0
    }

    /// An entry's buffer was resized in place from `old_size` to
    /// `new_size` bytes.
    fn notify_entry_size_changed(&self, old_size: usize, new_size: usize);

    /// An entry materialized `size` bytes on `storage`.
    fn notify_entry_allocated(&self, time: TimeValue, size: usize, storage: StorageMode);

    /// An entry released `size` bytes from `storage`.
    fn notify_entry_destroyed(&self, time: TimeValue, size: usize, storage: StorageMode);

    /// An entry's bytes moved between devices (including to or from the
    /// unallocated state) without being recomputed.
    fn notify_entry_storage_changed(
        &self,
        old_storage: StorageMode,
        new_storage: StorageMode,
        time: TimeValue,
        size: usize,
    );

    /// Fire-and-forget wake-up for threads blocked on memory pressure.
    fn notify_memory_deallocated(&self) {}

    /// A private backing file was physically removed from disk.
    fn backing_file_closed(&self) {}

    /// Lease one tile from the pool. Tile caches only.
    ///
    /// The host mutates the slot file's occupancy under its own
    /// synchronization; callers treat this as one atomic operation.
    fn alloc_tile(&self) -> StorageResult<TileLease> {
        Err(StorageError::Unsupported)
    }

    /// Re-attach to a tile that already holds data from a previous
    /// session: locate (or reopen) the slot file at `path` and lease
    /// the tile at `offset`. Tile caches only.
    fn get_tile_cache_file(&self, path: &Path, offset: usize) -> StorageResult<TileLease> {
        let _ = (path, offset);
        Err(StorageError::Unsupported)
    }

    /// Return a leased tile to the pool. Tile caches only.
    ///
    /// Same synchronization contract as [`alloc_tile`](Self::alloc_tile).
    fn free_tile(&self, file: &Arc<TileSlotFile>, offset: usize) {
        let _ = (file, offset);
    }
}
