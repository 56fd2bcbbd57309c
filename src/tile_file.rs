//! Pooled tile storage: one mapped file, many fixed-size slots.
//!
//! A [`TileSlotFile`] is a memory-mapped file partitioned into
//! equal-size tiles with a bit-per-tile occupancy set. Many entries
//! share one file; each holds a [`TileLease`] for exactly one tile.
//!
//! # File Layout
//!
//! ```text
//! +------------------+
//! | Tile 0           |  tile_size_bytes
//! | Tile 1           |  tile_size_bytes
//! | ...              |
//! | Tile N-1         |  tile_size_bytes
//! +------------------+
//! ```
//!
//! Tile contents are never zeroed on free: a freshly leased tile holds
//! stale bytes until its first writer overwrites them.
//!
//! # Thread Safety
//!
//! The occupancy bitmap sits behind its own mutex; the owning cache
//! drives `try_alloc_tile`/`free_tile` under that lock. Tile data access
//! goes through raw pointers whose exclusivity comes from the
//! one-lease-per-tile invariant.

use std::io;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::host::CacheHost;
use crate::mapped_file::MappedFile;

/// Default size of one tile in bytes (a 128x128 RGBA 32-bit tile).
pub const DEFAULT_TILE_SIZE_BYTES: usize = 64 * 1024;

/// Default number of tiles in a freshly created slot file.
pub const DEFAULT_TILE_COUNT: usize = 256;

/// How a flush of tile data reaches the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Block until the range is on disk.
    Sync,
    /// Queue the writeback and return immediately. Default.
    #[default]
    Async,
}

/// Bit-per-tile occupancy set.
struct TileBitmap {
    words: Vec<u64>,
    bits: usize,
}

impl TileBitmap {
    fn new(bits: usize) -> Self {
        Self {
            words: vec![0u64; bits.div_ceil(64)],
            bits,
        }
    }

    fn get(&self, index: usize) -> bool {
        debug_assert!(index < self.bits);
        self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    fn set(&mut self, index: usize) {
        debug_assert!(index < self.bits);
        self.words[index / 64] |= 1u64 << (index % 64);
    }

    fn unset(&mut self, index: usize) {
        debug_assert!(index < self.bits);
        self.words[index / 64] &= !(1u64 << (index % 64));
    }

    /// Find the lowest clear bit, or None when all tiles are taken.
    fn first_clear(&self) -> Option<usize> {
        for (w, word) in self.words.iter().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                let index = w * 64 + bit;
                if index < self.bits {
                    return Some(index);
                }
            }
        }
        None
    }

    fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// A fixed-size memory-mapped file partitioned into equal-size tiles.
///
/// Shared by value across entries through `Arc<TileSlotFile>`. The file
/// does not grow in place; an owning cache that runs out of tiles
/// provisions another slot file (or fails the allocation).
pub struct TileSlotFile {
    map: MappedFile,
    base: *mut u8,
    tile_size: usize,
    tile_count: usize,
    used: Mutex<TileBitmap>,
}

// SAFETY: TileSlotFile is safe to send/share between threads because:
// 1. the mapping is created once and never remapped or moved until Drop
// 2. the occupancy bitmap is guarded by its mutex
// 3. tile data exclusivity is guaranteed by the one-lease-per-tile
//    invariant upheld by the bitmap
unsafe impl Send for TileSlotFile {}
unsafe impl Sync for TileSlotFile {}

impl TileSlotFile {
    /// Open an existing slot file, deriving the tile count from its
    /// length. All tiles start free; a recovering cache re-marks the
    /// tiles it still references with [`mark_tile_used`](Self::mark_tile_used).
    pub fn open_existing(path: impl AsRef<Path>, tile_size_bytes: usize) -> io::Result<Self> {
        if tile_size_bytes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tile size must be non-zero",
            ));
        }

        let mut map = MappedFile::open(path, 0)?;
        if map.len() % tile_size_bytes != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "slot file length is not a multiple of the tile size",
            ));
        }

        let tile_count = map.len() / tile_size_bytes;
        let base = map.as_mut_ptr();
        Ok(Self {
            map,
            base,
            tile_size: tile_size_bytes,
            tile_count,
            used: Mutex::new(TileBitmap::new(tile_count)),
        })
    }

    /// Size of one tile in bytes.
    #[inline]
    pub fn tile_size_bytes(&self) -> usize {
        self.tile_size
    }

    /// Total number of tiles in the file.
    #[inline]
    pub fn tile_count(&self) -> usize {
        self.tile_count
    }

    /// Number of tiles currently leased.
    pub fn used_count(&self) -> usize {
        self.used.lock().count_set()
    }

    /// Path of the backing file.
    #[inline]
    pub fn path(&self) -> &Path {
        self.map.path()
    }

    /// Lease one tile: scan for a clear occupancy bit, set it and return
    /// the byte offset of the tile. `None` when every tile is taken.
    pub fn try_alloc_tile(&self) -> Option<usize> {
        let mut used = self.used.lock();
        let index = used.first_clear()?;
        used.set(index);
        Some(index * self.tile_size)
    }

    /// Return a tile to the pool. The tile's bytes are left as-is:
    /// stale until the next writer.
    pub fn free_tile(&self, offset: usize) {
        let index = self.tile_index(offset);
        let mut used = self.used.lock();
        debug_assert!(used.get(index), "tile {index} freed twice");
        used.unset(index);
    }

    /// Mark a specific tile as leased (recovery of a pre-existing
    /// artifact). Returns false if the tile was already taken.
    pub fn mark_tile_used(&self, offset: usize) -> bool {
        let index = self.tile_index(offset);
        let mut used = self.used.lock();
        if used.get(index) {
            return false;
        }
        used.set(index);
        true
    }

    /// Whether the tile at `offset` is currently leased.
    pub fn is_tile_used(&self, offset: usize) -> bool {
        let index = self.tile_index(offset);
        self.used.lock().get(index)
    }

    /// Raw pointer to the tile at `offset`, valid for exactly
    /// `tile_size_bytes()` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is not tile-aligned or out of bounds.
    pub fn tile_ptr(&self, offset: usize) -> *mut u8 {
        let _ = self.tile_index(offset);
        // SAFETY: offset was bounds-checked; base stays valid for the
        // lifetime of the mapping.
        unsafe { self.base.add(offset) }
    }

    /// Flush the byte range of a single tile, not the whole pooled file.
    pub fn flush_tile(&self, offset: usize, mode: FlushMode) -> io::Result<()> {
        let _ = self.tile_index(offset);
        match mode {
            FlushMode::Sync => self.map.flush_range(offset, self.tile_size),
            FlushMode::Async => self.map.flush_async_range(offset, self.tile_size),
        }
    }

    fn tile_index(&self, offset: usize) -> usize {
        assert!(
            offset % self.tile_size == 0 && offset / self.tile_size < self.tile_count,
            "invalid tile offset: {offset}"
        );
        offset / self.tile_size
    }
}

impl Drop for TileSlotFile {
    fn drop(&mut self) {
        // Push any remaining dirty pages out before the mapping goes away.
        let _ = self.map.flush();
    }
}

/// Builder for creating a new [`TileSlotFile`].
pub struct TileSlotFileBuilder {
    path: std::path::PathBuf,
    tile_size: usize,
    tile_count: usize,
}

impl TileSlotFileBuilder {
    /// Create a builder targeting `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            tile_size: DEFAULT_TILE_SIZE_BYTES,
            tile_count: DEFAULT_TILE_COUNT,
        }
    }

    /// Set the size of each tile in bytes (default: 64KB).
    pub fn tile_size_bytes(mut self, size: usize) -> Self {
        self.tile_size = size;
        self
    }

    /// Set the number of tiles (default: 256).
    pub fn tile_count(mut self, count: usize) -> Self {
        self.tile_count = count;
        self
    }

    /// Create the file sized `tile_size * tile_count` and map it with an
    /// all-free occupancy set.
    pub fn build(self) -> io::Result<TileSlotFile> {
        if self.tile_size == 0 || self.tile_count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tile size and count must be non-zero",
            ));
        }

        let total = (self.tile_size * self.tile_count) as u64;
        let mut map = MappedFile::open(&self.path, total)?;
        let base = map.as_mut_ptr();

        Ok(TileSlotFile {
            map,
            base,
            tile_size: self.tile_size,
            tile_count: self.tile_count,
            used: Mutex::new(TileBitmap::new(self.tile_count)),
        })
    }
}

/// A lease on one tile: the shared file handle plus the byte offset of
/// the tile, `offset = index * tile_size_bytes`.
///
/// Dropping the lease returns the tile: through the owning cache's
/// `free_tile` when one is attached, directly to the slot file when the
/// lease is detached or the cache is already gone.
pub struct TileLease {
    file: Arc<TileSlotFile>,
    offset: usize,
    host: Option<Weak<dyn CacheHost>>,
}

impl TileLease {
    /// Create a detached lease. The caller (an owning cache's
    /// `alloc_tile`) has already set the occupancy bit for `offset`.
    pub fn new(file: Arc<TileSlotFile>, offset: usize) -> Self {
        Self {
            file,
            offset,
            host: None,
        }
    }

    /// Attach the lease to its owning cache so the tile is returned
    /// through the cache's `free_tile` bookkeeping.
    pub fn with_host(mut self, host: &Arc<dyn CacheHost>) -> Self {
        self.host = Some(Arc::downgrade(host));
        self
    }

    /// The shared slot file this lease points into.
    #[inline]
    pub fn file(&self) -> &Arc<TileSlotFile> {
        &self.file
    }

    /// Byte offset of the leased tile inside the file.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of the leased tile in bytes.
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.file.tile_size_bytes()
    }

    /// Raw pointer to the leased bytes.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.file.tile_ptr(self.offset)
    }

    /// Flush only this tile's byte range.
    pub fn flush(&self, mode: FlushMode) -> io::Result<()> {
        self.file.flush_tile(self.offset, mode)
    }
}

impl Drop for TileLease {
    fn drop(&mut self) {
        let via_host = self
            .host
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|host| host.free_tile(&self.file, self.offset))
            .is_some();
        if !via_host {
            self.file.free_tile(self.offset);
        }
    }
}
