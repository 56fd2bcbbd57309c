//! Single-entry storage handle over heterogeneous devices.
//!
//! A [`StorageBuffer`] is backed, at any moment, by exactly one of:
//! heap memory, a private memory-mapped file, a leased tile inside a
//! shared slot file, or a GL texture. The discriminant is the single
//! source of truth; every accessor branches on it.
//!
//! Allocation follows an availability-over-durability policy: when a
//! private mapping or a tile lease cannot be had, the buffer falls back
//! to RAM silently (logged, not raised) so the render proceeds without
//! persistence rather than failing.

use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::warn;

use crate::error::{StorageError, StorageResult};
use crate::host::CacheHost;
use crate::mapped_file::MappedFile;
use crate::ram::RamBuffer;
use crate::texture::{GlContext, GlTexture, TextureRect};
use crate::tile_file::{FlushMode, TileLease};

/// Which device currently backs a buffer.
///
/// `Disk` covers both private mappings and pooled tile leases; the two
/// are distinguished by the owning cache's kind, not by the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageMode {
    /// Nothing allocated.
    #[default]
    None,
    /// Heap memory.
    Ram,
    /// A private memory-mapped file or a pooled tile.
    Disk,
    /// A GL texture (no CPU-addressable pointer).
    Texture,
}

/// The mutually-exclusive device state behind a buffer.
enum Backing<T: Copy + Default> {
    /// No storage.
    Unallocated,
    /// Heap array.
    Ram(RamBuffer<T>),
    /// Live private mapping.
    Map(MappedFile),
    /// Known backing file with no live mapping (restored metadata, or a
    /// mapping that was deallocated while its file stays on disk).
    File { path: PathBuf },
    /// Leased tile in a shared slot file.
    Tile(TileLease),
    /// GL texture.
    Texture(GlTexture),
}

/// Storage handle for one cache entry.
///
/// Created empty; transitions mode only through the `allocate_*`
/// family; released by [`deallocate`](Self::deallocate) or drop. The
/// buffer has no lock of its own: the owning entry serializes access.
pub struct StorageBuffer<T: Copy + Default> {
    backing: Backing<T>,
}

impl<T: Copy + Default> StorageBuffer<T> {
    /// Create an unallocated buffer.
    pub fn new() -> Self {
        Self {
            backing: Backing::Unallocated,
        }
    }

    /// Allocate `count` elements of heap storage.
    ///
    /// No-op when a non-empty heap allocation already exists.
    pub fn allocate_ram(&mut self, count: usize) -> StorageResult<()> {
        if let Backing::Ram(buf) = &self.backing {
            if buf.count() > 0 {
                return Ok(());
            }
        }

        let mut buf = RamBuffer::new();
        buf.resize(count)?;
        self.backing = Backing::Ram(buf);
        Ok(())
    }

    /// Back the buffer with a private mapping of the file at `path`,
    /// sized to `count` elements (an existing file is resized when the
    /// sizes differ; `count == 0` adopts the existing length).
    ///
    /// No-op when a live private mapping already exists. On any I/O or
    /// mapping failure the buffer falls back to heap storage and the
    /// path is forgotten; the failure is logged, not raised.
    pub fn allocate_mmap(&mut self, count: usize, path: impl AsRef<Path>) -> StorageResult<()> {
        if let Backing::Map(_) = &self.backing {
            return Ok(());
        }

        let path = path.as_ref();
        let size_bytes = (count * size_of::<T>()) as u64;
        match MappedFile::open(path, size_bytes) {
            Ok(map) => {
                self.backing = Backing::Map(map);
                Ok(())
            }
            Err(err) => {
                warn!(
                    "failed to map backing file {}: {err}; falling back to RAM",
                    path.display()
                );
                self.backing = Backing::Unallocated;
                self.allocate_ram(count)
            }
        }
    }

    /// Back the buffer with a tile leased from `host`, or fall back to
    /// `count` elements of heap storage when no lease can be had.
    ///
    /// No-op when a lease is already held.
    pub fn allocate_tile(&mut self, host: &Arc<dyn CacheHost>, count: usize) -> StorageResult<()> {
        if let Backing::Tile(_) = &self.backing {
            return Ok(());
        }

        match host.alloc_tile() {
            Ok(lease) => {
                self.backing = Backing::Tile(lease.with_host(host));
                Ok(())
            }
            Err(err) => {
                warn!("tile allocation failed: {err}; falling back to RAM");
                self.allocate_ram(count)
            }
        }
    }

    /// Back the buffer with an RGBA 32-bit float texture sized to
    /// `rect`, allocated in `context`.
    ///
    /// No-op when a texture already exists. Allocation failure is
    /// surfaced: there is no silent fallback from device memory.
    pub fn allocate_texture(
        &mut self,
        context: &Arc<dyn GlContext>,
        rect: TextureRect,
        target: u32,
    ) -> StorageResult<()> {
        if let Backing::Texture(_) = &self.backing {
            return Ok(());
        }

        let texture = GlTexture::allocate(context, rect, target)?;
        self.backing = Backing::Texture(texture);
        Ok(())
    }

    /// Mode-paired content exchange. Deliberately NOT a symmetric swap:
    ///
    /// - RAM/RAM: O(1) pointer swap.
    /// - this=RAM, other=Disk mapping: this' heap buffer is resized to
    ///   the mapping and the mapped bytes are copied in; `other` is
    ///   left untouched.
    /// - both private mappings: O(1) handle-and-path swap (tile leases
    ///   never swap this way).
    /// - this=Disk mapping, other=RAM: this' file is resized to the
    ///   heap buffer and the heap bytes are copied into the mapping.
    ///
    /// Callers rely on `self` ending up with the most recent data
    /// whichever side held which mode; other pairings are no-ops.
    pub fn swap(&mut self, other: &mut Self) -> StorageResult<()> {
        match (&mut self.backing, &mut other.backing) {
            (Backing::Ram(a), Backing::Ram(b)) => {
                a.swap(b);
            }
            (Backing::Ram(a), Backing::Map(m)) => {
                let count = m.len() / size_of::<T>();
                a.resize(count)?;
                // SAFETY: both regions are at least count * size_of::<T>()
                // bytes and cannot overlap (heap vs mapping).
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        m.as_ptr(),
                        a.as_mut_ptr() as *mut u8,
                        count * size_of::<T>(),
                    );
                }
            }
            (Backing::Map(m), Backing::Map(n)) => {
                std::mem::swap(m, n);
            }
            (Backing::Map(m), Backing::Ram(b)) => {
                m.resize(b.size_bytes() as u64)?;
                // SAFETY: the mapping was just sized to the heap buffer;
                // regions cannot overlap.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        b.as_ptr() as *const u8,
                        m.as_mut_ptr(),
                        b.size_bytes(),
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Resize the live allocation in place to `count` elements.
    ///
    /// Supported for heap storage and live private mappings; tile
    /// leases and textures are fixed-size devices.
    pub fn resize(&mut self, count: usize) -> StorageResult<()> {
        match &mut self.backing {
            Backing::Ram(buf) => buf.resize(count),
            Backing::Map(map) => {
                map.resize((count * size_of::<T>()) as u64)?;
                Ok(())
            }
            _ => Err(StorageError::Unsupported),
        }
    }

    /// Release whichever device resource is held. Idempotent.
    ///
    /// A private mapping is flushed asynchronously first; a flush
    /// failure is surfaced as an I/O error. The mapping's file stays on
    /// disk and its path is remembered so the entry can reopen it. A
    /// tile lease is returned through the owning cache; a texture is
    /// deleted in its context.
    pub fn deallocate(&mut self) -> StorageResult<()> {
        if let Backing::Map(map) = &self.backing {
            map.flush_async()?;
        }

        match std::mem::replace(&mut self.backing, Backing::Unallocated) {
            Backing::Map(map) => {
                let path = map.close();
                self.backing = Backing::File { path };
            }
            Backing::File { path } => {
                self.backing = Backing::File { path };
            }
            // Ram is freed, a tile lease is returned on drop, a texture
            // is deleted in its context on drop.
            _ => {}
        }
        Ok(())
    }

    /// Size of the live allocation in bytes. Zero when unallocated,
    /// including for path-only disk backing.
    pub fn size_bytes(&self) -> usize {
        match &self.backing {
            Backing::Unallocated | Backing::File { .. } => 0,
            Backing::Ram(buf) => buf.size_bytes(),
            Backing::Map(map) => map.len(),
            Backing::Tile(lease) => lease.size_bytes(),
            Backing::Texture(texture) => texture.size_bytes(),
        }
    }

    /// Number of elements the live allocation holds.
    pub fn element_count(&self) -> usize {
        self.size_bytes() / size_of::<T>()
    }

    /// Whether a live allocation exists (path-only disk backing does
    /// not count).
    pub fn is_allocated(&self) -> bool {
        matches!(
            self.backing,
            Backing::Ram(_) | Backing::Map(_) | Backing::Tile(_) | Backing::Texture(_)
        )
    }

    /// The device currently backing this buffer.
    pub fn storage_mode(&self) -> StorageMode {
        match &self.backing {
            Backing::Unallocated => StorageMode::None,
            Backing::Ram(_) => StorageMode::Ram,
            Backing::Map(_) | Backing::File { .. } | Backing::Tile(_) => StorageMode::Disk,
            Backing::Texture(_) => StorageMode::Texture,
        }
    }

    /// CPU-addressable write pointer, `None` for texture storage and
    /// when unallocated.
    pub fn writable(&mut self) -> Option<*mut T> {
        match &mut self.backing {
            Backing::Ram(buf) => Some(buf.as_mut_ptr()),
            Backing::Map(map) => Some(map.as_mut_ptr() as *mut T),
            Backing::Tile(lease) => Some(lease.as_ptr() as *mut T),
            _ => None,
        }
    }

    /// CPU-addressable read pointer, `None` for texture storage and
    /// when unallocated.
    pub fn readable(&self) -> Option<*const T> {
        match &self.backing {
            Backing::Ram(buf) => Some(buf.as_ptr()),
            Backing::Map(map) => Some(map.as_ptr() as *const T),
            Backing::Tile(lease) => Some(lease.as_ptr() as *const T),
            _ => None,
        }
    }

    /// Path of the backing file, for live mappings and path-only disk
    /// backing.
    pub fn file_path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Map(map) => Some(map.path()),
            Backing::File { path } => Some(path),
            _ => None,
        }
    }

    /// Physically delete the backing file.
    ///
    /// A live mapping is unmapped, closed and removed by its mapping
    /// object: returns `true`. Path-only backing is removed with the
    /// plain file-delete primitive: returns `false`. The distinction is
    /// observable on purpose (callers may care whether a live handle
    /// was closed). Any other backing is untouched and reports `false`.
    pub fn remove_backing_file(&mut self) -> StorageResult<bool> {
        match std::mem::replace(&mut self.backing, Backing::Unallocated) {
            Backing::Map(map) => {
                map.remove()?;
                Ok(true)
            }
            Backing::File { path } => {
                std::fs::remove_file(&path)?;
                Ok(false)
            }
            other => {
                self.backing = other;
                Ok(false)
            }
        }
    }

    /// Queue a flush of the backed bytes: the whole file for a private
    /// mapping, only the owned tile's range for a lease. No-op for
    /// other modes.
    pub fn sync_backing_file(&self) -> StorageResult<()> {
        match &self.backing {
            Backing::Map(map) => map.flush_async()?,
            Backing::Tile(lease) => lease.flush(FlushMode::Async)?,
            _ => {}
        }
        Ok(())
    }

    /// Point the buffer at an on-disk artifact without mapping it
    /// (restore path).
    pub(crate) fn set_from_file(&mut self, path: PathBuf) {
        self.backing = Backing::File { path };
    }

    /// Adopt a tile lease re-acquired for a pre-existing artifact
    /// (restore path).
    pub(crate) fn set_from_lease(&mut self, lease: TileLease) {
        self.backing = Backing::Tile(lease);
    }
}

impl<T: Copy + Default> Default for StorageBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
