//! cache-storage: tiered storage engine for render-cache entries.
//!
//! This crate provides the storage half of an image cache: every
//! computed artifact (a rendered tile, an intermediate buffer) is backed
//! by a device chosen per entry, and the full lifecycle of that storage
//! runs through one abstraction:
//!
//! - **RamBuffer**: raw heap array, the universal fallback device
//! - **MappedFile**: private memory-mapped backing file
//! - **TileSlotFile / TileLease**: pooled fixed-size tiles in one shared
//!   mapped file, one lease per entry
//! - **GlTexture**: GPU texture storage behind the `GlContext` seam
//! - **StorageBuffer**: the per-entry handle that is backed by exactly
//!   one of the above at a time
//! - **CacheEntry**: key + descriptor + buffer + owning-cache
//!   back-reference, with the concurrency and notification protocol
//! - **CacheHost**: the narrow contract the owning cache implements
//! - **StorageTally**: atomic accounting counters for host
//!   implementations
//!
//! # Architecture
//!
//! ```text
//!                 +---------------------------+
//!                 |        CacheHost          |
//!                 | (paths, tiles, accounting)|
//!                 +-------------+-------------+
//!                               ^ weak
//!                               |
//!                 +-------------+-------------+
//!                 |        CacheEntry         |
//!                 |  key | params | rw-lock   |
//!                 +-------------+-------------+
//!                               |
//!                               v
//!                 +---------------------------+
//!                 |       StorageBuffer       |
//!                 +--+--------+--------+---+--+
//!                    |        |        |   |
//!                    v        v        v   v
//!               RamBuffer MappedFile Tile GlTexture
//!                                    Lease
//! ```
//!
//! # Availability over durability
//!
//! When a private mapping or a tile lease cannot be had, allocation
//! falls back to RAM silently: the render proceeds, possibly without
//! persistence, rather than failing. Out-of-memory and missing-artifact
//! conditions are never absorbed.
//!
//! # Concurrency
//!
//! Each entry owns an independent reader/writer lock; unrelated entries
//! never contend. `CacheEntry::allocate_memory` guarantees at most one
//! physical allocation per entry under any number of concurrent
//! callers.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod accounting;
mod buffer;
mod entry;
mod error;
mod host;
mod mapped_file;
mod params;
mod ram;
mod texture;
mod tile_file;

pub use accounting::{StorageTally, TallySnapshot};
pub use buffer::{StorageBuffer, StorageMode};
pub use entry::{
    cache_file_path, collision_free_path, AllocationHook, CacheEntry, EntryKey, KeyHasher,
    CACHE_FILE_EXT,
};
pub use error::{StorageError, StorageResult};
pub use host::{CacheHost, TimeValue};
pub use mapped_file::MappedFile;
pub use params::EntryParams;
pub use ram::RamBuffer;
pub use texture::{ContextBinding, GlContext, GlTexture, TextureRect, TEXTURE_TARGET_2D};
pub use tile_file::{
    FlushMode, TileLease, TileSlotFile, TileSlotFileBuilder, DEFAULT_TILE_COUNT,
    DEFAULT_TILE_SIZE_BYTES,
};
