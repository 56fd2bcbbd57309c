//! Shared entry descriptors.
//!
//! [`EntryParams`] carries the desired storage mode and size of an
//! entry. The descriptor is shared (`Arc<EntryParams>`) between the
//! entry and whoever computed it, and stays mutable behind its own lock
//! so a producer can re-point an entry at a different device before
//! allocation.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::buffer::StorageMode;
use crate::texture::{GlContext, TextureRect, TEXTURE_TARGET_2D};

struct ParamsInner {
    storage: StorageMode,
    element_count: usize,
    texture_rect: Option<TextureRect>,
    texture_target: u32,
    gl_context: Option<Arc<dyn GlContext>>,
}

/// Mutable storage-mode/size descriptor for one entry.
pub struct EntryParams {
    inner: RwLock<ParamsInner>,
}

impl EntryParams {
    /// Create a descriptor requesting `storage` for `element_count`
    /// elements.
    pub fn new(storage: StorageMode, element_count: usize) -> Self {
        Self {
            inner: RwLock::new(ParamsInner {
                storage,
                element_count,
                texture_rect: None,
                texture_target: TEXTURE_TARGET_2D,
                gl_context: None,
            }),
        }
    }

    /// Attach the texture geometry and context a texture-backed entry
    /// allocates against.
    pub fn with_texture(self, rect: TextureRect, context: Arc<dyn GlContext>) -> Self {
        {
            let mut inner = self.inner.write();
            inner.texture_rect = Some(rect);
            inner.gl_context = Some(context);
        }
        self
    }

    /// The storage device this entry should allocate on.
    pub fn storage_mode(&self) -> StorageMode {
        self.inner.read().storage
    }

    /// Re-point the entry at a different device. Only affects future
    /// allocations.
    pub fn set_storage_mode(&self, storage: StorageMode) {
        self.inner.write().storage = storage;
    }

    /// Number of elements the entry's buffer should hold.
    pub fn element_count(&self) -> usize {
        self.inner.read().element_count
    }

    /// Update the element count. Only affects future allocations.
    pub fn set_element_count(&self, count: usize) {
        self.inner.write().element_count = count;
    }

    /// Texture bounds, when this entry is texture-backed.
    pub fn texture_rect(&self) -> Option<TextureRect> {
        self.inner.read().texture_rect
    }

    /// Texture target (defaults to the 2D target).
    pub fn texture_target(&self) -> u32 {
        self.inner.read().texture_target
    }

    /// Set the texture target.
    pub fn set_texture_target(&self, target: u32) {
        self.inner.write().texture_target = target;
    }

    /// The GL context texture allocations run against.
    pub fn gl_context(&self) -> Option<Arc<dyn GlContext>> {
        self.inner.read().gl_context.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_defaults() {
        let params = EntryParams::new(StorageMode::Ram, 1024);
        assert_eq!(params.storage_mode(), StorageMode::Ram);
        assert_eq!(params.element_count(), 1024);
        assert!(params.texture_rect().is_none());
        assert!(params.gl_context().is_none());
        assert_eq!(params.texture_target(), TEXTURE_TARGET_2D);
    }

    #[test]
    fn test_setters() {
        let params = EntryParams::new(StorageMode::None, 0);
        params.set_storage_mode(StorageMode::Disk);
        params.set_element_count(512);
        assert_eq!(params.storage_mode(), StorageMode::Disk);
        assert_eq!(params.element_count(), 512);
    }
}
