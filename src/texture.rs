//! GPU texture storage.
//!
//! Texture-backed entries keep their pixels in a GL texture owned by an
//! external context. The context is consumed through the narrow
//! [`GlContext`] trait; all texture work runs under a [`ContextBinding`]
//! so the context is made current on entry and released on every exit
//! path, including unwinds.
//!
//! Textures are always allocated as RGBA 32-bit float, whatever depth
//! the entry descriptor asks for; narrower GPU formats are not
//! supported.

use std::sync::{Arc, Weak};

use crate::error::StorageResult;

/// The standard two-dimensional texture target.
pub const TEXTURE_TARGET_2D: u32 = 0x0DE1;

/// Bytes per RGBA 32-bit float pixel.
const BYTES_PER_PIXEL: usize = 4 * 4;

/// Pixel-aligned bounds of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureRect {
    /// Left edge (inclusive).
    pub x1: i32,
    /// Bottom edge (inclusive).
    pub y1: i32,
    /// Right edge (exclusive).
    pub x2: i32,
    /// Top edge (exclusive).
    pub y2: i32,
}

impl TextureRect {
    /// Create a rect from its edges.
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Width in pixels (zero for a degenerate rect).
    #[inline]
    pub fn width(&self) -> u32 {
        (self.x2 - self.x1).max(0) as u32
    }

    /// Height in pixels (zero for a degenerate rect).
    #[inline]
    pub fn height(&self) -> u32 {
        (self.y2 - self.y1).max(0) as u32
    }

    /// Number of pixels covered.
    #[inline]
    pub fn pixel_count(&self) -> usize {
        self.width() as usize * self.height() as usize
    }
}

/// The GL context an entry's texture lives in.
///
/// Implemented outside this crate by whatever owns the real context.
/// Texture creation always produces RGBA 32-bit float storage sized to
/// the requested bounds.
pub trait GlContext: Send + Sync {
    /// Make this context current on the calling thread.
    fn make_current(&self);

    /// Release this context from the calling thread.
    fn done_current(&self);

    /// Create an RGBA 32-bit float texture of `width` x `height` for
    /// `target`, returning its name.
    fn create_texture(&self, target: u32, width: u32, height: u32) -> StorageResult<u32>;

    /// Delete a texture previously created by this context.
    fn delete_texture(&self, texture: u32);
}

/// Scoped context attachment: current on construction, released on
/// drop. Holding the binding is what makes GL calls legal on this
/// thread; the drop guarantee covers early returns and panics.
pub struct ContextBinding<'a> {
    context: &'a dyn GlContext,
}

impl<'a> ContextBinding<'a> {
    /// Attach `context` to the calling thread.
    pub fn new(context: &'a dyn GlContext) -> Self {
        context.make_current();
        Self { context }
    }
}

impl Drop for ContextBinding<'_> {
    fn drop(&mut self) {
        self.context.done_current();
    }
}

/// An RGBA 32-bit float texture owned by an entry.
///
/// The texture holds a weak reference to its context: when the context
/// is torn down first, the texture name dies with it and drop becomes a
/// no-op.
pub struct GlTexture {
    texture: u32,
    target: u32,
    rect: TextureRect,
    context: Weak<dyn GlContext>,
}

impl GlTexture {
    /// Allocate a texture sized to `rect` in `context`.
    ///
    /// Runs under a [`ContextBinding`]. The texture is always RGBA
    /// 32-bit float regardless of the entry's nominal bit depth.
    pub fn allocate(
        context: &Arc<dyn GlContext>,
        rect: TextureRect,
        target: u32,
    ) -> StorageResult<Self> {
        let binding = ContextBinding::new(&**context);
        let texture = context.create_texture(target, rect.width(), rect.height())?;
        drop(binding);

        Ok(Self {
            texture,
            target,
            rect,
            context: Arc::downgrade(context),
        })
    }

    /// The GL texture name.
    #[inline]
    pub fn texture(&self) -> u32 {
        self.texture
    }

    /// The texture target.
    #[inline]
    pub fn target(&self) -> u32 {
        self.target
    }

    /// The bounds this texture was sized to.
    #[inline]
    pub fn rect(&self) -> &TextureRect {
        &self.rect
    }

    /// Device memory footprint: pixels times RGBA 32-bit float.
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.rect.pixel_count() * BYTES_PER_PIXEL
    }
}

impl Drop for GlTexture {
    fn drop(&mut self) {
        if let Some(context) = self.context.upgrade() {
            let _binding = ContextBinding::new(&*context);
            context.delete_texture(self.texture);
        }
    }
}
