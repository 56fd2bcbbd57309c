//! Raw heap buffer for RAM-backed entries.
//!
//! [`RamBuffer`] owns a raw heap array of plain elements. It is the
//! cheapest storage device and the fallback target when disk or tile
//! allocation fails. The buffer has no concurrency of its own; callers
//! serialize access at the entry level.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::marker::PhantomData;
use std::ptr;

use crate::error::{StorageError, StorageResult};

/// A heap-allocated array of `count` elements of `T`.
///
/// Storage is zero-initialized at allocation time. `T` is restricted to
/// plain copyable data (pixel and sample types) so the zero bit pattern
/// is a valid value.
///
/// The buffer is the sole owner of its allocation and frees it on drop;
/// it is never shared.
pub struct RamBuffer<T: Copy + Default> {
    data: *mut T,
    count: usize,
    _marker: PhantomData<T>,
}

// SAFETY: RamBuffer is a unique owner of plain heap memory; moving it
// across threads moves ownership of the allocation with it.
unsafe impl<T: Copy + Default + Send> Send for RamBuffer<T> {}
unsafe impl<T: Copy + Default + Sync> Sync for RamBuffer<T> {}

impl<T: Copy + Default> RamBuffer<T> {
    /// Create an empty buffer with no allocation.
    pub fn new() -> Self {
        Self {
            data: ptr::null_mut(),
            count: 0,
            _marker: PhantomData,
        }
    }

    /// Resize the buffer to `count` elements.
    ///
    /// `count == 0` is a no-op: pre-existing contents are left in place,
    /// NOT freed. Use [`clear`](Self::clear) to release storage.
    /// Any other `count` frees the previous allocation and allocates a
    /// fresh zeroed array.
    pub fn resize(&mut self, count: usize) -> StorageResult<()> {
        if count == 0 {
            return Ok(());
        }

        self.clear();

        let layout =
            Layout::array::<T>(count).map_err(|_| StorageError::AllocationFailed)?;
        // SAFETY: layout has non-zero size (count > 0, T is not a ZST for
        // any supported element type).
        let raw = unsafe { alloc_zeroed(layout) };
        if raw.is_null() {
            return Err(StorageError::AllocationFailed);
        }

        self.data = raw as *mut T;
        self.count = count;
        Ok(())
    }

    /// Free the allocation and reset to empty, unconditionally.
    pub fn clear(&mut self) {
        if !self.data.is_null() {
            // SAFETY: data was allocated with this exact layout in resize().
            unsafe {
                let layout = Layout::array::<T>(self.count)
                    .expect("layout was valid at allocation time");
                dealloc(self.data as *mut u8, layout);
            }
            self.data = ptr::null_mut();
            self.count = 0;
        }
    }

    /// Exchange contents with `other`: pointer and count swap only.
    /// O(1), no byte copies.
    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(&mut self.data, &mut other.data);
        std::mem::swap(&mut self.count, &mut other.count);
    }

    /// Number of elements held.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Size of the allocation in bytes.
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.count * std::mem::size_of::<T>()
    }

    /// Whether the buffer currently holds an allocation.
    #[inline]
    pub fn is_allocated(&self) -> bool {
        !self.data.is_null()
    }

    /// Raw pointer to the first element, null when unallocated.
    #[inline]
    pub fn as_ptr(&self) -> *const T {
        self.data
    }

    /// Raw mutable pointer to the first element, null when unallocated.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.data
    }

    /// View the contents as a slice. Empty when unallocated.
    pub fn as_slice(&self) -> &[T] {
        if self.data.is_null() {
            &[]
        } else {
            // SAFETY: data points at count initialized (zeroed) elements.
            unsafe { std::slice::from_raw_parts(self.data, self.count) }
        }
    }

    /// View the contents as a mutable slice. Empty when unallocated.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        if self.data.is_null() {
            &mut []
        } else {
            // SAFETY: data points at count initialized elements and we
            // hold exclusive access through &mut self.
            unsafe { std::slice::from_raw_parts_mut(self.data, self.count) }
        }
    }
}

impl<T: Copy + Default> Default for RamBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Default> Drop for RamBuffer<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_empty() {
        let buf: RamBuffer<f32> = RamBuffer::new();
        assert!(!buf.is_allocated());
        assert_eq!(buf.count(), 0);
        assert_eq!(buf.size_bytes(), 0);
        assert!(buf.as_slice().is_empty());
    }

    #[test]
    fn test_resize_allocates_zeroed() {
        let mut buf: RamBuffer<u16> = RamBuffer::new();
        buf.resize(64).expect("resize failed");
        assert!(buf.is_allocated());
        assert_eq!(buf.count(), 64);
        assert_eq!(buf.size_bytes(), 128);
        assert!(buf.as_slice().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_resize_zero_keeps_contents() {
        let mut buf: RamBuffer<u8> = RamBuffer::new();
        buf.resize(8).expect("resize failed");
        buf.as_mut_slice().fill(0xAB);

        // resize(0) does not clear an existing buffer
        buf.resize(0).expect("resize(0) failed");
        assert!(buf.is_allocated());
        assert_eq!(buf.count(), 8);
        assert!(buf.as_slice().iter().all(|&v| v == 0xAB));
    }

    #[test]
    fn test_resize_replaces_previous_allocation() {
        let mut buf: RamBuffer<u8> = RamBuffer::new();
        buf.resize(8).expect("resize failed");
        buf.as_mut_slice().fill(0xFF);

        buf.resize(16).expect("resize failed");
        assert_eq!(buf.count(), 16);
        // fresh allocation, zeroed again
        assert!(buf.as_slice().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_clear() {
        let mut buf: RamBuffer<f32> = RamBuffer::new();
        buf.resize(32).expect("resize failed");
        buf.clear();
        assert!(!buf.is_allocated());
        assert_eq!(buf.count(), 0);

        // clearing an empty buffer is fine
        buf.clear();
        assert!(!buf.is_allocated());
    }

    #[test]
    fn test_swap_is_pointer_exchange() {
        let mut a: RamBuffer<u8> = RamBuffer::new();
        let mut b: RamBuffer<u8> = RamBuffer::new();
        a.resize(4).expect("resize failed");
        a.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);

        let a_ptr = a.as_ptr();
        a.swap(&mut b);

        assert!(!a.is_allocated());
        assert_eq!(b.count(), 4);
        assert_eq!(b.as_slice(), &[1, 2, 3, 4]);
        // same allocation, just moved to the other handle
        assert_eq!(b.as_ptr(), a_ptr);
    }
}
