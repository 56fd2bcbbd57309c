//! Private memory-mapped file storage.
//!
//! [`MappedFile`] wraps a single on-disk file mapped read/write into the
//! process. One mapped file backs exactly one entry; pooled tile storage
//! lives in [`crate::tile_file`] instead.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

/// A read/write memory mapping of a private backing file.
///
/// The file is opened (or created) at construction and kept open for the
/// lifetime of the mapping. Flushes are asynchronous unless stated
/// otherwise; the mapping favors availability over durability.
pub struct MappedFile {
    file: File,
    map: MmapMut,
    path: PathBuf,
}

impl MappedFile {
    /// Open or create the file at `path` and map it.
    ///
    /// When `size_bytes` is non-zero the file is resized to it first;
    /// when zero, the existing file length is used (an empty or missing
    /// file is an error, since an empty mapping is invalid).
    ///
    /// Parent directories are created as needed.
    pub fn open(path: impl AsRef<Path>, size_bytes: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(size_bytes > 0)
            .truncate(false)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        if size_bytes > 0 && file_len != size_bytes {
            file.set_len(size_bytes)?;
        } else if file_len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty backing file",
            ));
        }

        // SAFETY: the file stays open for the lifetime of the mapping;
        // external truncation of a private cache file is outside the
        // supported contract.
        let map = unsafe { MmapOptions::new().map_mut(&file)? };

        Ok(Self { file, map, path })
    }

    /// Resize the backing file and remap it.
    ///
    /// Pending writes are flushed synchronously before the remap so no
    /// data is lost across the boundary. A zero size is rejected.
    pub fn resize(&mut self, size_bytes: u64) -> io::Result<()> {
        if size_bytes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot resize mapping to zero bytes",
            ));
        }
        if size_bytes == self.map.len() as u64 {
            return Ok(());
        }

        self.map.flush()?;
        self.file.set_len(size_bytes)?;
        // SAFETY: same contract as in open().
        self.map = unsafe { MmapOptions::new().map_mut(&self.file)? };
        Ok(())
    }

    /// Length of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the mapping is empty. Always false for a live mapping.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// Path of the backing file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The mapped bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    /// The mapped bytes, mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// Raw pointer to the start of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }

    /// Raw mutable pointer to the start of the mapping.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// Queue a flush of the whole mapping and return immediately.
    pub fn flush_async(&self) -> io::Result<()> {
        self.map.flush_async()
    }

    /// Flush the whole mapping synchronously.
    pub fn flush(&self) -> io::Result<()> {
        self.map.flush()
    }

    /// Flush `len` bytes starting at `offset` synchronously.
    pub fn flush_range(&self, offset: usize, len: usize) -> io::Result<()> {
        self.map.flush_range(offset, len)
    }

    /// Queue a flush of `len` bytes starting at `offset`.
    pub fn flush_async_range(&self, offset: usize, len: usize) -> io::Result<()> {
        self.map.flush_async_range(offset, len)
    }

    /// Unmap, close and delete the backing file.
    pub fn remove(self) -> io::Result<()> {
        let Self { file, map, path } = self;
        drop(map);
        drop(file);
        std::fs::remove_file(&path)
    }

    /// Unmap and close the backing file, leaving it on disk.
    /// Returns the path for later reopening.
    pub fn close(self) -> PathBuf {
        let Self { file, map, path } = self;
        drop(map);
        drop(file);
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_and_sizes_file() {
        let dir = tempdir().expect("tempdir failed");
        let path = dir.path().join("entry.tc");

        let map = MappedFile::open(&path, 4096).expect("open failed");
        assert_eq!(map.len(), 4096);
        assert_eq!(map.path(), path.as_path());
        assert_eq!(std::fs::metadata(&path).expect("stat failed").len(), 4096);
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempdir().expect("tempdir failed");
        let path = dir.path().join("1a/2b3c.tc");

        let map = MappedFile::open(&path, 128).expect("open failed");
        assert_eq!(map.len(), 128);
        assert!(path.exists());
    }

    #[test]
    fn test_open_zero_size_requires_existing_content() {
        let dir = tempdir().expect("tempdir failed");
        let path = dir.path().join("missing.tc");

        assert!(MappedFile::open(&path, 0).is_err());
    }

    #[test]
    fn test_contents_survive_reopen() {
        let dir = tempdir().expect("tempdir failed");
        let path = dir.path().join("entry.tc");

        {
            let mut map = MappedFile::open(&path, 16).expect("open failed");
            map.as_mut_slice().copy_from_slice(&[7u8; 16]);
            map.flush().expect("flush failed");
        }

        // reopen with size 0: adopt the existing length
        let map = MappedFile::open(&path, 0).expect("reopen failed");
        assert_eq!(map.len(), 16);
        assert_eq!(map.as_slice(), &[7u8; 16]);
    }

    #[test]
    fn test_resize_preserves_prefix() {
        let dir = tempdir().expect("tempdir failed");
        let path = dir.path().join("entry.tc");

        let mut map = MappedFile::open(&path, 8).expect("open failed");
        map.as_mut_slice().copy_from_slice(&[9u8; 8]);
        map.resize(32).expect("resize failed");

        assert_eq!(map.len(), 32);
        assert_eq!(&map.as_slice()[..8], &[9u8; 8]);
        assert!(map.as_slice()[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_remove_deletes_file() {
        let dir = tempdir().expect("tempdir failed");
        let path = dir.path().join("entry.tc");

        let map = MappedFile::open(&path, 64).expect("open failed");
        map.remove().expect("remove failed");
        assert!(!path.exists());
    }

    #[test]
    fn test_close_leaves_file() {
        let dir = tempdir().expect("tempdir failed");
        let path = dir.path().join("entry.tc");

        let map = MappedFile::open(&path, 64).expect("open failed");
        let returned = map.close();
        assert_eq!(returned, path);
        assert!(path.exists());
    }
}
