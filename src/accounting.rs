//! Cache-wide storage accounting helpers.
//!
//! Owning caches keep their byte totals straight by wiring the entry
//! notification callbacks into a [`StorageTally`]: atomic per-device
//! counters with a consistent-enough snapshot for reporting and
//! pressure decisions.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffer::StorageMode;

/// Atomic per-device byte and entry counters.
///
/// All operations are lock-free; concurrent updates from entry
/// notifications never block each other.
#[derive(Debug, Default)]
pub struct StorageTally {
    ram_bytes: AtomicU64,
    disk_bytes: AtomicU64,
    texture_bytes: AtomicU64,
    entry_count: AtomicU64,
}

impl StorageTally {
    /// Create a tally with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Account `size` bytes materialized on `storage`.
    pub fn add(&self, storage: StorageMode, size: usize) {
        if let Some(counter) = self.counter(storage) {
            counter.fetch_add(size as u64, Ordering::Relaxed);
            self.entry_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Account `size` bytes released from `storage`.
    pub fn sub(&self, storage: StorageMode, size: usize) {
        if let Some(counter) = self.counter(storage) {
            saturating_sub(counter, size as u64);
            saturating_sub(&self.entry_count, 1);
        }
    }

    /// Move `size` bytes from one device column to another.
    pub fn migrate(&self, old_storage: StorageMode, new_storage: StorageMode, size: usize) {
        if let Some(counter) = self.counter(old_storage) {
            saturating_sub(counter, size as u64);
        }
        if let Some(counter) = self.counter(new_storage) {
            counter.fetch_add(size as u64, Ordering::Relaxed);
        }
    }

    /// Account an in-place resize.
    pub fn resize(&self, storage: StorageMode, old_size: usize, new_size: usize) {
        if let Some(counter) = self.counter(storage) {
            if new_size >= old_size {
                counter.fetch_add((new_size - old_size) as u64, Ordering::Relaxed);
            } else {
                saturating_sub(counter, (old_size - new_size) as u64);
            }
        }
    }

    /// A point-in-time view of the counters.
    pub fn snapshot(&self) -> TallySnapshot {
        TallySnapshot {
            ram_bytes: self.ram_bytes.load(Ordering::Relaxed),
            disk_bytes: self.disk_bytes.load(Ordering::Relaxed),
            texture_bytes: self.texture_bytes.load(Ordering::Relaxed),
            entry_count: self.entry_count.load(Ordering::Relaxed),
        }
    }

    fn counter(&self, storage: StorageMode) -> Option<&AtomicU64> {
        match storage {
            StorageMode::None => None,
            StorageMode::Ram => Some(&self.ram_bytes),
            StorageMode::Disk => Some(&self.disk_bytes),
            StorageMode::Texture => Some(&self.texture_bytes),
        }
    }
}

/// Subtract without wrapping below zero: released sizes may race with
/// snapshot-based corrections.
fn saturating_sub(counter: &AtomicU64, value: u64) {
    let mut current = counter.load(Ordering::Relaxed);
    loop {
        let next = current.saturating_sub(value);
        match counter.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

/// Counter values captured by [`StorageTally::snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TallySnapshot {
    /// Bytes held in heap storage.
    pub ram_bytes: u64,
    /// Bytes held in private mappings and tile leases.
    pub disk_bytes: u64,
    /// Bytes held in GL textures.
    pub texture_bytes: u64,
    /// Live entries with materialized storage.
    pub entry_count: u64,
}

impl TallySnapshot {
    /// Total bytes across every device.
    pub fn total_bytes(&self) -> u64 {
        self.ram_bytes + self.disk_bytes + self.texture_bytes
    }

    /// Utilization of `limit` bytes as a fraction (0.0 - 1.0).
    pub fn utilization(&self, limit: u64) -> f64 {
        if limit == 0 {
            0.0
        } else {
            self.total_bytes() as f64 / limit as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_sub_balance() {
        let tally = StorageTally::new();
        tally.add(StorageMode::Ram, 1024);
        tally.add(StorageMode::Disk, 4096);

        let snapshot = tally.snapshot();
        assert_eq!(snapshot.ram_bytes, 1024);
        assert_eq!(snapshot.disk_bytes, 4096);
        assert_eq!(snapshot.entry_count, 2);
        assert_eq!(snapshot.total_bytes(), 5120);

        tally.sub(StorageMode::Ram, 1024);
        tally.sub(StorageMode::Disk, 4096);
        assert_eq!(tally.snapshot(), TallySnapshot::default());
    }

    #[test]
    fn test_none_mode_is_ignored() {
        let tally = StorageTally::new();
        tally.add(StorageMode::None, 1024);
        assert_eq!(tally.snapshot(), TallySnapshot::default());
    }

    #[test]
    fn test_migrate_moves_columns() {
        let tally = StorageTally::new();
        tally.add(StorageMode::Ram, 2048);
        tally.migrate(StorageMode::Ram, StorageMode::Disk, 2048);

        let snapshot = tally.snapshot();
        assert_eq!(snapshot.ram_bytes, 0);
        assert_eq!(snapshot.disk_bytes, 2048);
        assert_eq!(snapshot.entry_count, 1);
    }

    #[test]
    fn test_sub_never_wraps() {
        let tally = StorageTally::new();
        tally.sub(StorageMode::Ram, 4096);
        assert_eq!(tally.snapshot().ram_bytes, 0);
    }

    #[test]
    fn test_resize_adjusts_in_place() {
        let tally = StorageTally::new();
        tally.add(StorageMode::Ram, 100);
        tally.resize(StorageMode::Ram, 100, 250);
        assert_eq!(tally.snapshot().ram_bytes, 250);
        tally.resize(StorageMode::Ram, 250, 50);
        assert_eq!(tally.snapshot().ram_bytes, 50);
        assert_eq!(tally.snapshot().entry_count, 1);
    }

    #[test]
    fn test_utilization() {
        let tally = StorageTally::new();
        tally.add(StorageMode::Ram, 512);
        let snapshot = tally.snapshot();
        assert!((snapshot.utilization(1024) - 0.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.utilization(0), 0.0);
    }
}
