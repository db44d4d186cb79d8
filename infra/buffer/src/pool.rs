//! Allocation entry point and the instrumented ledger behind every buffer.

use crate::buffer::{Buffer, BufferMut};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Process-unique identifier of one backing allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(u64);

impl BufferId {
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Counters shared by a pool and every allocation it produced.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    next_id: AtomicU64,
    allocated: AtomicU64,
    freed: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl Ledger {
    fn next_id(&self) -> BufferId {
        BufferId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Backing bytes of one allocation. Dropped exactly when the last handle goes away.
#[derive(Debug)]
pub(crate) struct Storage {
    pub(crate) id: BufferId,
    pub(crate) bytes: Vec<u8>,
    pub(crate) ledger: Arc<Ledger>,
}

impl Drop for Storage {
    fn drop(&mut self) {
        self.ledger.freed.fetch_add(1, Ordering::AcqRel);
        trace!(buffer = %self.id, len = self.bytes.len(), "Buffer storage freed");
    }
}

/// One owning reference. Created for every allocation, retain and slice; dropped with its handle.
#[derive(Debug)]
pub(crate) struct HandleToken {
    ledger: Arc<Ledger>,
}

impl HandleToken {
    pub(crate) fn acquire(ledger: &Arc<Ledger>) -> Self {
        ledger.acquired.fetch_add(1, Ordering::AcqRel);
        Self { ledger: Arc::clone(ledger) }
    }
}

impl Drop for HandleToken {
    fn drop(&mut self) {
        self.ledger.released.fetch_add(1, Ordering::AcqRel);
    }
}

/// Snapshot of a pool's ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Backing allocations created.
    pub allocated: u64,
    /// Backing allocations freed.
    pub freed: u64,
    /// Owning handles created (allocations, retains and slices).
    pub acquired: u64,
    /// Owning handles released.
    pub released: u64,
}

impl PoolStats {
    #[must_use]
    pub const fn live_allocations(&self) -> u64 {
        self.allocated.saturating_sub(self.freed)
    }

    #[must_use]
    pub const fn live_handles(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

/// Allocation entry point for [`Buffer`] and [`BufferMut`].
///
/// Cloning a pool is cheap; clones share one ledger. Every buffer records its allocation, each
/// retain/slice, each release and the final free, so tests can assert that a whole pipeline run
/// left nothing behind:
///
/// ```rust
/// use stratum_buffer::BufferPool;
///
/// let pool = BufferPool::new();
/// let buffer = pool.copy_from_slice(b"chunk bytes");
/// let alias = buffer.retain();
/// assert_eq!(buffer.ref_count(), 2);
///
/// assert!(!buffer.release());
/// assert!(alias.release());
/// assert!(pool.is_quiescent());
/// ```
#[derive(Debug, Clone, Default)]
pub struct BufferPool {
    ledger: Arc<Ledger>,
}

impl BufferPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an empty, uniquely owned buffer with room for `capacity` bytes.
    #[must_use]
    pub fn allocate(&self, capacity: usize) -> BufferMut {
        BufferMut::new(self.storage(Vec::with_capacity(capacity)), &self.ledger)
    }

    /// Takes ownership of `bytes` as a new frozen buffer.
    #[must_use]
    pub fn from_vec(&self, bytes: Vec<u8>) -> Buffer {
        BufferMut::new(self.storage(bytes), &self.ledger).freeze()
    }

    /// Copies `bytes` into a new frozen buffer.
    #[must_use]
    pub fn copy_from_slice(&self, bytes: &[u8]) -> Buffer {
        self.from_vec(bytes.to_vec())
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.ledger.allocated.load(Ordering::Acquire),
            freed: self.ledger.freed.load(Ordering::Acquire),
            acquired: self.ledger.acquired.load(Ordering::Acquire),
            released: self.ledger.released.load(Ordering::Acquire),
        }
    }

    /// `true` when every allocation was freed and every handle released.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        let stats = self.stats();
        stats.live_allocations() == 0 && stats.live_handles() == 0
    }

    fn storage(&self, bytes: Vec<u8>) -> Storage {
        self.ledger.allocated.fetch_add(1, Ordering::AcqRel);
        let id = self.ledger.next_id();
        trace!(buffer = %id, capacity = bytes.capacity(), "Buffer allocated");
        Storage { id, bytes, ledger: Arc::clone(&self.ledger) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_per_pool() {
        let pool = BufferPool::new();
        let a = pool.copy_from_slice(b"a");
        let b = pool.copy_from_slice(b"b");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().to_string(), "buf#1");
    }

    #[test]
    fn test_stats_track_full_lifecycle() {
        let pool = BufferPool::new();
        let buffer = pool.from_vec(vec![7u8; 64]);
        let slice = buffer.slice(8, 16).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.live_handles(), 2);

        drop(buffer);
        assert_eq!(pool.stats().live_allocations(), 1, "slice keeps storage alive");

        drop(slice);
        assert_eq!(pool.stats(), PoolStats { allocated: 1, freed: 1, acquired: 2, released: 2 });
    }

    #[test]
    fn test_clones_share_one_ledger() {
        let pool = BufferPool::new();
        let clone = pool.clone();
        let _buffer = clone.copy_from_slice(b"shared");
        assert_eq!(pool.stats().allocated, 1);
        assert!(!pool.is_quiescent());
    }
}
