//! Fixed-size slab allocator backing `MemBlock`s.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::MemPoolError;
use crate::memblock::{MemBlock, Storage};
use crate::shm::SharedSegment;

/// Conceptual per-block header the original co-locates with pool-slot
/// allocations; kept only to mirror the spec's two-branch `allocate`
/// sizing check (§4.1). Rust never actually places `MemBlockInner` inside
/// the slot, so it affects sizing only, not layout.
const SLOT_HEADER: usize = 64;

#[derive(Default)]
pub struct MemPoolStats {
    pub n_allocated: AtomicU32,
    pub n_accumulated: AtomicU64,
    pub allocated_size: AtomicU64,
    pub accumulated_size: AtomicU64,
    pub n_imported: AtomicU32,
    pub n_exported: AtomicU32,
    pub n_pool_full: AtomicU32,
    pub n_too_large_for_pool: AtomicU32,
}

pub(crate) struct PoolInner {
    segment: SharedSegment,
    block_size: usize,
    n_slots: usize,
    free_slots: Mutex<VecDeque<usize>>,
    pub stats: MemPoolStats,
    shared: bool,
}

impl PoolInner {
    pub(crate) fn free_slot(&self, slot: usize) {
        self.free_slots.lock().unwrap().push_back(slot);
        self.stats.n_allocated.fetch_sub(1, Ordering::AcqRel);
        self.segment.vacuum_range(slot * self.block_size, self.block_size);
    }

    /// Borrows `len` bytes starting at `slot`'s first byte, directly out of
    /// the pool's backing segment — this is the zero-copy path: the
    /// returned bytes live in the segment for as long as `self` (kept
    /// alive by the block's own `Arc<PoolInner>`) is alive.
    pub(crate) fn slot_slice(&self, slot: usize, len: usize) -> &[u8] {
        let start = slot * self.block_size;
        &self.segment.as_slice()[start..start + len]
    }

    /// # Safety
    /// Caller must ensure no other live borrow of this slot's range exists;
    /// the pool's freelist discipline (one live MemBlock per slot) upholds
    /// this.
    pub(crate) unsafe fn slot_slice_mut(&self, slot: usize, len: usize) -> &mut [u8] {
        let start = slot * self.block_size;
        &mut self.segment.as_mut_slice()[start..start + len]
    }

    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }
}

/// A slab of uniformly sized slots, optionally backed by a named
/// shared-memory segment so peers can be handed `(shm_id, offset, length)`
/// references into it.
#[derive(Clone)]
pub struct MemPool {
    inner: Arc<PoolInner>,
}

impl MemPool {
    pub fn new(shared: bool, n_slots: usize, block_size: usize) -> Result<Self, MemPoolError> {
        let total = n_slots * block_size;
        let segment = if shared {
            SharedSegment::create(total)?
        } else {
            SharedSegment::create_private(total)?
        };
        let free_slots = (0..n_slots).collect();
        Ok(Self {
            inner: Arc::new(PoolInner {
                segment,
                block_size,
                n_slots,
                free_slots: Mutex::new(free_slots),
                stats: MemPoolStats::default(),
                shared,
            }),
        })
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    pub fn n_slots(&self) -> usize {
        self.inner.n_slots
    }

    pub fn shm_id(&self) -> Option<u32> {
        self.inner.shared.then(|| self.inner.segment.shm_id())
    }

    fn pop_free_slot(&self) -> Option<usize> {
        let slot = self.inner.free_slots.lock().unwrap().pop_front();
        if slot.is_none() {
            self.inner.stats.n_pool_full.fetch_add(1, Ordering::Relaxed);
        }
        slot
    }

    /// Slot-backed allocations count toward `n_allocated`, which `free_slot`
    /// decrements on teardown — this keeps invariant (2) "n_allocated
    /// equals the number of live MemBlocks whose pool == self" meaningful
    /// for the slot-backed kinds it actually applies to.
    fn record_slot_allocation(&self, len: usize) {
        self.inner.stats.n_allocated.fetch_add(1, Ordering::AcqRel);
        self.record_allocation(len);
    }

    fn record_allocation(&self, len: usize) {
        self.inner.stats.n_accumulated.fetch_add(1, Ordering::Relaxed);
        self.inner.stats.allocated_size.fetch_add(len as u64, Ordering::Relaxed);
        self.inner.stats.accumulated_size.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Allocates a block of `len` bytes from a free slot, falling back to
    /// `None` (caller should use `allocate_appended`) when the pool is
    /// exhausted or `len` cannot fit in a slot at all.
    pub fn allocate(&self, len: usize) -> Option<MemBlock> {
        if len > self.inner.block_size {
            self.inner.stats.n_too_large_for_pool.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let slot = self.pop_free_slot()?;
        let storage = if len + SLOT_HEADER <= self.inner.block_size {
            Storage::PoolSlot { pool: self.inner.clone(), slot, len }
        } else {
            Storage::PoolExternal { pool: self.inner.clone(), slot, len }
        };
        self.record_slot_allocation(len);
        Some(MemBlock::new(storage, len, false))
    }

    /// Heap allocation used once the pool's slots are exhausted.
    pub fn allocate_appended(&self, len: usize) -> MemBlock {
        self.record_allocation(len);
        MemBlock::new(Storage::Appended { data: vec![0u8; len].into_boxed_slice() }, len, false)
    }

    /// Wraps externally supplied bytes, invoking `release_cb` on teardown.
    pub fn adopt_user(&self, data: Vec<u8>, release_cb: crate::memblock::ReleaseCb, read_only: bool) -> MemBlock {
        let len = data.len();
        self.record_allocation(len);
        MemBlock::new(Storage::User { data, release_cb }, len, read_only)
    }

    /// Wraps externally supplied, statically-owned bytes as read-only
    /// unless later made local via `unref_fixed`.
    pub fn adopt_fixed(&self, data: Arc<[u8]>, read_only: bool) -> MemBlock {
        let len = data.len();
        self.record_allocation(len);
        MemBlock::new(Storage::Fixed { data }, len, read_only)
    }

    /// Advises the kernel to discard backing pages of every currently free
    /// slot. Slots remain reusable afterward.
    pub fn vacuum(&self) {
        for &slot in self.inner.free_slots.lock().unwrap().iter() {
            self.inner.segment.vacuum_range(slot * self.inner.block_size, self.inner.block_size);
        }
    }

    pub(crate) fn inner(&self) -> Arc<PoolInner> {
        self.inner.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_exhausts_then_reports_full() {
        let pool = MemPool::new(false, 2, 128).unwrap();
        let a = pool.allocate(16).unwrap();
        let b = pool.allocate(16).unwrap();
        assert!(pool.allocate(16).is_none());
        assert_eq!(pool.inner.stats.n_pool_full.load(Ordering::Relaxed), 1);
        drop(a);
        assert!(pool.allocate(16).is_some());
        drop(b);
    }

    #[test]
    fn allocate_too_large_is_rejected_without_consuming_a_slot() {
        let pool = MemPool::new(false, 1, 64).unwrap();
        assert!(pool.allocate(65).is_none());
        assert_eq!(pool.inner.stats.n_too_large_for_pool.load(Ordering::Relaxed), 1);
        assert!(pool.allocate(32).is_some());
    }

    #[test]
    fn freed_slot_is_reused() {
        let pool = MemPool::new(false, 1, 64).unwrap();
        let block = pool.allocate(8).unwrap();
        assert_eq!(pool.inner.stats.n_allocated.load(Ordering::Relaxed), 1);
        drop(block);
        assert_eq!(pool.inner.stats.n_allocated.load(Ordering::Relaxed), 0);
        assert!(pool.allocate(8).is_some());
    }
}
