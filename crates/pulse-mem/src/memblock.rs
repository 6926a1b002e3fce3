//! Reference-counted, kind-tagged byte buffers.
//!
//! `MemBlock` is `Arc<MemBlockInner>`: cloning is `ref()`, dropping the last
//! handle is `unref()`. The teardown side effects the original dispatches
//! by hand (slot return, release callbacks, peer notification) live in
//! `MemBlockInner`'s `Drop` impl, so they run in exactly one well-defined
//! place regardless of which thread drops the final reference.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::mempool::PoolInner;

pub type ReleaseCb = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Provenance tag, mirroring `pa_memblock_type_t`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemBlockKind {
    PoolSlot,
    PoolExternal,
    Appended,
    User,
    Fixed,
    Imported,
}

pub(crate) struct ImportedState {
    pub peer_block_id: u32,
    pub segment: Arc<crate::memimport::SegmentInner>,
    pub offset: usize,
    pub import: Weak<crate::memimport::MemImportInner>,
}

pub(crate) enum Storage {
    PoolSlot { pool: Arc<PoolInner>, slot: usize, len: usize },
    PoolExternal { pool: Arc<PoolInner>, slot: usize, len: usize },
    Appended { data: Box<[u8]> },
    User { data: Vec<u8>, release_cb: ReleaseCb },
    Fixed { data: Arc<[u8]> },
    Imported { state: ImportedState, len: usize },
}

impl Storage {
    fn kind(&self) -> MemBlockKind {
        match self {
            Storage::PoolSlot { .. } => MemBlockKind::PoolSlot,
            Storage::PoolExternal { .. } => MemBlockKind::PoolExternal,
            Storage::Appended { .. } => MemBlockKind::Appended,
            Storage::User { .. } => MemBlockKind::User,
            Storage::Fixed { .. } => MemBlockKind::Fixed,
            Storage::Imported { .. } => MemBlockKind::Imported,
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Storage::PoolSlot { pool, slot, len } => pool.slot_slice(*slot, *len),
            Storage::PoolExternal { pool, slot, len } => pool.slot_slice(*slot, *len),
            Storage::Appended { data } => data,
            Storage::User { data, .. } => data,
            Storage::Fixed { data } => data,
            Storage::Imported { state, len } => state.segment.slice(state.offset, *len),
        }
    }

    fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            // SAFETY: a slot's MemBlock is the sole owner of its range for
            // as long as it's allocated; this is upheld by the pool's
            // freelist discipline (one live block per slot).
            Storage::PoolSlot { pool, slot, len } | Storage::PoolExternal { pool, slot, len } => {
                Some(unsafe { pool.slot_slice_mut(*slot, *len) })
            }
            Storage::Appended { data } => Some(data),
            Storage::User { data, .. } => Some(data),
            Storage::Fixed { .. } | Storage::Imported { .. } => None,
        }
    }

    /// The pool-slot coordinates backing this storage, if any — used by
    /// `MemExport` to compute the on-wire offset without unsafe pointer
    /// arithmetic.
    pub(crate) fn pool_slot(&self) -> Option<(&Arc<PoolInner>, usize)> {
        match self {
            Storage::PoolSlot { pool, slot, .. } | Storage::PoolExternal { pool, slot, .. } => {
                Some((pool, *slot))
            }
            _ => None,
        }
    }
}

pub(crate) struct MemBlockInner {
    storage: RwLock<Storage>,
    length: usize,
    read_only: AtomicBool,
}

impl MemBlockInner {
    /// Snapshots the current bytes ahead of an import-revoke replacement.
    pub(crate) fn acquire_for_replace(&self) -> Vec<u8> {
        self.storage.read().unwrap().as_slice().to_vec()
    }

    /// Swaps this (still-Arc-shared) block's storage for a private copy,
    /// preserving handle identity for consumers who hold a clone.
    pub(crate) fn replace_with_local_copy(&self, bytes: Vec<u8>) {
        let mut storage = self.storage.write().unwrap();
        *storage = Storage::User { data: bytes, release_cb: Arc::new(|_| {}) };
    }
}

impl Drop for MemBlockInner {
    fn drop(&mut self) {
        let storage = self.storage.get_mut().unwrap_or_else(|e| e.into_inner());
        match storage {
            Storage::PoolSlot { pool, slot, .. } | Storage::PoolExternal { pool, slot, .. } => {
                pool.free_slot(*slot);
            }
            Storage::Appended { .. } | Storage::Fixed { .. } => {}
            Storage::User { data, release_cb } => {
                release_cb(data);
            }
            Storage::Imported { state, .. } => {
                if let Some(import) = state.import.upgrade() {
                    import.on_block_dropped(state.peer_block_id, &state.segment);
                }
            }
        }
    }
}

/// A reference-counted, immutable-while-shared byte buffer.
#[derive(Clone)]
pub struct MemBlock(pub(crate) Arc<MemBlockInner>);

impl MemBlock {
    pub(crate) fn new(storage: Storage, length: usize, read_only: bool) -> Self {
        Self(Arc::new(MemBlockInner {
            storage: RwLock::new(storage),
            length,
            read_only: AtomicBool::new(read_only),
        }))
    }

    /// Wraps an owned buffer as a loose `Appended` block with no pool
    /// affiliation — used by callers (e.g. the alignment accumulator in
    /// `pulse-queue`) that need a `MemBlock` handle for bytes that were
    /// never allocated from a slab.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let len = data.len();
        Self::new(Storage::Appended { data: data.into_boxed_slice() }, len, false)
    }

    /// Whether `a` and `b` are handles to the same underlying block.
    pub fn ptr_eq(a: &MemBlock, b: &MemBlock) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub fn length(&self) -> usize {
        self.0.length
    }

    pub fn is_read_only(&self) -> bool {
        self.0.read_only.load(Ordering::Acquire)
    }

    pub fn kind(&self) -> MemBlockKind {
        self.0.storage.read().unwrap().kind()
    }

    /// Pins the block for I/O and returns a stable pointer to its bytes.
    /// For pool/heap kinds this is a no-op beyond the read; for Imported
    /// blocks it guarantees the peer's mapping stays valid for as long as
    /// the returned guard lives.
    pub fn acquire(&self) -> MemBlockGuard<'_> {
        MemBlockGuard { inner: self.0.storage.read().unwrap() }
    }

    /// Writes `bytes` into the block's storage in place. Fails silently
    /// (no-op) for read-only kinds (Fixed, Imported); callers should check
    /// `kind()`/`is_read_only()` first if that matters.
    pub fn fill(&self, bytes: &[u8]) {
        let mut storage = self.0.storage.write().unwrap();
        if let Some(dst) = storage.as_mut_slice() {
            let n = dst.len().min(bytes.len());
            dst[..n].copy_from_slice(&bytes[..n]);
        }
    }

    /// Number of outstanding handles to this block (including this one).
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub(crate) fn pool_slot(&self) -> Option<(Arc<PoolInner>, usize)> {
        self.0
            .storage
            .read()
            .unwrap()
            .pool_slot()
            .map(|(pool, slot)| (pool.clone(), slot))
    }

    /// The import registry this block was materialized from, if it is an
    /// Imported block — used by `MemExport` to track cross-registry revoke
    /// dependencies.
    pub(crate) fn import_origin(&self) -> Option<Weak<crate::memimport::MemImportInner>> {
        match &*self.0.storage.read().unwrap() {
            Storage::Imported { state, .. } => Some(state.import.clone()),
            _ => None,
        }
    }

    /// `ref()`: acquire another handle. Named `ref_` because `ref` is a
    /// reserved keyword.
    pub fn ref_(&self) -> MemBlock {
        self.clone()
    }

    /// `unref()`: drop this handle. Equivalent to letting the value go out
    /// of scope; provided for parity with callers that want an explicit
    /// verb instead of relying on `Drop`.
    pub fn unref(self) {}

    /// If this handle is the sole owner and the block is Fixed, this is a
    /// plain unref. Otherwise ("make-local"), copies the bytes into a
    /// private buffer and downgrades the kind to `User` so a fixed-memory
    /// owner can reclaim its buffer synchronously while outstanding
    /// consumers keep reading a (now independent) copy.
    pub fn unref_fixed(self) {
        let is_fixed = matches!(self.kind(), MemBlockKind::Fixed);
        if !is_fixed {
            return;
        }
        if Arc::strong_count(&self.0) > 1 {
            let bytes = self.acquire().as_slice().to_vec();
            let mut storage = self.0.storage.write().unwrap();
            *storage = Storage::User {
                data: bytes,
                release_cb: Arc::new(|_| {}),
            };
        }
    }
}

pub struct MemBlockGuard<'a> {
    inner: std::sync::RwLockReadGuard<'a, Storage>,
}

impl<'a> MemBlockGuard<'a> {
    pub fn as_slice(&self) -> &[u8] {
        self.inner.as_slice()
    }
}

impl std::fmt::Debug for MemBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlock")
            .field("kind", &self.kind())
            .field("length", &self.length())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_unref_drops_exactly_once() {
        let dropped = Arc::new(AtomicBool::new(false));
        let dropped2 = dropped.clone();
        let block = MemBlock::new(
            Storage::User {
                data: vec![1, 2, 3],
                release_cb: Arc::new(move |_| dropped2.store(true, Ordering::SeqCst)),
            },
            3,
            false,
        );
        let clone = block.clone();
        assert_eq!(block.ref_count(), 2);
        drop(clone);
        assert!(!dropped.load(Ordering::SeqCst));
        drop(block);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn unref_fixed_makes_local_copy_when_shared() {
        let block = MemBlock::new(Storage::Fixed { data: Arc::from(vec![9u8; 4]) }, 4, true);
        let other = block.clone();
        block.unref_fixed();
        assert_eq!(other.acquire().as_slice(), &[9, 9, 9, 9]);
        assert_eq!(other.kind(), MemBlockKind::User);
    }
}
