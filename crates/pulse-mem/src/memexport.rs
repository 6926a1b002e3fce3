//! Send-side registry: pins outgoing `MemBlock`s into fixed export slots
//! and hands back the `(block_id, shm_id, offset, length)` coordinates a
//! peer needs to import them.

use std::sync::{Arc, Mutex, Weak};

use crate::error::MemExportError;
use crate::memblock::MemBlock;
use crate::memimport::MemImportInner;
use crate::mempool::MemPool;

const DEFAULT_SLOTS: usize = 128;

pub type RevokeCb = Arc<dyn Fn(u32) + Send + Sync>;

struct Slot {
    block: MemBlock,
    /// The import registry `block` was pulled from, if any — lets a dying
    /// `MemImport` find and revoke this slot.
    import_origin: Option<Weak<MemImportInner>>,
}

pub struct ExportDescriptor {
    pub block_id: u32,
    pub shm_id: u32,
    pub offset: u32,
    pub length: u32,
}

pub(crate) struct Inner {
    pool: MemPool,
    slots: Mutex<Vec<Option<Slot>>>,
    revoke_cb: Mutex<Option<RevokeCb>>,
}

impl Inner {
    fn clear_slot(&self, block_id: u32) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(block_id as usize) {
            *slot = None;
        }
    }

    fn notify_revoke(&self, block_id: u32) {
        if let Some(cb) = self.revoke_cb.lock().unwrap().as_ref() {
            cb(block_id);
        }
    }

    /// A `MemImport` registry is being torn down: revoke every slot here
    /// whose block was pulled from it.
    pub(crate) fn revoke_dependents_of(&self, import_ptr: *const ()) {
        let ids: Vec<u32> = {
            let slots = self.slots.lock().unwrap();
            slots
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| {
                    let origin = slot.as_ref()?.import_origin.as_ref()?;
                    (Weak::as_ptr(origin) as *const () == import_ptr).then_some(i as u32)
                })
                .collect()
        };
        for id in ids {
            self.clear_slot(id);
            self.notify_revoke(id);
        }
    }
}

/// Fixed-size table of pinned, exportable blocks; the slot index doubles
/// as the on-wire `block_id`.
#[derive(Clone)]
pub struct MemExport {
    inner: Arc<Inner>,
}

impl MemExport {
    pub fn new(pool: MemPool) -> Self {
        Self::with_slots(pool, DEFAULT_SLOTS)
    }

    pub fn with_slots(pool: MemPool, n_slots: usize) -> Self {
        let mut slots = Vec::with_capacity(n_slots);
        slots.resize_with(n_slots, || None);
        Self {
            inner: Arc::new(Inner {
                pool,
                slots: Mutex::new(slots),
                revoke_cb: Mutex::new(None),
            }),
        }
    }

    pub fn set_revoke_cb(&self, cb: RevokeCb) {
        *self.inner.revoke_cb.lock().unwrap() = Some(cb);
    }

    /// Byte offset of `block` within this export's own pool segment, if
    /// `block` is already a slot allocated from that exact pool.
    fn shareable_offset(&self, block: &MemBlock) -> Option<usize> {
        let (pool, slot) = block.pool_slot()?;
        if !Arc::ptr_eq(&pool, &self.inner.pool.inner()) {
            return None;
        }
        Some(slot * pool.block_size())
    }

    /// Pins `block` into a free slot, copying into the pool first if the
    /// block isn't already pool-backed. Returns the coordinates a peer can
    /// use to import it.
    pub fn put(&self, block: MemBlock) -> Result<ExportDescriptor, MemExportError> {
        let import_origin = block.import_origin();
        let shm_id = self.inner.pool.shm_id().ok_or(MemExportError::NotShareable)?;

        let (shareable, offset) = match self.shareable_offset(&block) {
            Some(offset) => (block.clone(), offset),
            None => {
                let len = block.length();
                let copy = self.inner.pool.allocate(len).ok_or(MemExportError::NotShareable)?;
                copy.fill(block.acquire().as_slice());
                let offset = self.shareable_offset(&copy).ok_or(MemExportError::NotShareable)?;
                (copy, offset)
            }
        };

        let mut slots = self.inner.slots.lock().unwrap();
        let slot_idx = slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(MemExportError::SlotsExhausted)?;
        let length = shareable.length() as u32;
        slots[slot_idx] = Some(Slot { block: shareable, import_origin: import_origin.clone() });
        drop(slots);

        if let Some(origin) = import_origin.and_then(|w| w.upgrade()) {
            origin.register_dependent(Arc::downgrade(&self.inner));
        }

        Ok(ExportDescriptor {
            block_id: slot_idx as u32,
            shm_id,
            offset: offset as u32,
            length,
        })
    }

    /// The peer no longer needs `block_id`; free the slot.
    pub fn process_release(&self, block_id: u32) {
        self.inner.clear_slot(block_id);
    }

    /// Emits a revoke for `block_id` and frees its slot locally.
    pub fn revoke(&self, block_id: u32) {
        self.inner.clear_slot(block_id);
        self.inner.notify_revoke(block_id);
    }

    pub fn used_slots(&self) -> usize {
        self.inner.slots.lock().unwrap().iter().filter(|s| s.is_some()).count()
    }
}
