//! Per-peer registry that materializes `MemBlock`s referencing a peer's
//! shared-memory segment, and tears them down on release/revoke.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::MemImportError;
use crate::memblock::{ImportedState, MemBlock, Storage};
use crate::shm::SharedSegment;

const DEFAULT_MAX_SEGMENTS: usize = 16;
const DEFAULT_MAX_BLOCKS: usize = 128;

pub(crate) struct SegmentInner {
    pub shm_id: u32,
    segment: SharedSegment,
    live_blocks: AtomicU32,
}

impl SegmentInner {
    pub(crate) fn slice(&self, offset: usize, len: usize) -> &[u8] {
        &self.segment.as_slice()[offset..offset + len]
    }

    pub(crate) fn len(&self) -> usize {
        self.segment.len()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct Descriptor {
    shm_id: u32,
    offset: u32,
    length: u32,
}

struct Registered {
    descriptor: Descriptor,
    segment: Arc<SegmentInner>,
    block: Weak<crate::memblock::MemBlockInner>,
}

pub(crate) struct MemImportInner {
    segments: Mutex<HashMap<u32, Arc<SegmentInner>>>,
    blocks: Mutex<HashMap<u32, Registered>>,
    /// Exports (of any pool) that hold a slot pinning a block pulled out of
    /// this import registry, so destruction can revoke them.
    dependents: Mutex<Vec<Weak<crate::memexport::Inner>>>,
    max_segments: usize,
    max_blocks: usize,
}

impl MemImportInner {
    pub(crate) fn on_block_dropped(&self, peer_block_id: u32, segment: &Arc<SegmentInner>) {
        self.blocks.lock().unwrap().remove(&peer_block_id);
        let remaining = segment.live_blocks.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            self.segments.lock().unwrap().remove(&segment.shm_id);
        }
    }

    /// Records that `export` pinned a block originating from this registry,
    /// so it gets a revoke if this registry is torn down first.
    pub(crate) fn register_dependent(&self, export: Weak<crate::memexport::Inner>) {
        let mut deps = self.dependents.lock().unwrap();
        deps.retain(|d| d.strong_count() > 0);
        if !deps.iter().any(|d| d.ptr_eq(&export)) {
            deps.push(export);
        }
    }
}

/// Common teardown for one registered block: replace it with an
/// independent local copy (preserving handle identity for anyone still
/// holding it) and release the segment if this was its last block.
fn replace_and_release_segment(registered: &Registered, segments: &Mutex<HashMap<u32, Arc<SegmentInner>>>) {
    if let Some(inner) = registered.block.upgrade() {
        let bytes = inner.acquire_for_replace();
        inner.replace_with_local_copy(bytes);
    }
    let remaining = registered.segment.live_blocks.fetch_sub(1, Ordering::AcqRel) - 1;
    if remaining == 0 {
        segments.lock().unwrap().remove(&registered.segment.shm_id);
    }
}

impl Drop for MemImportInner {
    fn drop(&mut self) {
        let blocks = std::mem::take(&mut *self.blocks.lock().unwrap());
        for registered in blocks.into_values() {
            replace_and_release_segment(&registered, &self.segments);
        }

        let dependents = std::mem::take(&mut *self.dependents.lock().unwrap());
        let import_ptr = self as *const MemImportInner as *const ();
        for dep in dependents {
            if let Some(export_inner) = dep.upgrade() {
                export_inner.revoke_dependents_of(import_ptr);
            }
        }
    }
}

/// Receive-side registry: turns `(block_id, shm_id, offset, length)`
/// descriptors a peer sent us into `MemBlock`s backed by a read-only
/// mapping of their segment.
#[derive(Clone)]
pub struct MemImport {
    inner: Arc<MemImportInner>,
}

impl Default for MemImport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemImport {
    pub fn new() -> Self {
        Self::with_caps(DEFAULT_MAX_SEGMENTS, DEFAULT_MAX_BLOCKS)
    }

    pub fn with_caps(max_segments: usize, max_blocks: usize) -> Self {
        Self {
            inner: Arc::new(MemImportInner {
                segments: Mutex::new(HashMap::new()),
                blocks: Mutex::new(HashMap::new()),
                dependents: Mutex::new(Vec::new()),
                max_segments,
                max_blocks,
            }),
        }
    }

    fn segment_for(&self, shm_id: u32, segment_len_hint: usize) -> Result<Arc<SegmentInner>, MemImportError> {
        let mut segments = self.inner.segments.lock().unwrap();
        if let Some(seg) = segments.get(&shm_id) {
            return Ok(seg.clone());
        }
        if segments.len() >= self.inner.max_segments {
            return Err(MemImportError::SegmentCapExceeded);
        }
        let segment = SharedSegment::open_readonly(shm_id, segment_len_hint).map_err(|e| match e {
            crate::error::MemPoolError::ShmMapFailed(io) => MemImportError::MapFailed(io),
            crate::error::MemPoolError::ShmCreateFailed(io) => MemImportError::MapFailed(io),
        })?;
        let seg = Arc::new(SegmentInner { shm_id, segment, live_blocks: AtomicU32::new(0) });
        segments.insert(shm_id, seg.clone());
        Ok(seg)
    }

    /// Resolves (or reuses) an imported block for the given descriptor.
    pub fn get(&self, block_id: u32, shm_id: u32, offset: u32, length: u32) -> Result<MemBlock, MemImportError> {
        let descriptor = Descriptor { shm_id, offset, length };

        {
            let blocks = self.inner.blocks.lock().unwrap();
            if let Some(existing) = blocks.get(&block_id) {
                if existing.descriptor != descriptor {
                    return Err(MemImportError::DescriptorMismatch);
                }
                if let Some(inner) = existing.block.upgrade() {
                    return Ok(MemBlock(inner));
                }
            }
        }

        if self.inner.blocks.lock().unwrap().len() >= self.inner.max_blocks {
            return Err(MemImportError::BlockCapExceeded);
        }

        // We don't know the segment's total size up front; size the
        // mapping to at least cover this block's range.
        let segment = self.segment_for(shm_id, offset as usize + length as usize)?;
        if (offset as usize + length as usize) > segment.len() {
            return Err(MemImportError::OutOfBounds { offset, length });
        }

        segment.live_blocks.fetch_add(1, Ordering::AcqRel);

        let state = ImportedState {
            peer_block_id: block_id,
            segment: segment.clone(),
            offset: offset as usize,
            import: Arc::downgrade(&self.inner),
        };
        let block = MemBlock::new(Storage::Imported { state, len: length as usize }, length as usize, true);

        self.inner.blocks.lock().unwrap().insert(
            block_id,
            Registered { descriptor, segment, block: Arc::downgrade(&block.0) },
        );

        Ok(block)
    }

    /// The peer has revoked `block_id`: replace it with a local copy so
    /// outstanding handles keep reading valid (now independent) bytes.
    pub fn process_revoke(&self, block_id: u32) {
        let registered = self.inner.blocks.lock().unwrap().remove(&block_id);
        let Some(registered) = registered else { return };
        replace_and_release_segment(&registered, &self.inner.segments);
    }

    pub fn segment_count(&self) -> usize {
        self.inner.segments.lock().unwrap().len()
    }

    pub fn block_count(&self) -> usize {
        self.inner.blocks.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::memblock::MemBlockKind;
    use crate::memexport::MemExport;
    use crate::mempool::MemPool;

    #[test]
    fn dropping_import_replaces_surviving_blocks_with_local_copies() {
        let pool = MemPool::new(true, 4, 64).unwrap();
        let export = MemExport::new(pool.clone());
        let block = pool.allocate(4).unwrap();
        block.fill(b"abcd");
        let desc = export.put(block).unwrap();

        let import = MemImport::new();
        let imported = import.get(desc.block_id, desc.shm_id, desc.offset, desc.length).unwrap();
        assert_eq!(imported.kind(), MemBlockKind::Imported);

        drop(import);

        assert_eq!(imported.kind(), MemBlockKind::User);
        assert_eq!(imported.acquire().as_slice(), b"abcd");
    }

    #[test]
    fn dropping_import_revokes_exports_relaying_its_blocks() {
        let upstream_pool = MemPool::new(true, 4, 64).unwrap();
        let upstream_export = MemExport::new(upstream_pool.clone());
        let block = upstream_pool.allocate(4).unwrap();
        block.fill(b"abcd");
        let desc = upstream_export.put(block).unwrap();

        let mid_import = MemImport::new();
        let imported = mid_import.get(desc.block_id, desc.shm_id, desc.offset, desc.length).unwrap();

        let relay_pool = MemPool::new(true, 4, 64).unwrap();
        let relay_export = MemExport::new(relay_pool);
        relay_export.put(imported).unwrap();
        assert_eq!(relay_export.used_slots(), 1);

        let revoked = Arc::new(AtomicBool::new(false));
        let revoked2 = revoked.clone();
        relay_export.set_revoke_cb(Arc::new(move |_block_id| {
            revoked2.store(true, Ordering::SeqCst);
        }));

        drop(mid_import);

        assert!(revoked.load(Ordering::SeqCst));
        assert_eq!(relay_export.used_slots(), 0);
    }
}
