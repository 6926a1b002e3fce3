//! Shared-memory block pool and reference-counted audio buffers backing
//! zero-copy transport: `MemPool`/`MemBlock` allocate and own byte ranges,
//! `MemImport`/`MemExport` translate them into portable `(shm_id, offset,
//! length)` coordinates across peers.

pub mod error;
pub mod memblock;
pub mod memexport;
pub mod memimport;
pub mod mempool;
pub mod shm;

pub use error::{MemExportError, MemImportError, MemPoolError};
pub use memblock::{MemBlock, MemBlockGuard, MemBlockKind, ReleaseCb};
pub use memexport::{ExportDescriptor, MemExport, RevokeCb};
pub use memimport::MemImport;
pub use mempool::{MemPool, MemPoolStats};

/// A window `(index, length)` into a `MemBlock`; the payload unit that
/// flows through `MemBlockQ` and `PStream`.
#[derive(Clone)]
pub struct MemChunk {
    pub block: MemBlock,
    pub index: usize,
    pub length: usize,
}

impl MemChunk {
    pub fn new(block: MemBlock, index: usize, length: usize) -> Self {
        debug_assert!(index + length <= block.length());
        Self { block, index, length }
    }

    pub fn as_slice(&self) -> Vec<u8> {
        self.block.acquire().as_slice()[self.index..self.index + self.length].to_vec()
    }
}

impl std::fmt::Debug for MemChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemChunk")
            .field("index", &self.index)
            .field("length", &self.length)
            .finish()
    }
}
