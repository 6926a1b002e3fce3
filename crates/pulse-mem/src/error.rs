use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemPoolError {
    #[error("failed to create shared memory segment")]
    ShmCreateFailed(#[source] std::io::Error),
    #[error("failed to map shared memory segment")]
    ShmMapFailed(#[source] std::io::Error),
}

#[derive(Error, Debug)]
pub enum MemImportError {
    #[error("peer offered more segments than this import allows")]
    SegmentCapExceeded,
    #[error("peer offered more blocks than this import allows")]
    BlockCapExceeded,
    #[error("block range ({offset}, {length}) exceeds segment bounds")]
    OutOfBounds { offset: u32, length: u32 },
    #[error("failed to map imported segment")]
    MapFailed(#[source] std::io::Error),
    #[error("block id already registered with a different descriptor")]
    DescriptorMismatch,
}

#[derive(Error, Debug)]
pub enum MemExportError {
    #[error("block cannot be made shareable")]
    NotShareable,
    #[error("all export slots are in use")]
    SlotsExhausted,
}
