use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemBlockQError {
    #[error("chunk length is not a multiple of the queue's base step")]
    Misaligned,
    #[error("queue has no room for this much data")]
    QueueFull,
}
