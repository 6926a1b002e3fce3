use thiserror::Error;

#[derive(Debug, Error)]
pub enum PStreamError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("frame of {length} bytes exceeds the {max}-byte limit")]
    FrameTooLarge { length: u32, max: u32 },
    #[error("invalid seek mode byte {0}")]
    InvalidSeekMode(u8),
    #[error("unrecognized flag bits {0:#010x}")]
    UnknownFlagBits(u32),
    #[error("SHM frame received but SHM is disabled on this stream")]
    ShmDisabled,
    #[error("stream is dead")]
    Dead,
}
