//! The send-queue element: what a `PStream` actually enqueues, before it's
//! lowered into a descriptor plus payload bytes.

use pulse_mem::MemChunk;

use crate::descriptor::SeekMode;

/// Ancillary credentials carried alongside a control packet on platforms
/// that support them (UNIX sockets).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Creds {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

pub enum Item {
    Packet { bytes: Vec<u8>, creds: Option<Creds> },
    MemBlock { channel: u32, offset: i64, seek: SeekMode, chunk: MemChunk },
    ShmRelease { block_id: u32 },
    ShmRevoke { block_id: u32 },
}

impl Item {
    pub fn channel(&self) -> u32 {
        match self {
            Item::Packet { .. } => crate::descriptor::CONTROL_CHANNEL,
            Item::MemBlock { channel, .. } => *channel,
            Item::ShmRelease { .. } | Item::ShmRevoke { .. } => crate::descriptor::CONTROL_CHANNEL,
        }
    }
}
