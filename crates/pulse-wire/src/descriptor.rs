//! The 20-byte frame descriptor that precedes every payload on the wire,
//! and the flag/seek-mode bits packed into its last word.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::WireError;

pub const DESCRIPTOR_SIZE: usize = 20;

/// `channel` value identifying a control packet rather than audio data.
pub const CONTROL_CHANNEL: u32 = 0xFFFF_FFFF;

pub const FLAG_SHMDATA: u32 = 0x8000_0000;
pub const FLAG_SHMRELEASE: u32 = 0x4000_0000;
pub const FLAG_SHMREVOKE: u32 = 0xC000_0000;
pub const FLAG_SHMMASK: u32 = 0xFF00_0000;
pub const FLAG_SEEKMASK: u32 = 0x0000_00FF;

/// The high-byte tag on `flags` describing how the payload should be read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShmVariant {
    Inline,
    Data,
    Release,
    Revoke,
}

impl ShmVariant {
    pub fn from_flags(flags: u32) -> Result<Self, WireError> {
        match flags & FLAG_SHMMASK {
            0 => Ok(ShmVariant::Inline),
            FLAG_SHMDATA => Ok(ShmVariant::Data),
            FLAG_SHMRELEASE => Ok(ShmVariant::Release),
            FLAG_SHMREVOKE => Ok(ShmVariant::Revoke),
            other => Err(WireError::UnknownShmFlag(other)),
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            ShmVariant::Inline => 0,
            ShmVariant::Data => FLAG_SHMDATA,
            ShmVariant::Release => FLAG_SHMRELEASE,
            ShmVariant::Revoke => FLAG_SHMREVOKE,
        }
    }
}

/// The low-byte tag on `flags`, valid only on `Data`/inline frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekMode {
    Relative = 0,
    Absolute = 1,
    RelativeOnRead = 2,
    RelativeEnd = 3,
}

impl SeekMode {
    pub fn from_byte(b: u8) -> Result<Self, WireError> {
        match b {
            0 => Ok(SeekMode::Relative),
            1 => Ok(SeekMode::Absolute),
            2 => Ok(SeekMode::RelativeOnRead),
            3 => Ok(SeekMode::RelativeEnd),
            other => Err(WireError::InvalidSeekMode(other)),
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub length: u32,
    pub channel: u32,
    pub offset_hi: u32,
    pub offset_lo: u32,
    pub flags: u32,
}

impl FrameDescriptor {
    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut buf = BytesMut::with_capacity(DESCRIPTOR_SIZE);
        buf.put_u32(self.length);
        buf.put_u32(self.channel);
        buf.put_u32(self.offset_hi);
        buf.put_u32(self.offset_lo);
        buf.put_u32(self.flags);
        let mut out = [0u8; DESCRIPTOR_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    pub fn parse(bytes: &[u8; DESCRIPTOR_SIZE]) -> Self {
        let mut buf = Bytes::copy_from_slice(bytes);
        Self {
            length: buf.get_u32(),
            channel: buf.get_u32(),
            offset_hi: buf.get_u32(),
            offset_lo: buf.get_u32(),
            flags: buf.get_u32(),
        }
    }

    pub fn is_control(&self) -> bool {
        self.channel == CONTROL_CHANNEL
    }

    pub fn offset(&self) -> i64 {
        ((self.offset_hi as i64) << 32) | self.offset_lo as i64
    }

    pub fn set_offset(&mut self, offset: i64) {
        self.offset_hi = (offset >> 32) as u32;
        self.offset_lo = offset as u32;
    }

    pub fn shm_variant(&self) -> Result<ShmVariant, WireError> {
        ShmVariant::from_flags(self.flags)
    }

    pub fn seek_mode(&self) -> Result<SeekMode, WireError> {
        SeekMode::from_byte((self.flags & FLAG_SEEKMASK) as u8)
    }
}

/// The 16-byte SHM reference record carried as the payload of a `SHMDATA`
/// frame: `(block_id, shm_id, index, length)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShmRef {
    pub block_id: u32,
    pub shm_id: u32,
    pub index: u32,
    pub length: u32,
}

impl ShmRef {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32(self.block_id);
        buf.put_u32(self.shm_id);
        buf.put_u32(self.index);
        buf.put_u32(self.length);
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(&buf);
        out
    }

    pub fn parse(bytes: &[u8; Self::SIZE]) -> Self {
        let mut buf = Bytes::copy_from_slice(bytes);
        Self {
            block_id: buf.get_u32(),
            shm_id: buf.get_u32(),
            index: buf.get_u32(),
            length: buf.get_u32(),
        }
    }
}
