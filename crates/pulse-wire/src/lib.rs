//! Wire-level types for the pstream protocol: the 20-byte frame descriptor,
//! the SHM reference record it can carry as a payload, and the `Item` enum
//! a `PStream`'s send queue actually deals in.

pub mod descriptor;
pub mod item;

pub use descriptor::{
    FrameDescriptor, SeekMode, ShmRef, ShmVariant, CONTROL_CHANNEL, DESCRIPTOR_SIZE, FLAG_SEEKMASK, FLAG_SHMDATA,
    FLAG_SHMMASK, FLAG_SHMRELEASE, FLAG_SHMREVOKE,
};
pub use item::{Creds, Item};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unrecognized SHM flag bits: {0:#010x}")]
    UnknownShmFlag(u32),
    #[error("invalid seek mode byte: {0}")]
    InvalidSeekMode(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_round_trips_through_bytes() {
        let d = FrameDescriptor { length: 42, channel: 3, offset_hi: 1, offset_lo: 2, flags: FLAG_SHMDATA };
        let bytes = d.to_bytes();
        assert_eq!(FrameDescriptor::parse(&bytes), d);
    }

    #[test]
    fn offset_packs_and_unpacks_as_64_bits() {
        let mut d = FrameDescriptor::default();
        d.set_offset(-5);
        assert_eq!(d.offset(), -5);
    }

    #[test]
    fn shm_variant_rejects_unknown_high_byte() {
        assert_eq!(ShmVariant::from_flags(0x2000_0000), Err(WireError::UnknownShmFlag(0x2000_0000)));
        assert_eq!(ShmVariant::from_flags(FLAG_SHMREVOKE), Ok(ShmVariant::Revoke));
    }

    #[test]
    fn seek_mode_rejects_out_of_range_byte() {
        assert_eq!(SeekMode::from_byte(4), Err(WireError::InvalidSeekMode(4)));
        assert_eq!(SeekMode::from_byte(2), Ok(SeekMode::RelativeOnRead));
    }

    #[test]
    fn shm_ref_round_trips() {
        let r = ShmRef { block_id: 7, shm_id: 99, index: 10, length: 20 };
        assert_eq!(ShmRef::parse(&r.to_bytes()), r);
    }
}
