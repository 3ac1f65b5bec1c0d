use bytes::{Buf, BufMut};

use crate::{
    api::MemoryRegionDescriptor,
    error::{RdmaLibError, Result},
};

/// Fixed wire size of a meta message, and of each meta buffer.
pub const META_MESSAGE_BYTES: usize = 32;

const META_TYPE_MEMORY_REGION: u16 = 0;
const META_TYPE_SCALAR: u16 = 1;

/// Control message exchanged over the dedicated meta buffers.
///
/// Layout, big-endian: `type: u16`, 6 reserved bytes, then either
/// `addr: u64, length: u64, rkey: u32` or `value: u64`, zero padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaMessage {
    MemoryRegion(MemoryRegionDescriptor),
    Scalar(u64),
}

impl MetaMessage {
    pub fn encode(&self) -> [u8; META_MESSAGE_BYTES] {
        let mut out = [0u8; META_MESSAGE_BYTES];
        let mut buf = &mut out[..];
        match self {
            MetaMessage::MemoryRegion(desc) => {
                buf.put_u16(META_TYPE_MEMORY_REGION);
                buf.put_bytes(0, 6);
                buf.put_u64(desc.addr);
                buf.put_u64(desc.length);
                buf.put_u32(desc.rkey);
            }
            MetaMessage::Scalar(value) => {
                buf.put_u16(META_TYPE_SCALAR);
                buf.put_bytes(0, 6);
                buf.put_u64(*value);
            }
        }
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < META_MESSAGE_BYTES {
            return Err(RdmaLibError::MetaDecode("meta message too short"));
        }
        let kind = buf.get_u16();
        buf.advance(6);
        match kind {
            META_TYPE_MEMORY_REGION => Ok(MetaMessage::MemoryRegion(MemoryRegionDescriptor {
                addr: buf.get_u64(),
                length: buf.get_u64(),
                rkey: buf.get_u32(),
            })),
            META_TYPE_SCALAR => Ok(MetaMessage::Scalar(buf.get_u64())),
            _ => Err(RdmaLibError::MetaDecode("unknown meta message type")),
        }
    }
}
