//! Length-prefixed frames guarded by a magic number on both ends.
//!
//! `magic: u32 | length: u32 | payload | magic: u32`, all big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

pub const RDMA_MESSAGE_MAGIC: u32 = 491_237_815;
/// Bytes a frame adds around its payload.
pub const FRAME_OVERHEAD: usize = 12;

pub fn frame_len(payload_len: usize) -> usize {
    payload_len + FRAME_OVERHEAD
}

/// The length field of a frame carrying `payload_len` bytes.
fn declared_len(payload_len: usize) -> Result<u32, FrameError> {
    u32::try_from(payload_len).map_err(|_| FrameError::TooLarge(payload_len))
}

/// Appends one frame to `buf`. Nothing is written if the payload does not fit
/// the 32-bit length field.
pub fn encode_frame_into(buf: &mut BytesMut, payload: &[u8]) -> Result<(), FrameError> {
    let declared = declared_len(payload.len())?;
    buf.reserve(frame_len(payload.len()));
    buf.put_u32(RDMA_MESSAGE_MAGIC);
    buf.put_u32(declared);
    buf.put_slice(payload);
    buf.put_u32(RDMA_MESSAGE_MAGIC);
    Ok(())
}

pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::new();
    encode_frame_into(&mut buf, payload)?;
    Ok(buf.freeze())
}

/// Returns the payload of the frame at the start of `frame`.
///
/// Bytes after the trailing magic are ignored.
pub fn decode_frame(frame: &[u8]) -> Result<&[u8], FrameError> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(FrameError::Truncated(frame.len()));
    }
    let mut header = &frame[..8];
    let magic = header.get_u32();
    if magic != RDMA_MESSAGE_MAGIC {
        return Err(FrameError::BadLeadingMagic(magic));
    }
    let declared = header.get_u32() as usize;
    let available = frame.len() - FRAME_OVERHEAD;
    if declared > available {
        return Err(FrameError::LengthMismatch { declared, available });
    }
    let mut trailer = &frame[8 + declared..8 + declared + 4];
    let magic = trailer.get_u32();
    if magic != RDMA_MESSAGE_MAGIC {
        return Err(FrameError::BadTrailingMagic(magic));
    }
    Ok(&frame[8..8 + declared])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let frame = encode_frame(b"abc").unwrap();
        assert_eq!(frame.len(), 15);
        assert_eq!(&frame[..4], &RDMA_MESSAGE_MAGIC.to_be_bytes());
        assert_eq!(&frame[4..8], &[0, 0, 0, 3]);
        assert_eq!(&frame[8..11], b"abc");
        assert_eq!(&frame[11..], &RDMA_MESSAGE_MAGIC.to_be_bytes());
        assert_eq!(decode_frame(&frame).unwrap(), b"abc");
    }

    #[test]
    fn test_empty_payload_and_trailing_bytes() {
        let mut buf = BytesMut::new();
        encode_frame_into(&mut buf, b"").unwrap();
        buf.put_slice(b"next");
        assert_eq!(decode_frame(&buf).unwrap(), b"");
    }

    #[test]
    fn test_validation() {
        assert_eq!(decode_frame(&[0; 4]), Err(FrameError::Truncated(4)));

        let mut frame = encode_frame(b"payload").unwrap().to_vec();
        frame[0] ^= 1;
        assert!(matches!(decode_frame(&frame), Err(FrameError::BadLeadingMagic(_))));

        let mut frame = encode_frame(b"payload").unwrap().to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 1;
        assert!(matches!(decode_frame(&frame), Err(FrameError::BadTrailingMagic(_))));

        let mut frame = encode_frame(b"payload").unwrap().to_vec();
        frame[7] = 200;
        assert_eq!(
            decode_frame(&frame),
            Err(FrameError::LengthMismatch { declared: 200, available: 7 })
        );
    }

    #[test]
    fn test_length_field_bound() {
        assert_eq!(declared_len(u32::MAX as usize), Ok(u32::MAX));
        #[cfg(target_pointer_width = "64")]
        assert_eq!(
            declared_len(u32::MAX as usize + 1),
            Err(FrameError::TooLarge(u32::MAX as usize + 1))
        );
    }
}
