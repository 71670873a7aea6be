//! Length-prefixed frame codec for the controller protocol.
//!
//! Each frame is a 4-byte big-endian length followed by the payload.
//! The length is validated before any allocation so a corrupt or
//! hostile peer cannot make the daemon balloon.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

const HEADER_LEN: usize = 4;

/// Frames are small control messages; anything past this is a protocol
/// violation, not a legitimate request.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit {}", length, MAX_FRAME_SIZE),
            ));
        }
        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "frame of {} bytes exceeds limit {}",
                    item.len(),
                    MAX_FRAME_SIZE
                ),
            ));
        }
        dst.reserve(HEADER_LEN + item.len());
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"hello"), &mut buf)
            .unwrap();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"payload"), &mut buf)
            .unwrap();
        let mut partial = buf.split_to(buf.len() - 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(&frame[..], b"payload");
    }

    #[test]
    fn empty_frame_is_valid() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::new(), &mut buf).unwrap();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn oversized_length_is_rejected_before_allocation() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        assert!(codec.decode(&mut buf).is_err());
    }
}
