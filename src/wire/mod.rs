//! Wire protocol between the controller daemon and its clients.
//!
//! A connection carries a sequence of requests. Each request frame is
//! one tag byte followed by a `prost`-encoded message; each response
//! frame is [`RESP_OK`] or [`RESP_ERR`] followed by the payload.
//!
//! Start is the one streaming operation: the client sends any number of
//! [`Tag::StartName`] frames (no responses) and then a
//! [`Tag::StartCommit`], and blocks until the commit response arrives
//! after the whole topological run.

pub mod framing;
pub mod messages;

pub use framing::FrameCodec;

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;

/// Request discriminator, the first byte of every request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    CreateBatch = 0x01,
    RemoveBatch = 0x02,
    StartName = 0x03,
    StartCommit = 0x04,
    Stop = 0x05,
    StopAll = 0x06,
    Status = 0x07,
    Diagnostics = 0x08,
}

impl Tag {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Tag::CreateBatch),
            0x02 => Some(Tag::RemoveBatch),
            0x03 => Some(Tag::StartName),
            0x04 => Some(Tag::StartCommit),
            0x05 => Some(Tag::Stop),
            0x06 => Some(Tag::StopAll),
            0x07 => Some(Tag::Status),
            0x08 => Some(Tag::Diagnostics),
            _ => None,
        }
    }
}

/// Response tag for a successful call.
pub const RESP_OK: u8 = 0x00;
/// Response tag for a failed call; payload is [`messages::ErrorResp`].
pub const RESP_ERR: u8 = 0x7f;

/// Encode a tagged request frame.
pub fn encode_request<M: Message>(tag: Tag, msg: &M) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + msg.encoded_len());
    buf.put_u8(tag as u8);
    msg.encode(&mut buf).expect("BytesMut grows on demand");
    buf.freeze()
}

/// Split a request frame into its tag and payload.
pub fn decode_request(frame: &Bytes) -> Result<(Tag, &[u8])> {
    let (&tag_byte, payload) = frame
        .split_first()
        .ok_or_else(|| Error::Protocol("empty request frame".to_string()))?;
    let tag = Tag::from_byte(tag_byte)
        .ok_or_else(|| Error::Protocol(format!("unknown request tag {:#x}", tag_byte)))?;
    Ok((tag, payload))
}

/// Encode a success response carrying `msg`.
pub fn encode_ok<M: Message>(msg: &M) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + msg.encoded_len());
    buf.put_u8(RESP_OK);
    msg.encode(&mut buf).expect("BytesMut grows on demand");
    buf.freeze()
}

/// Encode an error response from any error's display form.
pub fn encode_err(err: &Error) -> Bytes {
    let resp = messages::ErrorResp {
        message: err.to_string(),
    };
    let mut buf = BytesMut::with_capacity(1 + resp.encoded_len());
    buf.put_u8(RESP_ERR);
    resp.encode(&mut buf).expect("BytesMut grows on demand");
    buf.freeze()
}

/// Decode a response frame into `M`, surfacing remote failures as
/// [`Error::Remote`].
pub fn decode_response<M: Message + Default>(frame: &Bytes) -> Result<M> {
    let (&tag, payload) = frame
        .split_first()
        .ok_or_else(|| Error::Protocol("empty response frame".to_string()))?;
    match tag {
        RESP_OK => Ok(M::decode(payload)?),
        RESP_ERR => {
            let err = messages::ErrorResp::decode(payload)?;
            Err(Error::Remote(err.message))
        }
        other => Err(Error::Protocol(format!("unknown response tag {:#x}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::messages::{Empty, StatusReq};
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = StatusReq {
            service_names: vec!["echo".to_string()],
        };
        let frame = encode_request(Tag::Status, &req);
        let (tag, payload) = decode_request(&frame).unwrap();
        assert_eq!(tag, Tag::Status);
        assert_eq!(StatusReq::decode(payload).unwrap(), req);
    }

    #[test]
    fn ok_response_roundtrip() {
        let frame = encode_ok(&Empty {});
        let decoded: Empty = decode_response(&frame).unwrap();
        assert_eq!(decoded, Empty {});
    }

    #[test]
    fn error_response_surfaces_message() {
        let frame = encode_err(&Error::ServiceNotFound("ghost".to_string()));
        let result: Result<Empty> = decode_response(&frame);
        match result {
            Err(Error::Remote(msg)) => assert!(msg.contains("ghost")),
            other => panic!("expected remote error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let frame = Bytes::from_static(&[0x42]);
        assert!(decode_request(&frame).is_err());
    }
}
