//! TETH01 Frame Protocol
//!
//! Frames are self-delimiting so they can ride a stream socket. The header is
//! fixed-width and carries the opcode, so a receiver can route or reject a
//! message without decoding its body.
//!
//! ## Wire Format
//!
//! ```text
//! Offset  Size  Field
//! 0       6     Protocol magic   "TETH01"
//! 6       1     Kind             0 = client method, 1 = server event
//! 7       2     Opcode           big-endian u16
//! 9       2     Content-Type     big-endian u16
//! 11      1     Descriptor count descriptors attached via SCM_RIGHTS
//! 12      4     Body length      big-endian u32
//! 16      n     Body             interpretation per Content-Type
//! ```
//!
//! Descriptors travel out-of-band; the receiver queues them and each frame
//! claims the number announced in its header.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::messages::{method, event, ClientMethod, ServerEvent};
use crate::wire;

/// Protocol magic - bump on breaking changes
pub const PROTOCOL_VERSION: &[u8; 6] = b"TETH01";

/// Size of the fixed header
pub const HEADER_LEN: usize = 16;

/// Default upper bound on a body
pub const DEFAULT_MAX_BODY: usize = 1024 * 1024;

/// Direction of a frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Client → server
    Method = 0,
    /// Server → client
    Event = 1,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(FrameKind::Method),
            1 => Ok(FrameKind::Event),
            other => Err(FrameError::InvalidKind(other)),
        }
    }
}

/// Content type for body interpretation (2 bytes, big-endian)
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// No body
    Empty = 0x0000,
    /// MsgPack-encoded message
    MsgPack = 0x0001,
    /// JSON, for debugging
    Json = 0x0003,
}

impl ContentType {
    pub fn from_u16(value: u16) -> Result<Self, FrameError> {
        match value {
            0x0000 => Ok(ContentType::Empty),
            0x0001 => Ok(ContentType::MsgPack),
            0x0003 => Ok(ContentType::Json),
            other => Err(FrameError::InvalidContentType(other)),
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Errors during frame parsing
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid protocol magic: expected TETH01")]
    InvalidProtocol,
    #[error("Invalid frame kind: {0}")]
    InvalidKind(u8),
    #[error("Invalid content type: {0:#06x}")]
    InvalidContentType(u16),
    #[error("Unknown opcode {opcode} for {kind:?}")]
    UnknownOpcode { kind: FrameKind, opcode: u16 },
    #[error("Frame kind mismatch: expected {expected:?}, got {actual:?}")]
    KindMismatch {
        expected: FrameKind,
        actual: FrameKind,
    },
    #[error("Opcode mismatch: header says {header}, body decodes as {body}")]
    OpcodeMismatch { header: u16, body: u16 },
    #[error("Descriptor count mismatch: header says {header}, message needs {needed}")]
    FdCountMismatch { header: u8, needed: usize },
    #[error("Frame body too large: {len} bytes (limit {limit})")]
    TooLarge { len: usize, limit: usize },
    #[error("Frame has no body")]
    EmptyBody,
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A parsed TETH01 frame
#[derive(Debug, Clone, PartialEq)]
pub struct NodeFrame {
    pub kind: FrameKind,
    pub opcode: u16,
    pub content_type: ContentType,
    pub n_fds: u8,
    pub body: Bytes,
}

impl NodeFrame {
    /// Build a frame carrying a client method.
    pub fn method(msg: &ClientMethod, content_type: ContentType) -> Result<Self, FrameError> {
        let body = wire::serialize(content_type, msg)?;
        Ok(Self {
            kind: FrameKind::Method,
            opcode: msg.opcode(),
            content_type,
            n_fds: 0,
            body: Bytes::from(body),
        })
    }

    /// Build a frame carrying a server event.
    pub fn event(msg: &ServerEvent, content_type: ContentType) -> Result<Self, FrameError> {
        let body = wire::serialize(content_type, msg)?;
        let n_fds = msg.fd_count();
        Ok(Self {
            kind: FrameKind::Event,
            opcode: msg.opcode(),
            content_type,
            n_fds: u8::try_from(n_fds).map_err(|_| FrameError::FdCountMismatch {
                header: u8::MAX,
                needed: n_fds,
            })?,
            body: Bytes::from(body),
        })
    }

    /// Decode the body as a client method, checking header agreement.
    pub fn to_method(&self) -> Result<ClientMethod, FrameError> {
        self.expect_kind(FrameKind::Method)?;
        let msg: ClientMethod = wire::deserialize(self.content_type, &self.body)?;
        if msg.opcode() != self.opcode {
            return Err(FrameError::OpcodeMismatch {
                header: self.opcode,
                body: msg.opcode(),
            });
        }
        if self.n_fds != 0 {
            return Err(FrameError::FdCountMismatch {
                header: self.n_fds,
                needed: 0,
            });
        }
        Ok(msg)
    }

    /// Decode the body as a server event, checking header agreement.
    pub fn to_event(&self) -> Result<ServerEvent, FrameError> {
        self.expect_kind(FrameKind::Event)?;
        let msg: ServerEvent = wire::deserialize(self.content_type, &self.body)?;
        if msg.opcode() != self.opcode {
            return Err(FrameError::OpcodeMismatch {
                header: self.opcode,
                body: msg.opcode(),
            });
        }
        if usize::from(self.n_fds) != msg.fd_count() {
            return Err(FrameError::FdCountMismatch {
                header: self.n_fds,
                needed: msg.fd_count(),
            });
        }
        Ok(msg)
    }

    fn expect_kind(&self, expected: FrameKind) -> Result<(), FrameError> {
        if self.kind != expected {
            return Err(FrameError::KindMismatch {
                expected,
                actual: self.kind,
            });
        }
        Ok(())
    }

    /// Append the encoded frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN + self.body.len());
        dst.put_slice(PROTOCOL_VERSION);
        dst.put_u8(self.kind as u8);
        dst.put_u16(self.opcode);
        dst.put_u16(self.content_type.to_u16());
        dst.put_u8(self.n_fds);
        dst.put_u32(self.body.len() as u32);
        dst.put_slice(&self.body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Try to take one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` until a whole frame is buffered. A malformed header
    /// is an error; the stream cannot be resynchronised after it.
    pub fn decode(src: &mut BytesMut, max_body: usize) -> Result<Option<Self>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        if &src[..6] != PROTOCOL_VERSION {
            return Err(FrameError::InvalidProtocol);
        }
        let kind = FrameKind::from_u8(src[6])?;
        let opcode = u16::from_be_bytes([src[7], src[8]]);
        let content_type = ContentType::from_u16(u16::from_be_bytes([src[9], src[10]]))?;
        let n_fds = src[11];
        let len = u32::from_be_bytes([src[12], src[13], src[14], src[15]]) as usize;

        let known = match kind {
            FrameKind::Method => opcode < method::NUM,
            FrameKind::Event => opcode < event::NUM,
        };
        if !known {
            return Err(FrameError::UnknownOpcode { kind, opcode });
        }
        if len > max_body {
            return Err(FrameError::TooLarge {
                len,
                limit: max_body,
            });
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(len).freeze();

        Ok(Some(Self {
            kind,
            opcode,
            content_type,
            n_fds,
            body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AckedEvent, Direction, FdIndex, MemFlags, MemId, PortId, Seq, UnackedEvent};

    #[test]
    fn content_type_roundtrip() {
        assert_eq!(ContentType::MsgPack.to_u16(), 0x0001);
        assert_eq!(ContentType::from_u16(0x0003).unwrap(), ContentType::Json);
        assert!(ContentType::from_u16(0x0002).is_err());
    }

    #[test]
    fn header_layout_is_fixed() {
        let frame = NodeFrame::method(&ClientMethod::Destroy, ContentType::MsgPack).unwrap();
        let bytes = frame.to_bytes();

        assert_eq!(&bytes[..6], PROTOCOL_VERSION);
        assert_eq!(bytes[6], FrameKind::Method as u8);
        assert_eq!(u16::from_be_bytes([bytes[7], bytes[8]]), method::DESTROY);
        assert_eq!(u16::from_be_bytes([bytes[9], bytes[10]]), 0x0001);
        assert_eq!(bytes[11], 0);
        assert_eq!(
            u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]) as usize,
            bytes.len() - HEADER_LEN
        );
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let frame = NodeFrame::method(
            &ClientMethod::Done {
                seq: Seq(9),
                res: 0,
            },
            ContentType::MsgPack,
        )
        .unwrap();
        let bytes = frame.to_bytes();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&bytes[..HEADER_LEN - 1]);
        assert!(NodeFrame::decode(&mut buf, DEFAULT_MAX_BODY).unwrap().is_none());

        buf.extend_from_slice(&bytes[HEADER_LEN - 1..bytes.len() - 1]);
        assert!(NodeFrame::decode(&mut buf, DEFAULT_MAX_BODY).unwrap().is_none());

        buf.extend_from_slice(&bytes[bytes.len() - 1..]);
        let parsed = NodeFrame::decode(&mut buf, DEFAULT_MAX_BODY).unwrap().unwrap();
        assert_eq!(parsed, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn back_to_back_frames_split_cleanly() {
        let first = NodeFrame::method(&ClientMethod::Destroy, ContentType::Json).unwrap();
        let second = NodeFrame::method(
            &ClientMethod::Done {
                seq: Seq(1),
                res: -1,
            },
            ContentType::MsgPack,
        )
        .unwrap();

        let mut buf = BytesMut::new();
        first.encode(&mut buf);
        second.encode(&mut buf);

        let a = NodeFrame::decode(&mut buf, DEFAULT_MAX_BODY).unwrap().unwrap();
        let b = NodeFrame::decode(&mut buf, DEFAULT_MAX_BODY).unwrap().unwrap();
        assert_eq!(a.to_method().unwrap(), ClientMethod::Destroy);
        assert_eq!(
            b.to_method().unwrap(),
            ClientMethod::Done {
                seq: Seq(1),
                res: -1
            }
        );
    }

    #[test]
    fn add_mem_announces_one_descriptor() {
        let msg = ServerEvent::Unacked(UnackedEvent::AddMem {
            direction: Direction::Output,
            port_id: PortId(0),
            mem_id: MemId(7),
            mem_type: 0,
            fd: FdIndex(0),
            flags: MemFlags::READWRITE,
            offset: 0,
            size: 4096,
        });
        let frame = NodeFrame::event(&msg, ContentType::MsgPack).unwrap();
        assert_eq!(frame.n_fds, 1);
        assert_eq!(frame.to_event().unwrap(), msg);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = BytesMut::from(&b"HOOT01\x00\x00\x00\x00\x01\x00\x00\x00\x00\x00"[..]);
        assert!(matches!(
            NodeFrame::decode(&mut buf, DEFAULT_MAX_BODY),
            Err(FrameError::InvalidProtocol)
        ));
    }

    #[test]
    fn oversized_body_is_rejected_from_header() {
        let frame = NodeFrame::method(
            &ClientMethod::Event {
                event: crate::Pod::new(1, vec![0u8; 512]),
            },
            ContentType::MsgPack,
        )
        .unwrap();
        let mut buf = BytesMut::from(&frame.to_bytes()[..HEADER_LEN]);
        assert!(matches!(
            NodeFrame::decode(&mut buf, 64),
            Err(FrameError::TooLarge { limit: 64, .. })
        ));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut frame = NodeFrame::method(&ClientMethod::Destroy, ContentType::MsgPack).unwrap();
        frame.opcode = 42;
        let mut buf = BytesMut::from(&frame.to_bytes()[..]);
        assert!(matches!(
            NodeFrame::decode(&mut buf, DEFAULT_MAX_BODY),
            Err(FrameError::UnknownOpcode { opcode: 42, .. })
        ));
    }

    #[test]
    fn header_body_disagreement_is_rejected() {
        let msg = ServerEvent::acked(
            Seq(4),
            AckedEvent::AddPort {
                direction: Direction::Input,
                port_id: PortId(1),
            },
        );
        let mut frame = NodeFrame::event(&msg, ContentType::MsgPack).unwrap();
        frame.opcode = event::REMOVE_PORT;
        assert!(matches!(
            frame.to_event(),
            Err(FrameError::OpcodeMismatch { .. })
        ));

        let frame = NodeFrame::event(&msg, ContentType::MsgPack).unwrap();
        assert!(matches!(
            frame.to_method(),
            Err(FrameError::KindMismatch { .. })
        ));
    }
}
