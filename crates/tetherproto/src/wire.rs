//! Body encodings for frames.
//!
//! MessagePack in production, JSON for debugging.

use serde::{de::DeserializeOwned, Serialize};

use crate::frame::{ContentType, FrameError};

/// Wire format for serializing frame bodies
pub trait WireFormat {
    const CONTENT_TYPE: ContentType;

    fn serialize<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError>;
    fn deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T, FrameError>;
}

/// MessagePack format - fast and compact for production
pub struct MsgPackFormat;

impl WireFormat for MsgPackFormat {
    const CONTENT_TYPE: ContentType = ContentType::MsgPack;

    fn serialize<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
        Ok(rmp_serde::to_vec(msg)?)
    }

    fn deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T, FrameError> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// JSON format - readable for debugging
pub struct JsonFormat;

impl WireFormat for JsonFormat {
    const CONTENT_TYPE: ContentType = ContentType::Json;

    fn serialize<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
        Ok(serde_json::to_vec(msg)?)
    }

    fn deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T, FrameError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Encode with the format named by `content_type`.
pub fn serialize<T: Serialize>(content_type: ContentType, msg: &T) -> Result<Vec<u8>, FrameError> {
    match content_type {
        ContentType::MsgPack => MsgPackFormat::serialize(msg),
        ContentType::Json => JsonFormat::serialize(msg),
        ContentType::Empty => Err(FrameError::EmptyBody),
    }
}

/// Decode with the format named by `content_type`.
pub fn deserialize<T: DeserializeOwned>(
    content_type: ContentType,
    data: &[u8],
) -> Result<T, FrameError> {
    match content_type {
        ContentType::MsgPack => MsgPackFormat::deserialize(data),
        ContentType::Json => JsonFormat::deserialize(data),
        ContentType::Empty => Err(FrameError::EmptyBody),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClientMethod, NodeChange, Pod, Seq};

    #[test]
    fn test_msgpack_roundtrip() {
        let msg = ClientMethod::Done {
            seq: Seq(16),
            res: -22,
        };
        let bytes = MsgPackFormat::serialize(&msg).unwrap();
        let decoded: ClientMethod = MsgPackFormat::deserialize(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_json_roundtrip() {
        let msg = ClientMethod::Update {
            change_mask: NodeChange::MAX_OUTPUTS | NodeChange::PROPS,
            max_input_ports: 0,
            max_output_ports: 2,
            props: Some(Pod::new(3, &b"volume=0.5"[..])),
        };
        let bytes = JsonFormat::serialize(&msg).unwrap();
        let decoded: ClientMethod = JsonFormat::deserialize(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_msgpack_is_compact() {
        let msg = ClientMethod::Destroy;
        let msgpack_bytes = MsgPackFormat::serialize(&msg).unwrap();
        let json_bytes = JsonFormat::serialize(&msg).unwrap();
        assert!(msgpack_bytes.len() <= json_bytes.len());
    }

    #[test]
    fn test_empty_content_type_has_no_codec() {
        assert!(matches!(
            serialize(ContentType::Empty, &ClientMethod::Destroy),
            Err(FrameError::EmptyBody)
        ));
    }
}
