//! Channel frame format.
//!
//! Frames are JSON objects in length-prefixed frames (4-byte big-endian
//! length). Payloads inside a frame are opaque call or reply bytes,
//! base64-encoded so a frame stays valid JSON whichever wire encoding the
//! call itself uses. Call ids are minted by the client and never reused
//! within a connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use wirecall_core::{AuthError, CallKind, Encoding};

/// Opaque payload bytes carried inside a JSON frame.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD
            .decode(text)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Why the server turned a call away without dispatching it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Refusal {
    Unauthenticated,
    Forbidden { detail: String },
    NotFound,
}

impl From<Refusal> for crate::TransportError {
    fn from(refusal: Refusal) -> Self {
        match refusal {
            Refusal::Unauthenticated => {
                crate::TransportError::Refused(AuthError::Unauthenticated)
            }
            Refusal::Forbidden { detail } => {
                crate::TransportError::Refused(AuthError::Forbidden(detail))
            }
            Refusal::NotFound => crate::TransportError::NotFound,
        }
    }
}

/// One channel frame. `id` always names the call the frame belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client -> server: start a call.
    Call {
        id: u64,
        method: String,
        kind: CallKind,
        encoding: Encoding,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credential: Option<String>,
        #[serde(with = "b64")]
        payload: Bytes,
    },
    /// Server -> client: the unary reply union.
    Reply {
        id: u64,
        #[serde(with = "b64")]
        payload: Bytes,
    },
    /// Server -> client: one stream item.
    Item {
        id: u64,
        #[serde(with = "b64")]
        payload: Bytes,
    },
    /// Server -> client: normal stream termination.
    Complete { id: u64 },
    /// Server -> client: stream termination with an encoded error record.
    StreamError {
        id: u64,
        #[serde(with = "b64")]
        payload: Bytes,
    },
    /// Client -> server: grant `n` more items of stream demand.
    Credit { id: u64, n: u64 },
    /// Client -> server: abandon a stream.
    Cancel { id: u64 },
    /// Server -> client: the call was turned away before dispatch.
    Refused { id: u64, refusal: Refusal },
}

impl Frame {
    pub fn id(&self) -> u64 {
        match self {
            Frame::Call { id, .. }
            | Frame::Reply { id, .. }
            | Frame::Item { id, .. }
            | Frame::Complete { id }
            | Frame::StreamError { id, .. }
            | Frame::Credit { id, .. }
            | Frame::Cancel { id }
            | Frame::Refused { id, .. } => *id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameCodecError {
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Length-prefixed JSON frame codec for channel connections.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: 10 * 1024 * 1024,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameCodecError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let frame_len = u32::from_be_bytes(length_bytes) as usize;

        if frame_len > self.max_frame_size {
            return Err(FrameCodecError::FrameTooLarge(frame_len));
        }

        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame_data = src.split_to(frame_len);
        Ok(Some(serde_json::from_slice(&frame_data)?))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameCodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), FrameCodecError> {
        let json_bytes = serde_json::to_vec(&item)?;
        if json_bytes.len() > self.max_frame_size {
            return Err(FrameCodecError::FrameTooLarge(json_bytes.len()));
        }
        dst.reserve(4 + json_bytes.len());
        dst.put_u32(json_bytes.len() as u32);
        dst.put_slice(&json_bytes);
        Ok(())
    }
}
