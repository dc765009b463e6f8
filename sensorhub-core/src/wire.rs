//! Framing: length-prefix (4 bytes BE) + JSON envelope.
//!
//! Envelope: `{message_type, timestamp, device_id, payload, checksum}` where `checksum`
//! covers `payload` (see [`crate::integrity::payload_checksum`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::integrity;
use crate::protocol::{Message, Payload};

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

#[derive(Serialize, Deserialize)]
struct Envelope {
    message_type: String,
    timestamp: i64,
    device_id: String,
    #[serde(default)]
    payload: Value,
    checksum: String,
}

/// Serialize a message into its JSON envelope (no length prefix).
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let tagged = serde_json::to_value(&msg.body)?;
    let Value::Object(mut fields) = tagged else {
        return Err(FrameEncodeError::Shape);
    };
    let message_type = match fields.remove("message_type") {
        Some(Value::String(s)) => s,
        _ => return Err(FrameEncodeError::Shape),
    };
    let payload = fields.remove("payload").unwrap_or(Value::Null);
    let envelope = Envelope {
        checksum: integrity::payload_checksum(&payload),
        message_type,
        timestamp: msg.timestamp,
        device_id: msg.device_id.clone(),
        payload,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Parse a JSON envelope, verify its checksum and decode the typed payload.
pub fn decode_message(bytes: &[u8]) -> Result<Message, FrameDecodeError> {
    let envelope: Envelope = serde_json::from_slice(bytes).map_err(FrameDecodeError::Decode)?;
    if !integrity::verify_payload(&envelope.payload, &envelope.checksum) {
        return Err(FrameDecodeError::ChecksumMismatch {
            message_type: envelope.message_type,
        });
    }
    let tagged = serde_json::json!({
        "message_type": envelope.message_type.clone(),
        "payload": envelope.payload,
    });
    let body: Payload =
        serde_json::from_value(tagged).map_err(|source| FrameDecodeError::Payload {
            message_type: envelope.message_type,
            source,
        })?;
    Ok(Message {
        timestamp: envelope.timestamp,
        device_id: envelope.device_id,
        body,
    })
}

/// Encode a message into a single frame: 4 bytes BE length + JSON envelope.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = encode_message(msg)?;
    let len = payload.len() as u32;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Body length announced by a length prefix. Rejects oversized frames before allocating.
pub fn frame_len(prefix: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = decode_message(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

/// Error encoding a message into a frame (serialization or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("payload did not serialize as a tagged object")]
    Shape,
    #[error("frame too large")]
    TooLarge,
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("malformed envelope: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("checksum mismatch on {message_type}")]
    ChecksumMismatch { message_type: String },
    #[error("invalid {message_type} payload: {source}")]
    Payload {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FrameDecodeError {
    /// Frame was well-formed at the length level but its content is unusable.
    /// The channel stays up; the frame is dropped.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            FrameDecodeError::Decode(_)
                | FrameDecodeError::ChecksumMismatch { .. }
                | FrameDecodeError::Payload { .. }
        )
    }
}
