//! Protocol codec for encoding/decoding messages
//!
//! Frames arrive already delimited by the transport, so the codec only maps
//! between JSON text and `Message`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::{Message, OpCode};

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Unknown opcode: {0}")]
    UnknownOpcode(u64),

    #[error("Invalid {op} payload: {source}")]
    InvalidPayload {
        op: OpCode,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
}

/// Envelope shared by every frame
#[derive(Serialize, Deserialize)]
struct RawFrame {
    op: u64,
    #[serde(default)]
    d: Value,
}

/// Encode a message into its JSON text form
pub fn encode(message: &Message) -> Result<String, CodecError> {
    let d = match message {
        Message::Hello(p) => serde_json::to_value(p),
        Message::Identify(p) => serde_json::to_value(p),
        Message::Identified(p) => serde_json::to_value(p),
        Message::Reidentify(p) => serde_json::to_value(p),
        Message::Event(p) => serde_json::to_value(p),
        Message::Request(p) => serde_json::to_value(p),
        Message::RequestResponse(p) => serde_json::to_value(p),
        Message::RequestBatch(p) => serde_json::to_value(p),
        Message::RequestBatchResponse(p) => serde_json::to_value(p),
    }
    .map_err(CodecError::Serialization)?;

    let frame = RawFrame {
        op: message.op_code() as u64,
        d,
    };
    serde_json::to_string(&frame).map_err(CodecError::Serialization)
}

/// Decode a JSON text frame into a message
pub fn decode(text: &str) -> Result<Message, CodecError> {
    let frame: RawFrame = serde_json::from_str(text).map_err(CodecError::Parse)?;

    let op = u8::try_from(frame.op)
        .ok()
        .and_then(OpCode::from_u8)
        .ok_or(CodecError::UnknownOpcode(frame.op))?;

    let d = frame.d;
    let invalid = |source| CodecError::InvalidPayload { op, source };

    let message = match op {
        OpCode::Hello => Message::Hello(serde_json::from_value(d).map_err(invalid)?),
        OpCode::Identify => Message::Identify(serde_json::from_value(d).map_err(invalid)?),
        OpCode::Identified => Message::Identified(serde_json::from_value(d).map_err(invalid)?),
        OpCode::Reidentify => Message::Reidentify(serde_json::from_value(d).map_err(invalid)?),
        OpCode::Event => Message::Event(serde_json::from_value(d).map_err(invalid)?),
        OpCode::Request => Message::Request(serde_json::from_value(d).map_err(invalid)?),
        OpCode::RequestResponse => {
            Message::RequestResponse(serde_json::from_value(d).map_err(invalid)?)
        }
        OpCode::RequestBatch => Message::RequestBatch(serde_json::from_value(d).map_err(invalid)?),
        OpCode::RequestBatchResponse => {
            Message::RequestBatchResponse(serde_json::from_value(d).map_err(invalid)?)
        }
    };

    Ok(message)
}
