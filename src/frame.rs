//! Frame handling: decode a byte stream holding one or more consecutive messages of a type.
//!
//! Messages start on byte boundaries. A message that fails to decode is reported as removed
//! together with the rest of the input; no attempt is made to resynchronise after it.

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::codec::Codec;
use crate::error::CodecError;
use crate::value::Value;

/// Result of decoding a frame: the messages that decoded, and what was dropped.
#[derive(Debug)]
pub struct FrameDecodeResult {
    pub messages: Vec<DecodedMessage>,
    pub removed: Vec<RemovedMessage>,
}

#[derive(Debug)]
pub struct DecodedMessage {
    pub value: Value,
    pub byte_range: (usize, usize),
}

#[derive(Debug)]
pub struct RemovedMessage {
    pub byte_range: (usize, usize),
    pub reason: String,
}

/// Decode messages of `type_name` back to back until the input is exhausted.
pub fn decode_frame(codec: &Codec, type_name: &str, bytes: &[u8]) -> Result<FrameDecodeResult, CodecError> {
    if codec.context().id_of(type_name).is_none() {
        return Err(CodecError::UnknownType(type_name.to_string()));
    }
    let mut buf = ReadBuffer::new(bytes, codec.byte_order());
    let mut messages = Vec::new();
    let mut removed = Vec::new();

    while buf.has_more(8) {
        let start = (buf.get_pos() / 8) as usize;
        match codec.decode_from(type_name, &mut buf, &[]) {
            Ok(value) => {
                buf.align()?;
                let end = (buf.get_pos() / 8) as usize;
                if end == start {
                    break;
                }
                messages.push(DecodedMessage {
                    value,
                    byte_range: (start, end),
                });
            }
            Err(e) => {
                removed.push(RemovedMessage {
                    byte_range: (start, bytes.len()),
                    reason: e.to_string(),
                });
                break;
            }
        }
    }

    Ok(FrameDecodeResult { messages, removed })
}

/// Encode messages back to back, each starting on a byte boundary.
pub fn encode_frame(codec: &Codec, type_name: &str, messages: &[Value]) -> Result<Vec<u8>, CodecError> {
    let mut buf = WriteBuffer::new(codec.byte_order());
    for message in messages {
        codec.encode_into(type_name, &mut buf, message, &[])?;
        buf.align()?;
    }
    Ok(buf.into_bytes())
}

/// Re-encode only the messages that decoded.
pub fn encode_frame_with_compliant_only(codec: &Codec, type_name: &str, result: &FrameDecodeResult) -> Result<Vec<u8>, CodecError> {
    let values: Vec<Value> = result.messages.iter().map(|m| m.value.clone()).collect();
    encode_frame(codec, type_name, &values)
}
