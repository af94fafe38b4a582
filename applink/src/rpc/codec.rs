//! RPC payload codec for the mobile wire forms.
//!
//! Protocol v2 and later prefix the JSON parameters with a 12-byte
//! binary header; optional bulk data follows the JSON:
//!
//! ```text
//! ┌──────────────────────────┬───────────────────────────────────────┐
//! │ Type(4) FunctionId(28)   │ big-endian, type in the high nibble   │
//! ├──────────────────────────┼───────────────────────────────────────┤
//! │ Correlation id (u32 BE)  │                                       │
//! ├──────────────────────────┼───────────────────────────────────────┤
//! │ JSON size (u32 BE)       │ JSON follows, bulk data after it      │
//! └──────────────────────────┴───────────────────────────────────────┘
//! ```
//!
//! Protocol v1 carries bare JSON with a single top-level wrapper naming
//! the message kind: `{"request": {"name": …, "correlationID": …,
//! "parameters": {…}}}`.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::protocol::packet::Version;
use crate::rpc::message::{FunctionId, RpcMessage, RpcMessageType};
use crate::rpc::value::RpcValue;
use crate::session::ConnectionKey;
use crate::trace::warn;

/// Size of the v2 binary payload header.
pub const RPC_HEADER_SIZE: usize = 12;

/// Errors decoding an RPC payload.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload shorter than rpc header")]
    TooShort,
    #[error("unknown rpc envelope type {0}")]
    UnknownType(u8),
    #[error("json size {declared} exceeds payload {available}")]
    JsonOverrun { declared: usize, available: usize },
    #[error("json body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("v1 payload has no recognizable wrapper")]
    BadWrapper,
}

/// Decodes a mobile payload by the session's protocol version.
pub fn decode_payload(
    key: ConnectionKey,
    version: Version,
    payload: &Bytes,
) -> Result<RpcMessage, CodecError> {
    match version {
        Version::V1 => decode_v1(key, payload),
        _ => decode_v2(key, version, payload),
    }
}

/// Encodes a message into the wire form of its protocol version.
pub fn encode_payload(message: &RpcMessage) -> Result<Bytes, CodecError> {
    match message.version {
        Version::V1 => encode_v1(message),
        _ => encode_v2(message),
    }
}

fn decode_v2(key: ConnectionKey, version: Version, payload: &Bytes) -> Result<RpcMessage, CodecError> {
    if payload.len() < RPC_HEADER_SIZE {
        return Err(CodecError::TooShort);
    }
    let message_type = RpcMessageType::try_from(payload[0] >> 4).map_err(CodecError::UnknownType)?;
    let function_id = FunctionId(u32::from_be_bytes([
        payload[0] & 0x0F,
        payload[1],
        payload[2],
        payload[3],
    ]));
    let correlation_id = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let json_size =
        u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]) as usize;

    let available = payload.len() - RPC_HEADER_SIZE;
    if json_size > available {
        return Err(CodecError::JsonOverrun {
            declared: json_size,
            available,
        });
    }

    let params = if json_size == 0 {
        RpcValue::object()
    } else {
        RpcValue::from_json_slice(&payload[RPC_HEADER_SIZE..RPC_HEADER_SIZE + json_size])?
    };
    let binary = if json_size < available {
        Some(payload.slice(RPC_HEADER_SIZE + json_size..))
    } else {
        None
    };

    Ok(RpcMessage {
        key,
        function_id,
        correlation_id,
        message_type,
        version,
        params,
        binary,
    })
}

fn encode_v2(message: &RpcMessage) -> Result<Bytes, CodecError> {
    let json = message.params.to_json_vec()?;
    let bulk_len = message.binary.as_ref().map_or(0, Bytes::len);
    let mut buf = BytesMut::with_capacity(RPC_HEADER_SIZE + json.len() + bulk_len);

    buf.put_u8(((message.message_type as u8) << 4) | ((message.function_id.0 >> 24) & 0x0F) as u8);
    buf.put_u8((message.function_id.0 >> 16) as u8);
    buf.put_u8((message.function_id.0 >> 8) as u8);
    buf.put_u8(message.function_id.0 as u8);
    buf.put_u32(message.correlation_id);
    buf.put_u32(json.len() as u32);
    buf.extend_from_slice(&json);
    if let Some(bulk) = &message.binary {
        buf.extend_from_slice(bulk);
    }
    Ok(buf.freeze())
}

const V1_WRAPPERS: [(&str, RpcMessageType); 3] = [
    ("request", RpcMessageType::Request),
    ("response", RpcMessageType::Response),
    ("notification", RpcMessageType::Notification),
];

fn decode_v1(key: ConnectionKey, payload: &Bytes) -> Result<RpcMessage, CodecError> {
    let root = RpcValue::from_json_slice(payload)?;
    for (wrapper, message_type) in V1_WRAPPERS {
        let Some(body) = root.get(wrapper) else {
            continue;
        };
        let function_id = body
            .get("name")
            .and_then(RpcValue::as_str)
            .map_or(FunctionId::UNKNOWN, FunctionId::from_name);
        if function_id == FunctionId::UNKNOWN {
            warn!(key = %key, "v1 message with unknown function name");
        }
        let correlation_id = body
            .get("correlationID")
            .and_then(RpcValue::as_i64)
            .unwrap_or(0) as u32;
        let params = body.get("parameters").cloned().unwrap_or_else(RpcValue::object);
        return Ok(RpcMessage {
            key,
            function_id,
            correlation_id,
            message_type,
            version: Version::V1,
            params,
            binary: None,
        });
    }
    Err(CodecError::BadWrapper)
}

fn encode_v1(message: &RpcMessage) -> Result<Bytes, CodecError> {
    let wrapper = V1_WRAPPERS
        .iter()
        .find(|(_, t)| *t == message.message_type)
        .map(|(name, _)| *name)
        .unwrap_or("notification");

    let mut body = RpcValue::object();
    if let Some(name) = message.function_id.name() {
        body.set("name", name);
    }
    if message.message_type != RpcMessageType::Notification {
        body.set("correlationID", message.correlation_id);
    }
    body.set("parameters", message.params.clone());

    let mut root = RpcValue::object();
    root.set(wrapper, body);
    Ok(Bytes::from(root.to_json_vec()?))
}
