//! RPC payload model: variant tree, schema validation, wire codec.

pub mod codec;
pub mod message;
pub mod schema;
pub mod value;

pub use codec::{decode_payload, encode_payload, CodecError};
pub use message::{FunctionId, ResultCode, RpcMessage, RpcMessageType, UnregisteredReason};
pub use schema::{Member, Schema, ValidationError};
pub use value::RpcValue;
