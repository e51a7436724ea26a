//! `DevRelay` Core: typed values, request/response envelopes, and the transport codec.

pub mod codec;
pub mod envelope;
pub mod value;

pub use codec::{
    decode_request, decode_response, encode_request, encode_response, CodecError, CONTENT_TYPE,
};
pub use envelope::{actions, RequestEnvelope, ResponseEnvelope};
pub use value::{format_signature, CallId, Failure, FromValue, IntoValue, ObjectId, TypeTag, Value};
