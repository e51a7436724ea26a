//! Transport codec for request and response envelopes.
//!
//! Envelopes are written as a single self-delimited named `MsgPack` object
//! (`rmp_serde::to_vec_named`). Values wrapped in [`Value::Shared`] keep
//! their identity across the wire: the first occurrence of an `Arc` is
//! written as a definition carrying a numeric id, and every later occurrence
//! in the same payload graph is written as a back-reference to that id.
//! Decoding rebuilds exactly one `Arc` per id.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::io::Cursor;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::value::{Failure, ObjectId, TypeTag, Value};

/// Content type of encoded envelopes.
pub const CONTENT_TYPE: &str = "application/x-devrelay-msgpack";

/// Maximum value nesting depth accepted in either direction.
pub const MAX_DEPTH: usize = 128;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Codec failures. These abort the exchange before (decode) or instead of
/// (encode) a response; they are never carried inside an envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("cannot encode value at {path}: {reason}")]
    Encoding { path: String, reason: String },
    #[error("malformed payload: {reason}")]
    Decoding { reason: String },
}

impl CodecError {
    fn decoding(reason: impl Into<String>) -> Self {
        Self::Decoding {
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire representation
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
enum WireValue {
    Null,
    Bool(bool),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    Object {
        class: String,
        fields: BTreeMap<String, WireValue>,
    },
    Failure(Failure),
    /// First occurrence of a shared node.
    Def { id: u32, value: Box<WireValue> },
    /// Later occurrence of a shared node.
    Ref(u32),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    action: String,
    method: String,
    #[serde(rename = "objectID", default, skip_serializing_if = "Option::is_none")]
    object_id: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    class_param: Vec<WireValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    method_param: Vec<WireValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    method_param_types: Vec<TypeTag>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireResponse {
    result: Vec<WireValue>,
    #[serde(rename = "objectID", default, skip_serializing_if = "Option::is_none")]
    object_id: Option<ObjectId>,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

enum Segment {
    Field(&'static str),
    Index(usize),
    Key(String),
}

/// Walks one payload graph, assigning ids to shared nodes by `Arc` identity.
#[derive(Default)]
struct GraphEncoder {
    ids: HashMap<*const Value, u32>,
    path: Vec<Segment>,
}

impl GraphEncoder {
    fn path_string(&self) -> String {
        let mut out = String::new();
        for seg in &self.path {
            match seg {
                Segment::Field(name) => {
                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push_str(name);
                }
                Segment::Index(i) => {
                    let _ = write!(out, "[{i}]");
                }
                Segment::Key(k) => {
                    let _ = write!(out, "[{k:?}]");
                }
            }
        }
        out
    }

    fn fail(&self, reason: impl Into<String>) -> CodecError {
        CodecError::Encoding {
            path: self.path_string(),
            reason: reason.into(),
        }
    }

    fn seq(&mut self, field: &'static str, values: &[Value]) -> Result<Vec<WireValue>, CodecError> {
        self.path.push(Segment::Field(field));
        let mut out = Vec::with_capacity(values.len());
        for (i, v) in values.iter().enumerate() {
            self.path.push(Segment::Index(i));
            out.push(self.value(v, 1)?);
            self.path.pop();
        }
        self.path.pop();
        Ok(out)
    }

    fn entries(
        &mut self,
        map: &BTreeMap<String, Value>,
        depth: usize,
    ) -> Result<BTreeMap<String, WireValue>, CodecError> {
        let mut out = BTreeMap::new();
        for (k, v) in map {
            self.path.push(Segment::Key(k.clone()));
            out.insert(k.clone(), self.value(v, depth + 1)?);
            self.path.pop();
        }
        Ok(out)
    }

    fn value(&mut self, value: &Value, depth: usize) -> Result<WireValue, CodecError> {
        if depth > MAX_DEPTH {
            return Err(self.fail(format!("nesting exceeds {MAX_DEPTH} levels")));
        }
        Ok(match value {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Short(v) => WireValue::Short(*v),
            Value::Int(v) => WireValue::Int(*v),
            Value::Long(v) => WireValue::Long(*v),
            Value::Float(v) => WireValue::Float(*v),
            Value::Double(v) => WireValue::Double(*v),
            Value::String(s) => WireValue::Str(s.clone()),
            Value::Bytes(b) => WireValue::Bytes(b.clone()),
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, v) in items.iter().enumerate() {
                    self.path.push(Segment::Index(i));
                    out.push(self.value(v, depth + 1)?);
                    self.path.pop();
                }
                WireValue::List(out)
            }
            Value::Map(map) => WireValue::Map(self.entries(map, depth)?),
            Value::Object { class, fields } => {
                if class.is_empty() {
                    return Err(self.fail("object class name is empty"));
                }
                WireValue::Object {
                    class: class.clone(),
                    fields: self.entries(fields, depth)?,
                }
            }
            Value::Failure(failure) => {
                if depth + failure.depth() > MAX_DEPTH {
                    return Err(self.fail(format!(
                        "failure chain of {} causes exceeds {MAX_DEPTH} levels",
                        failure.depth()
                    )));
                }
                WireValue::Failure(failure.clone())
            }
            Value::Shared(inner) => {
                let ptr = Arc::as_ptr(inner);
                if let Some(id) = self.ids.get(&ptr) {
                    return Ok(WireValue::Ref(*id));
                }
                let id = u32::try_from(self.ids.len())
                    .map_err(|_| self.fail("too many shared nodes in one payload"))?;
                self.ids.insert(ptr, id);
                WireValue::Def {
                    id,
                    value: Box::new(self.value(inner, depth + 1)?),
                }
            }
        })
    }
}

fn to_frame<T: Serialize>(wire: &T) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec_named(wire).map_err(|e| CodecError::Encoding {
        path: "envelope".to_string(),
        reason: e.to_string(),
    })
}

/// Encodes a request envelope into one frame.
///
/// # Errors
///
/// Returns `CodecError::Encoding` naming the offending value's path.
pub fn encode_request(req: &RequestEnvelope) -> Result<Vec<u8>, CodecError> {
    let mut enc = GraphEncoder::default();
    let wire = WireRequest {
        action: req.action.clone(),
        method: req.method.clone(),
        object_id: req.object_id,
        class_param: enc.seq("classParam", &req.class_param)?,
        method_param: enc.seq("methodParam", &req.method_param)?,
        method_param_types: req.method_param_types.clone(),
    };
    to_frame(&wire)
}

/// Encodes a response envelope into one frame.
///
/// # Errors
///
/// Returns `CodecError::Encoding` naming the offending value's path.
pub fn encode_response(resp: &ResponseEnvelope) -> Result<Vec<u8>, CodecError> {
    let mut enc = GraphEncoder::default();
    let wire = WireResponse {
        result: enc.seq("result", &resp.result)?,
        object_id: resp.object_id,
    };
    to_frame(&wire)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Rebuilds shared identity from definitions and back-references.
#[derive(Default)]
struct GraphDecoder {
    table: HashMap<u32, Arc<Value>>,
}

impl GraphDecoder {
    fn seq(&mut self, values: Vec<WireValue>) -> Result<Vec<Value>, CodecError> {
        values.into_iter().map(|v| self.value(v, 1)).collect()
    }

    fn entries(
        &mut self,
        map: BTreeMap<String, WireValue>,
        depth: usize,
    ) -> Result<BTreeMap<String, Value>, CodecError> {
        map.into_iter()
            .map(|(k, v)| Ok((k, self.value(v, depth + 1)?)))
            .collect()
    }

    fn value(&mut self, wire: WireValue, depth: usize) -> Result<Value, CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::decoding(format!(
                "nesting exceeds {MAX_DEPTH} levels"
            )));
        }
        Ok(match wire {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Short(v) => Value::Short(v),
            WireValue::Int(v) => Value::Int(v),
            WireValue::Long(v) => Value::Long(v),
            WireValue::Float(v) => Value::Float(v),
            WireValue::Double(v) => Value::Double(v),
            WireValue::Str(s) => Value::String(s),
            WireValue::Bytes(b) => Value::Bytes(b),
            WireValue::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|v| self.value(v, depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            WireValue::Map(map) => Value::Map(self.entries(map, depth)?),
            WireValue::Object { class, fields } => Value::Object {
                class,
                fields: self.entries(fields, depth)?,
            },
            WireValue::Failure(f) => {
                if depth + f.depth() > MAX_DEPTH {
                    return Err(CodecError::decoding(format!(
                        "failure chain of {} causes exceeds {MAX_DEPTH} levels",
                        f.depth()
                    )));
                }
                Value::Failure(f)
            }
            WireValue::Def { id, value } => {
                if self.table.contains_key(&id) {
                    return Err(CodecError::decoding(format!("shared node {id} defined twice")));
                }
                let node = Arc::new(self.value(*value, depth + 1)?);
                self.table.insert(id, Arc::clone(&node));
                Value::Shared(node)
            }
            WireValue::Ref(id) => match self.table.get(&id) {
                Some(node) => Value::Shared(Arc::clone(node)),
                None => {
                    return Err(CodecError::decoding(format!(
                        "reference to undefined shared node {id}"
                    )))
                }
            },
        })
    }
}

/// Reads exactly one frame; trailing bytes are rejected.
fn from_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let mut cursor = Cursor::new(bytes);
    let wire = {
        let mut de = rmp_serde::Deserializer::new(&mut cursor);
        T::deserialize(&mut de).map_err(|e| {
            warn!(error = %e, len = bytes.len(), "rejecting malformed envelope");
            CodecError::decoding(e.to_string())
        })?
    };
    let consumed = usize::try_from(cursor.position()).unwrap_or(usize::MAX);
    if consumed != bytes.len() {
        return Err(CodecError::decoding(format!(
            "{} trailing bytes after envelope",
            bytes.len().saturating_sub(consumed)
        )));
    }
    Ok(wire)
}

/// Decodes a request frame.
///
/// # Errors
///
/// Returns `CodecError::Decoding` on malformed input.
pub fn decode_request(bytes: &[u8]) -> Result<RequestEnvelope, CodecError> {
    let wire: WireRequest = from_frame(bytes)?;
    if wire.method_param_types.len() != wire.method_param.len() {
        return Err(CodecError::decoding(format!(
            "methodParamTypes has {} entries for {} methodParam values",
            wire.method_param_types.len(),
            wire.method_param.len()
        )));
    }
    let mut dec = GraphDecoder::default();
    Ok(RequestEnvelope {
        action: wire.action,
        method: wire.method,
        object_id: wire.object_id,
        class_param: dec.seq(wire.class_param)?,
        method_param: dec.seq(wire.method_param)?,
        method_param_types: wire.method_param_types,
    })
}

/// Decodes a response frame.
///
/// # Errors
///
/// Returns `CodecError::Decoding` on malformed input.
pub fn decode_response(bytes: &[u8]) -> Result<ResponseEnvelope, CodecError> {
    let wire: WireResponse = from_frame(bytes)?;
    let mut dec = GraphDecoder::default();
    Ok(ResponseEnvelope {
        result: dec.seq(wire.result)?,
        object_id: wire.object_id,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn response_round_trip_law() {
        let resp = ResponseEnvelope::value(Value::Int(42));
        let resp = ResponseEnvelope {
            result: vec![resp.result[0].clone(), Value::from("ok")],
            object_id: None,
        };
        let bytes = encode_response(&resp).expect("encode");
        let decoded = decode_response(&bytes).expect("decode");
        assert_eq!(decoded, resp);
    }

    #[test]
    fn request_round_trip_preserves_fields() {
        let req = RequestEnvelope::on_object("DeviceProxy", ObjectId(7), "write_attribute")
            .arg("Current")
            .arg(1.5_f64);
        let decoded = decode_request(&encode_request(&req).expect("encode")).expect("decode");
        assert_eq!(decoded, req);
        assert_eq!(decoded.object_id, Some(ObjectId(7)));
    }

    #[test]
    fn shared_node_decodes_to_single_identity() {
        let shared = Arc::new(Value::from("same"));
        let resp = ResponseEnvelope {
            result: vec![Value::List(vec![
                Value::Shared(Arc::clone(&shared)),
                Value::Shared(Arc::clone(&shared)),
            ])],
            object_id: None,
        };
        let decoded = decode_response(&encode_response(&resp).expect("encode")).expect("decode");
        let Value::List(items) = &decoded.result[0] else {
            panic!("expected list, got {:?}", decoded.result[0]);
        };
        match (&items[0], &items[1]) {
            (Value::Shared(a), Value::Shared(b)) => assert!(Arc::ptr_eq(a, b)),
            other => panic!("expected two shared nodes, got {other:?}"),
        }
    }

    #[test]
    fn sharing_spans_the_whole_envelope() {
        let shared = Arc::new(Value::Long(9));
        let resp = ResponseEnvelope {
            result: vec![
                Value::Shared(Arc::clone(&shared)),
                Value::Map(BTreeMap::from([(
                    "again".to_string(),
                    Value::Shared(Arc::clone(&shared)),
                )])),
            ],
            object_id: None,
        };
        let decoded = decode_response(&encode_response(&resp).expect("encode")).expect("decode");
        let Value::Shared(first) = &decoded.result[0] else {
            panic!("expected shared node");
        };
        let Value::Map(map) = &decoded.result[1] else {
            panic!("expected map");
        };
        let Value::Shared(second) = &map["again"] else {
            panic!("expected shared node");
        };
        assert!(Arc::ptr_eq(first, second));
    }

    #[test]
    fn nested_failure_survives_round_trip() {
        let failure = Failure::new("API_CommandFailed", "command failed")
            .with_origin("sys/tg_test/1")
            .caused_by(
                Failure::new("API_DeviceTimedOut", "timeout")
                    .caused_by(Failure::new("API_CorbaException", "transient")),
            );
        let resp = ResponseEnvelope {
            result: vec![Value::List(vec![Value::Failure(failure.clone())])],
            object_id: Some(ObjectId(2)),
        };
        let decoded = decode_response(&encode_response(&resp).expect("encode")).expect("decode");
        assert_eq!(decoded, resp);
        let Value::List(items) = &decoded.result[0] else {
            panic!("expected list");
        };
        assert_eq!(items[0].as_failure().map(Failure::depth), Some(3));
    }

    #[test]
    fn encoding_error_names_offending_path() {
        let mut deep = Value::Null;
        for _ in 0..=MAX_DEPTH {
            deep = Value::List(vec![deep]);
        }
        let resp = ResponseEnvelope {
            result: vec![Value::Int(1), deep],
            object_id: None,
        };
        match encode_response(&resp) {
            Err(CodecError::Encoding { path, .. }) => assert!(path.starts_with("result[1][0]")),
            other => panic!("expected encoding error, got {other:?}"),
        }
    }

    fn failure_chain(causes: usize) -> Failure {
        (0..causes).fold(Failure::new("API_Root", "root"), |inner, n| {
            Failure::new("API_Wrapped", format!("layer {n}")).caused_by(inner)
        })
    }

    #[test]
    fn overlong_failure_chain_is_refused_both_ways() {
        let deep = failure_chain(MAX_DEPTH);
        let resp = ResponseEnvelope::failure(deep.clone());
        assert!(matches!(
            encode_response(&resp),
            Err(CodecError::Encoding { .. })
        ));

        // Hand-built frame, as a peer without the encoder-side cap would send.
        let frame = to_frame(&WireResponse {
            result: vec![WireValue::Failure(deep)],
            object_id: None,
        })
        .unwrap();
        let err = decode_response(&frame).unwrap_err();
        assert!(matches!(err, CodecError::Decoding { .. }));
        assert!(err.to_string().contains("failure chain"));

        // The longest chain one side accepts, the other side accepts too.
        let longest = ResponseEnvelope::failure(failure_chain(MAX_DEPTH - 2));
        let decoded = decode_response(&encode_response(&longest).unwrap()).unwrap();
        assert_eq!(decoded, longest);
    }

    #[test]
    fn empty_object_class_is_rejected() {
        let resp = ResponseEnvelope::value(Value::Map(BTreeMap::from([(
            "data".to_string(),
            Value::Object {
                class: String::new(),
                fields: BTreeMap::new(),
            },
        )])));
        let err = encode_response(&resp).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot encode value at result[0][\"data\"]: object class name is empty"
        );
    }

    #[test]
    fn garbage_is_a_decoding_error() {
        let err = decode_request(&[0xc1, 0x00, 0xff]).unwrap_err();
        assert!(matches!(err, CodecError::Decoding { .. }));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode_response(&ResponseEnvelope::value(Value::Null)).expect("encode");
        bytes.push(0x00);
        let err = decode_response(&bytes).unwrap_err();
        assert!(err.to_string().contains("trailing"));
    }

    #[test]
    fn dangling_reference_is_rejected() {
        let wire = WireResponse {
            result: vec![WireValue::Ref(5)],
            object_id: None,
        };
        let bytes = rmp_serde::to_vec_named(&wire).expect("serialize");
        let err = decode_response(&bytes).unwrap_err();
        assert!(err.to_string().contains("undefined shared node 5"));
    }

    #[test]
    fn mismatched_type_list_is_rejected() {
        let mut req = RequestEnvelope::on_object("DeviceProxy", ObjectId(1), "ping").arg(1_i32);
        req.method_param_types.clear();
        let err = decode_request(&encode_request(&req).expect("encode")).unwrap_err();
        assert!(err.to_string().contains("methodParamTypes"));
    }

    fn scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i16>().prop_map(Value::Short),
            any::<i32>().prop_map(Value::Int),
            any::<i64>().prop_map(Value::Long),
            (-1.0e6_f64..1.0e6).prop_map(Value::Double),
            "[a-z/_]{0,12}".prop_map(Value::String),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
        ]
    }

    fn tree() -> impl Strategy<Value = Value> {
        scalar().prop_recursive(4, 32, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
                proptest::collection::btree_map("[a-z]{1,6}", inner.clone(), 0..4)
                    .prop_map(Value::Map),
                inner.prop_map(Value::shared),
            ]
        })
    }

    proptest! {
        #[test]
        fn decoded_response_equals_original(values in proptest::collection::vec(tree(), 0..4)) {
            let resp = ResponseEnvelope { result: values, object_id: None };
            let bytes = encode_response(&resp).expect("encode");
            prop_assert_eq!(decode_response(&bytes).expect("decode"), resp);
        }
    }
}
