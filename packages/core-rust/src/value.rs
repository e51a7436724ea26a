//! Typed values carried in request and response envelopes.
//!
//! `Value` is the dynamic payload model: constructor arguments, method
//! arguments and return values are all `Value`s. `TypeTag` is the matching
//! type descriptor used for exact overload resolution, and the
//! `FromValue`/`IntoValue` traits bridge values to statically typed Rust
//! handler signatures.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Session-scoped handle to a delegate instance in the object registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj-{}", self.0)
    }
}

/// Session-scoped handle to an issued asynchronous call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

/// A captured failure, possibly chained to the failure that caused it.
///
/// Failures travel inside `ResponseEnvelope::result` as ordinary values, so a
/// client can always tell "my call failed" apart from "the relay broke".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    /// Taxonomy name (`UnknownObjectError`, ...) or the backend's own reason code.
    pub kind: String,
    /// Short human-readable reason.
    pub reason: String,
    /// Longer description, empty when not provided.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Where the failure was raised (component or device name).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub origin: String,
    /// The failure this one wraps, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<Failure>>,
}

impl Failure {
    #[must_use]
    pub fn new(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            reason: reason.into(),
            description: String::new(),
            origin: String::new(),
            cause: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    #[must_use]
    pub fn caused_by(mut self, cause: Failure) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Iterates this failure followed by its chain of causes.
    pub fn chain(&self) -> impl Iterator<Item = &Failure> {
        std::iter::successors(Some(self), |f| f.cause.as_deref())
    }

    /// Number of failures in the chain, including this one.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.chain().count()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// TypeTag
// ---------------------------------------------------------------------------

/// Type descriptor used to select an overload by its exact ordered signature.
///
/// No widening is ever applied: an `Int` argument does not match a `Long`
/// parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeTag {
    Null,
    Bool,
    Short,
    Int,
    Long,
    Float,
    Double,
    String,
    Bytes,
    List,
    Map,
    Failure,
    /// A named record type, e.g. `Object("DeviceData")`.
    Object(String),
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::List => "list",
            Self::Map => "map",
            Self::Failure => "failure",
            Self::Object(class) => return write!(f, "object:{class}"),
        };
        f.write_str(name)
    }
}

/// Formats a signature as `(int, string)` for log and failure messages.
#[must_use]
pub fn format_signature(tags: &[TypeTag]) -> String {
    let parts: Vec<String> = tags.iter().map(ToString::to_string).collect();
    format!("({})", parts.join(", "))
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// Dynamic payload value.
///
/// `Shared` marks a node that may be referenced from more than one position
/// in a single payload graph; the codec preserves that identity across the
/// wire. Equality is structural and looks through `Shared`.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object {
        class: String,
        fields: BTreeMap<String, Value>,
    },
    Failure(Failure),
    Shared(Arc<Value>),
}

impl Value {
    /// Wraps a value so it can be referenced from several places.
    #[must_use]
    pub fn shared(value: Value) -> Self {
        Self::Shared(Arc::new(value))
    }

    /// Looks through any number of `Shared` wrappers.
    #[must_use]
    pub fn resolved(&self) -> &Value {
        let mut current = self;
        while let Self::Shared(inner) = current {
            current = inner;
        }
        current
    }

    /// The descriptor of this value's runtime type.
    #[must_use]
    pub fn type_tag(&self) -> TypeTag {
        match self.resolved() {
            Self::Null => TypeTag::Null,
            Self::Bool(_) => TypeTag::Bool,
            Self::Short(_) => TypeTag::Short,
            Self::Int(_) => TypeTag::Int,
            Self::Long(_) => TypeTag::Long,
            Self::Float(_) => TypeTag::Float,
            Self::Double(_) => TypeTag::Double,
            Self::String(_) => TypeTag::String,
            Self::Bytes(_) => TypeTag::Bytes,
            Self::List(_) => TypeTag::List,
            Self::Map(_) => TypeTag::Map,
            Self::Object { class, .. } => TypeTag::Object(class.clone()),
            Self::Failure(_) => TypeTag::Failure,
            Self::Shared(_) => unreachable!("resolved() never returns Shared"),
        }
    }

    #[must_use]
    pub fn as_failure(&self) -> Option<&Failure> {
        match self.resolved() {
            Self::Failure(f) => Some(f),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self.resolved() {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.as_failure().is_some()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self.resolved(), other.resolved()) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Short(a), Self::Short(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Long(a), Self::Long(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (
                Self::Object {
                    class: ca,
                    fields: fa,
                },
                Self::Object {
                    class: cb,
                    fields: fb,
                },
            ) => ca == cb && fa == fb,
            (Self::Failure(a), Self::Failure(b)) => a == b,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

/// Conversion from a `Value` into a statically typed argument.
///
/// `type_tag()` is the exact descriptor an argument must carry to bind to `Self`.
pub trait FromValue: Sized {
    fn type_tag() -> TypeTag;

    /// Converts the value, handing it back unchanged when the type differs.
    ///
    /// # Errors
    ///
    /// Returns the original value if it does not hold this type.
    fn from_value(value: Value) -> Result<Self, Value>;
}

/// Conversion from a handler's return type into a `Value`.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

/// Unwraps a `Shared` node so the conversion sees the target value.
fn unshare(value: Value) -> Value {
    match value {
        Value::Shared(inner) => unshare(Arc::unwrap_or_clone(inner)),
        other => other,
    }
}

macro_rules! scalar_conversions {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl FromValue for $ty {
                fn type_tag() -> TypeTag {
                    TypeTag::$variant
                }

                fn from_value(value: Value) -> Result<Self, Value> {
                    match unshare(value) {
                        Value::$variant(v) => Ok(v),
                        other => Err(other),
                    }
                }
            }

            impl IntoValue for $ty {
                fn into_value(self) -> Value {
                    Value::$variant(self)
                }
            }

            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

scalar_conversions!(
    bool => Bool,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    String => String,
    Vec<Value> => List,
    BTreeMap<String, Value> => Map,
    Failure => Failure,
);

impl FromValue for ByteBuf {
    fn type_tag() -> TypeTag {
        TypeTag::Bytes
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match unshare(value) {
            Value::Bytes(b) => Ok(ByteBuf::from(b)),
            other => Err(other),
        }
    }
}

impl IntoValue for ByteBuf {
    fn into_value(self) -> Value {
        Value::Bytes(self.into_vec())
    }
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl IntoValue for () {
    fn into_value(self) -> Value {
        Value::Null
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::String(self.to_string())
    }
}

impl IntoValue for Vec<String> {
    fn into_value(self) -> Value {
        Value::List(self.into_iter().map(Value::String).collect())
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        self.map_or(Value::Null, IntoValue::into_value)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
