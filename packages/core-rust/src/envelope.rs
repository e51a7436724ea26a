//! Request and response envelopes exchanged over `POST /relay`.

use crate::value::{Failure, ObjectId, TypeTag, Value};

/// Reserved action names. Matching is case-insensitive.
pub mod actions {
    /// Removes the instance named by `objectID` from the session registry.
    pub const REMOVE: &str = "Storage.remove";
    /// Authenticates the session; `classParam = [login, password]`.
    pub const AUTHENTICATE: &str = "Security.authenticate";
    /// Tears the session down (explicit logout).
    pub const INVALIDATE: &str = "Session.invalidate";
}

/// A generic "call this method with these arguments" request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestEnvelope {
    /// Logical resource or operation family (e.g. `"DeviceProxy"`).
    pub action: String,
    pub method: String,
    /// Handle of an existing instance; `None` asks for a new instance.
    pub object_id: Option<ObjectId>,
    /// Constructor arguments used when `object_id` is `None`.
    pub class_param: Vec<Value>,
    pub method_param: Vec<Value>,
    /// Type descriptors, positionally parallel to `method_param`.
    pub method_param_types: Vec<TypeTag>,
}

impl RequestEnvelope {
    /// A request that creates a new instance of `action` and calls `method` on it.
    #[must_use]
    pub fn create(action: impl Into<String>, class_param: Vec<Value>, method: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            method: method.into(),
            class_param,
            ..Self::default()
        }
    }

    /// A request that calls `method` on the existing instance `object_id`.
    #[must_use]
    pub fn on_object(action: impl Into<String>, object_id: ObjectId, method: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            method: method.into(),
            object_id: Some(object_id),
            ..Self::default()
        }
    }

    /// Appends an argument, deriving its type descriptor from the value.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.method_param_types.push(value.type_tag());
        self.method_param.push(value);
        self
    }

    /// The authentication request for the given credentials.
    #[must_use]
    pub fn authenticate(login: &str, password: &str) -> Self {
        Self::create(
            actions::AUTHENTICATE,
            vec![Value::from(login), Value::from(password)],
            "authenticate",
        )
    }

    /// The removal request for an instance handle.
    #[must_use]
    pub fn remove(object_id: ObjectId) -> Self {
        Self::on_object(actions::REMOVE, object_id, "remove")
    }
}

/// The generic result of a dispatched request.
///
/// `result[0]` is the return value or a captured [`Failure`]; later elements
/// are reserved for diagnostic payloads.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResponseEnvelope {
    pub result: Vec<Value>,
    /// Handle minted by a successful creating call.
    pub object_id: Option<ObjectId>,
}

impl ResponseEnvelope {
    #[must_use]
    pub fn value(value: Value) -> Self {
        Self {
            result: vec![value],
            object_id: None,
        }
    }

    #[must_use]
    pub fn failure(failure: Failure) -> Self {
        Self::value(Value::Failure(failure))
    }

    #[must_use]
    pub fn with_object_id(mut self, id: ObjectId) -> Self {
        self.object_id = Some(id);
        self
    }

    /// The primary element of the result sequence.
    #[must_use]
    pub fn primary(&self) -> Option<&Value> {
        self.result.first()
    }

    /// The captured failure, if the primary element is one.
    #[must_use]
    pub fn failure_payload(&self) -> Option<&Failure> {
        self.primary().and_then(Value::as_failure)
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.failure_payload().is_some()
    }
}
