//! Dispatch unit and dispatch-level error taxonomy.

use std::sync::Arc;

use devrelay_core::{CallId, Failure, ObjectId, RequestEnvelope};

use crate::session::Session;

/// One inbound request bound to the session it arrived on.
#[derive(Debug, Clone)]
pub struct Call {
    /// Process-unique id for tracing.
    pub call_id: u64,
    pub session: Arc<Session>,
    pub request: RequestEnvelope,
}

impl Call {
    #[must_use]
    pub fn new(call_id: u64, session: Arc<Session>, request: RequestEnvelope) -> Self {
        Self {
            call_id,
            session,
            request,
        }
    }
}

/// Message reported for every authentication failure, whatever the cause.
pub const AUTHENTICATION_FAILED: &str = "authentication failed";
/// Message reported when a non-authentication action reaches an unauthenticated session.
pub const SESSION_NOT_AUTHENTICATED: &str = "session is not authenticated";

/// Dispatch-level failures.
///
/// None of these ever escapes to the transport: every variant is converted
/// into a [`Failure`] and returned inside a well-formed response envelope.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("cannot instantiate {action}{signature}: {reason}")]
    Instantiation {
        action: String,
        signature: String,
        reason: String,
        cause: Option<Failure>,
    },
    #[error("unknown object {object_id}")]
    UnknownObject { object_id: ObjectId },
    #[error("no method {action}.{method}{signature}")]
    MethodNotFound {
        action: String,
        method: String,
        signature: String,
    },
    #[error("{reason}")]
    NotAuthenticated { reason: &'static str },
    #[error("reply for {call_id} has not arrived after {waited_ms}ms")]
    ReplyNotArrived { call_id: CallId, waited_ms: u64 },
    #[error("reply for {call_id} was already retrieved")]
    HandleConsumed { call_id: CallId },
    #[error("no asynchronous call {call_id} was issued in this session")]
    UnknownHandle { call_id: CallId },
    #[error("another request is already awaiting {call_id}")]
    AwaitInProgress { call_id: CallId },
    #[error("wait for {call_id} was cancelled")]
    Cancelled { call_id: CallId },
    #[error("server overloaded, try again later")]
    Overloaded,
    /// Failure raised by a delegate or the device backend, passed through unchanged.
    #[error("{0}")]
    Delegate(Failure),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Taxonomy name carried in `Failure::kind`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Instantiation { .. } => "InstantiationError",
            Self::UnknownObject { .. } => "UnknownObjectError",
            Self::MethodNotFound { .. } => "MethodNotFoundError",
            Self::NotAuthenticated { .. } => "NotAuthenticatedError",
            Self::ReplyNotArrived { .. } => "ReplyNotArrivedError",
            Self::HandleConsumed { .. } => "HandleConsumedError",
            Self::UnknownHandle { .. } => "UnknownHandleError",
            Self::AwaitInProgress { .. } => "AwaitInProgressError",
            Self::Cancelled { .. } => "CancelledError",
            Self::Overloaded => "OverloadedError",
            Self::Delegate(_) => "DelegateFailure",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Converts into the failure payload sent to the client.
    #[must_use]
    pub fn into_failure(self) -> Failure {
        let kind = self.kind();
        match self {
            Self::Delegate(failure) => failure,
            Self::Instantiation {
                action,
                signature,
                reason,
                cause,
            } => {
                let failure = Failure::new(
                    kind,
                    format!("cannot instantiate {action}{signature}: {reason}"),
                )
                .with_origin(action);
                match cause {
                    Some(cause) => failure.caused_by(cause),
                    None => failure,
                }
            }
            other => Failure::new(kind, other.to_string()).with_origin("relay"),
        }
    }
}
