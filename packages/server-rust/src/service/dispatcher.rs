//! Request dispatch: reserved actions, authentication, method resolution,
//! instance lookup or creation, invocation and telemetry.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use devrelay_core::{actions, format_signature, ObjectId, RequestEnvelope, ResponseEnvelope, TypeTag, Value};
use tokio::task::JoinHandle;
use tower::Service;
use tracing::{debug, warn};

use super::catalog::{ActionCatalog, ActionContext, ActionSpec, InvokeContext};
use super::operation::{Call, RelayError};
use crate::security::SecurityGate;
use crate::session::{Session, SessionStore};
use crate::telemetry::{UsageCounters, UNKNOWN_ACTION};

/// Future returned by the dispatch pipeline.
pub type DispatchFuture = Pin<Box<dyn Future<Output = Result<ResponseEnvelope, RelayError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reserved {
    Remove,
    Authenticate,
    Invalidate,
}

impl Reserved {
    fn classify(action: &str) -> Option<Self> {
        if action.eq_ignore_ascii_case(actions::REMOVE) {
            Some(Self::Remove)
        } else if action.eq_ignore_ascii_case(actions::AUTHENTICATE) {
            Some(Self::Authenticate)
        } else if action.eq_ignore_ascii_case(actions::INVALIDATE) {
            Some(Self::Invalidate)
        } else {
            None
        }
    }
}

/// Aborts the invocation task when the request is dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Innermost dispatch service.
#[derive(Clone)]
pub struct Dispatcher {
    catalog: Arc<ActionCatalog>,
    sessions: Arc<SessionStore>,
    gate: Arc<SecurityGate>,
    telemetry: Arc<UsageCounters>,
    ctx: ActionContext,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("actions", &self.catalog.action_names())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        catalog: Arc<ActionCatalog>,
        sessions: Arc<SessionStore>,
        gate: Arc<SecurityGate>,
        telemetry: Arc<UsageCounters>,
        ctx: ActionContext,
    ) -> Self {
        Self {
            catalog,
            sessions,
            gate,
            telemetry,
            ctx,
        }
    }

    /// Dispatches one request.
    ///
    /// Failures raised by the invoked method are captured in the returned
    /// envelope. Failures before invocation are returned as errors and the
    /// caller wraps them.
    ///
    /// # Errors
    ///
    /// Authentication, resolution and instantiation failures.
    pub async fn dispatch(&self, call: Call) -> Result<ResponseEnvelope, RelayError> {
        let Call { session, request, .. } = call;
        match Reserved::classify(&request.action) {
            Some(Reserved::Remove) => Ok(self.remove(&session, request.object_id)),
            Some(Reserved::Authenticate) => {
                self.gate.authenticate(&session, &request.class_param).await?;
                Ok(ResponseEnvelope::value(Value::Bool(true)))
            }
            Some(Reserved::Invalidate) => {
                let existed = self.sessions.invalidate(session.id());
                Ok(ResponseEnvelope::value(Value::Bool(existed)))
            }
            None => self.invoke(session, request).await,
        }
    }

    /// Removal bypasses authentication; it only ever shrinks the caller's own registry.
    fn remove(&self, session: &Session, object_id: Option<ObjectId>) -> ResponseEnvelope {
        let removed = object_id.and_then(|id| session.registry().remove(id));
        let action = removed
            .as_ref()
            .map_or(actions::REMOVE, |entry| entry.action.name());
        self.telemetry.record_removal(action);
        debug!(session = %session.id(), ?object_id, removed = removed.is_some(), "remove");
        ResponseEnvelope::value(Value::Bool(removed.is_some()))
    }

    async fn invoke(&self, session: Arc<Session>, request: RequestEnvelope) -> Result<ResponseEnvelope, RelayError> {
        let known = self.catalog.get(&request.action);
        self.telemetry
            .record_access(known.as_deref().map_or(UNKNOWN_ACTION, ActionSpec::name));
        self.gate.require_authenticated(&session)?;

        let RequestEnvelope {
            action,
            method,
            object_id,
            class_param,
            method_param,
            method_param_types,
        } = request;

        let existing = match object_id {
            Some(id) => {
                let entry = session.registry().get(id)?;
                if entry.action.name() != action {
                    return Err(RelayError::UnknownObject { object_id: id });
                }
                Some(entry)
            }
            None => None,
        };
        let spec = match &existing {
            Some(entry) => Arc::clone(&entry.action),
            None => known.ok_or_else(|| RelayError::Instantiation {
                action: action.clone(),
                signature: String::new(),
                reason: "unknown action".to_string(),
                cause: None,
            })?,
        };

        // Resolve before creating so a bad method never leaves an orphan instance.
        let handler = spec.resolve(&method, &method_param_types)?;
        if let Some(mismatch) = argument_mismatch(&method_param, &method_param_types) {
            return Err(RelayError::MethodNotFound {
                action,
                method,
                signature: format!("{} ({mismatch})", format_signature(&method_param_types)),
            });
        }

        let (instance, target, created) = match (existing, object_id) {
            (Some(entry), Some(id)) => (entry.instance, id, false),
            _ => {
                let (id, entry) = session.registry().create(&spec, &self.ctx, class_param)?;
                debug!(session = %session.id(), action = spec.name(), object_id = %id, "instance created");
                (entry.instance, id, true)
            }
        };

        let invocation = tokio::spawn(handler(
            instance,
            method_param,
            InvokeContext {
                session: Arc::clone(&session),
                object_id: target,
                method: method.clone(),
            },
        ));
        let outcome = match AbortOnDrop(invocation).await_join().await {
            Ok(result) => result,
            Err(join_err) => {
                warn!(action = spec.name(), method = %method, error = %join_err, "method panicked");
                Err(RelayError::Internal(format!("{}.{method} panicked", spec.name())))
            }
        };

        self.telemetry
            .record_invocation(spec.name(), &method, &session.key(), created);

        match outcome {
            Ok(value) if created => Ok(ResponseEnvelope::value(value).with_object_id(target)),
            Ok(value) => Ok(ResponseEnvelope::value(value)),
            Err(err) => {
                debug!(action = spec.name(), method = %method, kind = err.kind(), "method failed");
                if created {
                    // The handle was never returned, so the instance goes with it.
                    session.registry().discard(target);
                }
                Ok(ResponseEnvelope::failure(err.into_failure()))
            }
        }
    }
}

/// Describes the first value whose tag differs from its declared descriptor.
fn argument_mismatch(values: &[Value], declared: &[TypeTag]) -> Option<String> {
    if values.len() != declared.len() {
        return Some(format!(
            "{} values for {} declared types",
            values.len(),
            declared.len()
        ));
    }
    values
        .iter()
        .zip(declared)
        .position(|(value, tag)| value.type_tag() != *tag)
        .map(|index| format!("argument {index} is {}", values[index].type_tag()))
}

impl<T> AbortOnDrop<T> {
    async fn await_join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }
}

impl Service<Call> for Dispatcher {
    type Response = ResponseEnvelope;
    type Error = RelayError;
    type Future = DispatchFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: Call) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.dispatch(call).await })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use super::*;
    use crate::backend::MemoryBackend;
    use crate::delegates::default_catalog;
    use crate::security::IdentityResolvers;
    use crate::service::config::RelayConfig;

    const DEVICE: &str = "sys/tg_test/1";

    struct Fixture {
        dispatcher: Dispatcher,
        sessions: Arc<SessionStore>,
        telemetry: Arc<UsageCounters>,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(RelayConfig::default());
        let sessions = Arc::new(SessionStore::new(Arc::clone(&config), CancellationToken::new()));
        let telemetry = Arc::new(UsageCounters::new());
        let gate = Arc::new(SecurityGate::new(&config, &IdentityResolvers::builtin()).unwrap());
        let ctx = ActionContext {
            config,
            backend: Arc::new(MemoryBackend::new("memory://test")),
        };
        let dispatcher = Dispatcher::new(
            Arc::new(default_catalog().unwrap()),
            Arc::clone(&sessions),
            gate,
            Arc::clone(&telemetry),
            ctx,
        );
        Fixture {
            dispatcher,
            sessions,
            telemetry,
        }
    }

    async fn send(fx: &Fixture, session: &Arc<Session>, request: RequestEnvelope) -> ResponseEnvelope {
        let call = Call::new(1, Arc::clone(session), request);
        match fx.dispatcher.clone().oneshot(call).await {
            Ok(response) => response,
            Err(err) => ResponseEnvelope::failure(err.into_failure()),
        }
    }

    async fn login(fx: &Fixture) -> Arc<Session> {
        let session = fx.sessions.create();
        let response = send(fx, &session, RequestEnvelope::authenticate("op", "op")).await;
        assert_eq!(response.primary(), Some(&Value::Bool(true)));
        session
    }

    fn kind(response: &ResponseEnvelope) -> &str {
        response.failure_payload().map_or("", |f| f.kind.as_str())
    }

    #[tokio::test]
    async fn unauthenticated_request_never_touches_registry() {
        let fx = fixture();
        let session = fx.sessions.create();
        let request = RequestEnvelope::create("DeviceProxy", vec![Value::from(DEVICE)], "state");

        let response = send(&fx, &session, request).await;
        assert_eq!(kind(&response), "NotAuthenticatedError");
        assert!(session.registry().is_empty());
        assert_eq!(fx.telemetry.access_count("DeviceProxy"), 1);
    }

    #[tokio::test]
    async fn reserved_actions_match_case_insensitively() {
        let fx = fixture();
        let session = fx.sessions.create();
        let mut request = RequestEnvelope::authenticate("op", "op");
        request.action = "security.AUTHENTICATE".to_string();
        send(&fx, &session, request).await;
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn creating_call_surfaces_object_id_for_reuse() {
        let fx = fixture();
        let session = login(&fx).await;

        let created = send(
            &fx,
            &session,
            RequestEnvelope::create("DeviceProxy", vec![Value::from(DEVICE)], "state"),
        )
        .await;
        assert_eq!(created.primary(), Some(&Value::from("ON")));
        let id = created.object_id.unwrap();
        assert_eq!(id, ObjectId(1));

        let reused = send(&fx, &session, RequestEnvelope::on_object("DeviceProxy", id, "name")).await;
        assert_eq!(reused.primary(), Some(&Value::from(DEVICE)));
        assert_eq!(reused.object_id, None);
        assert_eq!(session.registry().len(), 1);

        assert_eq!(fx.telemetry.creation_count("DeviceProxy"), 1);
        assert_eq!(fx.telemetry.use_count("DeviceProxy"), 2);
        assert_eq!(fx.telemetry.method_count("DeviceProxy", "name"), 1);
        assert_eq!(fx.telemetry.session_use_count("DeviceProxy", &session.key()), 2);
    }

    #[tokio::test]
    async fn unknown_method_creates_no_instance() {
        let fx = fixture();
        let session = login(&fx).await;
        let request = RequestEnvelope::create("DeviceProxy", vec![Value::from(DEVICE)], "command_inout")
            .arg(Value::Int(3));

        let response = send(&fx, &session, request).await;
        assert_eq!(kind(&response), "MethodNotFoundError");
        assert!(session.registry().is_empty());
    }

    #[tokio::test]
    async fn declared_types_must_match_values() {
        let fx = fixture();
        let session = login(&fx).await;
        let mut request = RequestEnvelope::create("DeviceProxy", vec![Value::from(DEVICE)], "command_inout")
            .arg("Echo");
        request.method_param = vec![Value::Int(1)];

        let response = send(&fx, &session, request).await;
        assert_eq!(kind(&response), "MethodNotFoundError");
    }

    #[tokio::test]
    async fn unknown_action_is_instantiation_error() {
        let fx = fixture();
        let session = login(&fx).await;
        let response = send(&fx, &session, RequestEnvelope::create("Nope", vec![], "x")).await;
        assert_eq!(kind(&response), "InstantiationError");
    }

    #[tokio::test]
    async fn handle_used_with_other_action_is_unknown() {
        let fx = fixture();
        let session = login(&fx).await;
        let created = send(
            &fx,
            &session,
            RequestEnvelope::create("DeviceProxy", vec![Value::from(DEVICE)], "name"),
        )
        .await;
        let id = created.object_id.unwrap();

        let response = send(&fx, &session, RequestEnvelope::on_object("AttributeProxy", id, "read")).await;
        assert_eq!(kind(&response), "UnknownObjectError");
    }

    #[tokio::test]
    async fn failed_creating_call_leaves_no_instance() {
        let fx = fixture();
        let session = login(&fx).await;
        let request = RequestEnvelope::create("DeviceProxy", vec![Value::from(DEVICE)], "command_inout")
            .arg("Fail");

        let response = send(&fx, &session, request).await;
        let failure = response.failure_payload().unwrap();
        assert_eq!(failure.kind, "API_CommandFailed");
        assert_eq!(failure.depth(), 2);
        assert_eq!(response.object_id, None);
        assert!(session.registry().is_empty());
        assert_eq!(session.registry().removal_count(), 0);

        // The discarded handle is not reissued.
        let next = send(
            &fx,
            &session,
            RequestEnvelope::create("DeviceProxy", vec![Value::from(DEVICE)], "name"),
        )
        .await;
        assert_eq!(next.object_id, Some(ObjectId(2)));
    }

    #[tokio::test]
    async fn failure_on_existing_object_keeps_it() {
        let fx = fixture();
        let session = login(&fx).await;
        let created = send(
            &fx,
            &session,
            RequestEnvelope::create("DeviceProxy", vec![Value::from(DEVICE)], "name"),
        )
        .await;
        let id = created.object_id.unwrap();

        let failed = send(
            &fx,
            &session,
            RequestEnvelope::on_object("DeviceProxy", id, "command_inout").arg("Fail"),
        )
        .await;
        assert_eq!(kind(&failed), "API_CommandFailed");
        assert_eq!(failed.object_id, None);
        assert_eq!(session.registry().len(), 1);
    }

    #[tokio::test]
    async fn unknown_actions_share_one_access_key() {
        let fx = fixture();
        let session = fx.sessions.create();
        for action in ["Nope", "AlsoNope", "devicEproxy"] {
            send(&fx, &session, RequestEnvelope::create(action, vec![], "x")).await;
        }

        assert_eq!(fx.telemetry.access_count(UNKNOWN_ACTION), 3);
        assert_eq!(fx.telemetry.access_count("Nope"), 0);
        let keys: Vec<String> = fx
            .telemetry
            .snapshot()
            .access
            .into_keys()
            .collect();
        assert_eq!(keys, vec![UNKNOWN_ACTION.to_string()]);
    }

    #[tokio::test]
    async fn concurrent_creates_mint_distinct_handles() {
        let fx = Arc::new(fixture());
        let session = login(&fx).await;

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let fx = Arc::clone(&fx);
            let session = Arc::clone(&session);
            tasks.push(tokio::spawn(async move {
                let request = RequestEnvelope::create("DeviceProxy", vec![Value::from(DEVICE)], "name");
                send(&fx, &session, request).await.object_id.unwrap()
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 32);
        assert_eq!(session.registry().len(), 32);
        assert_eq!(fx.telemetry.creation_count("DeviceProxy"), 32);
    }

    #[tokio::test]
    async fn remove_bypasses_gate_and_counts() {
        let fx = fixture();
        let session = login(&fx).await;
        let created = send(
            &fx,
            &session,
            RequestEnvelope::create("DeviceProxy", vec![Value::from(DEVICE)], "name"),
        )
        .await;
        let id = created.object_id.unwrap();

        let removed = send(&fx, &session, RequestEnvelope::remove(id)).await;
        assert_eq!(removed.primary(), Some(&Value::Bool(true)));
        assert_eq!(fx.telemetry.removal_count("DeviceProxy"), 1);

        let gone = send(&fx, &session, RequestEnvelope::on_object("DeviceProxy", id, "name")).await;
        assert_eq!(kind(&gone), "UnknownObjectError");

        let stranger = fx.sessions.create();
        let noop = send(&fx, &stranger, RequestEnvelope::remove(id)).await;
        assert_eq!(noop.primary(), Some(&Value::Bool(false)));
        assert_eq!(stranger.registry().removal_count(), 1);
    }

    #[tokio::test]
    async fn invalidate_tears_session_down() {
        let fx = fixture();
        let session = login(&fx).await;
        let mut request = RequestEnvelope::default();
        request.action = actions::INVALIDATE.to_string();

        let response = send(&fx, &session, request).await;
        assert_eq!(response.primary(), Some(&Value::Bool(true)));
        assert!(session.is_closed());
        assert!(fx.sessions.get(session.id()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn asynchronous_call_round_trip_through_dispatch() {
        let fx = fixture();
        let session = login(&fx).await;
        let created = send(
            &fx,
            &session,
            RequestEnvelope::create("DeviceProxy", vec![Value::from(DEVICE)], "command_inout_asynch")
                .arg("Sleep")
                .arg(500.0_f64),
        )
        .await;
        let id = created.object_id.unwrap();
        let handle = created.primary().cloned().unwrap();

        let timed_out = send(
            &fx,
            &session,
            RequestEnvelope::on_object("DeviceProxy", id, "command_inout_asynch_reply")
                .arg(handle.clone())
                .arg(Value::Int(100)),
        )
        .await;
        assert_eq!(kind(&timed_out), "ReplyNotArrivedError");

        let reply = send(
            &fx,
            &session,
            RequestEnvelope::on_object("DeviceProxy", id, "command_inout_asynch_reply")
                .arg(handle.clone())
                .arg(Value::Int(0)),
        )
        .await;
        assert_eq!(reply.primary(), Some(&Value::Null));

        let consumed = send(
            &fx,
            &session,
            RequestEnvelope::on_object("DeviceProxy", id, "command_inout_asynch_reply").arg(handle),
        )
        .await;
        assert_eq!(kind(&consumed), "HandleConsumedError");
    }
}
