//! Static action catalog: constructor and method tables per action.
//!
//! Every action is described once at startup by an [`ActionBuilder`], which
//! records typed closures under their exact parameter signature. At dispatch
//! time a method is resolved by `(name, parameter types)` with exact tag
//! equality; there is no widening and no runtime reflection.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use devrelay_core::{
    actions, format_signature, CallId, Failure, FromValue, IntoValue, ObjectId, TypeTag, Value,
};

use super::async_call::{CallOwner, ReplyPoll};
use super::config::RelayConfig;
use super::operation::RelayError;
use crate::backend::DeviceBackend;
use crate::session::Session;

/// A live delegate instance held by a session registry.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Future returned by a resolved method handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, RelayError>> + Send>>;

/// A resolved method, ready to run against an instance.
pub type Handler = Arc<dyn Fn(Instance, Vec<Value>, InvokeContext) -> HandlerFuture + Send + Sync>;

type Constructor = Box<dyn Fn(&ActionContext, Vec<Value>) -> Result<Instance, Failure> + Send + Sync>;

/// Suffix of the reply methods generated for every asynchronous method.
pub const REPLY_SUFFIX: &str = "_reply";

// ---------------------------------------------------------------------------
// Contexts
// ---------------------------------------------------------------------------

/// Shared resources available to constructors.
#[derive(Clone)]
pub struct ActionContext {
    pub config: Arc<RelayConfig>,
    pub backend: Arc<dyn DeviceBackend>,
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("backend", &self.backend.endpoint())
            .finish_non_exhaustive()
    }
}

/// Per-invocation context handed to method handlers.
#[derive(Debug, Clone)]
pub struct InvokeContext {
    pub session: Arc<Session>,
    /// Registry handle of the instance the method runs on.
    pub object_id: ObjectId,
    pub method: String,
}

impl InvokeContext {
    fn owner(&self) -> CallOwner {
        CallOwner::new(self.object_id, self.method.clone())
    }
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// A tuple of parameter types with a fixed descriptor sequence.
pub trait Signature: Sized + Send + 'static {
    fn type_tags() -> Vec<TypeTag>;

    /// Converts positional values into the typed tuple.
    ///
    /// # Errors
    ///
    /// Returns a description of the first mismatching position.
    fn extract(values: Vec<Value>) -> Result<Self, String>;
}

macro_rules! tuple_signature {
    ($($ty:ident $var:ident),*) => {
        impl<$($ty: FromValue + Send + 'static),*> Signature for ($($ty,)*) {
            fn type_tags() -> Vec<TypeTag> {
                vec![$($ty::type_tag()),*]
            }

            #[allow(unused_mut, unused_variables)]
            fn extract(values: Vec<Value>) -> Result<Self, String> {
                let expected = Self::type_tags();
                if values.len() != expected.len() {
                    return Err(format!(
                        "expected {} arguments, got {}",
                        expected.len(),
                        values.len()
                    ));
                }
                let mut values = values.into_iter().enumerate();
                $(
                    let (index, value) = values
                        .next()
                        .ok_or_else(|| "argument list ended early".to_string())?;
                    let $var = $ty::from_value(value).map_err(|found| {
                        format!(
                            "argument {index} expected {}, got {}",
                            $ty::type_tag(),
                            found.type_tag()
                        )
                    })?;
                )*
                Ok(($($var,)*))
            }
        }
    };
}

tuple_signature!();
tuple_signature!(A a);
tuple_signature!(A a, B b);
tuple_signature!(A a, B b, C c);
tuple_signature!(A a, B b, C c, D d);

// ---------------------------------------------------------------------------
// ActionSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MethodKey {
    name: String,
    signature: Vec<TypeTag>,
}

/// Constructor and method tables of one action.
pub struct ActionSpec {
    name: String,
    constructors: Vec<(Vec<TypeTag>, Constructor)>,
    methods: HashMap<MethodKey, Handler>,
}

impl fmt::Debug for ActionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionSpec")
            .field("name", &self.name)
            .field("constructors", &self.constructors.len())
            .field("methods", &self.methods.len())
            .finish()
    }
}

impl ActionSpec {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates an instance from constructor arguments, matched by exact types.
    ///
    /// # Errors
    ///
    /// `Instantiation` when no constructor matches or the constructor fails.
    pub fn instantiate(&self, ctx: &ActionContext, class_param: Vec<Value>) -> Result<Instance, RelayError> {
        let tags: Vec<TypeTag> = class_param.iter().map(Value::type_tag).collect();
        let signature = format_signature(&tags);
        let Some((_, constructor)) = self.constructors.iter().find(|(sig, _)| *sig == tags) else {
            return Err(RelayError::Instantiation {
                action: self.name.clone(),
                signature,
                reason: "no constructor accepts these arguments".to_string(),
                cause: None,
            });
        };
        constructor(ctx, class_param).map_err(|cause| RelayError::Instantiation {
            action: self.name.clone(),
            signature,
            reason: cause.reason.clone(),
            cause: Some(cause),
        })
    }

    /// Finds the handler registered under `method` with exactly `types`.
    ///
    /// # Errors
    ///
    /// `MethodNotFound` when there is no such overload.
    pub fn resolve(&self, method: &str, types: &[TypeTag]) -> Result<Handler, RelayError> {
        let key = MethodKey {
            name: method.to_string(),
            signature: types.to_vec(),
        };
        self.methods
            .get(&key)
            .cloned()
            .ok_or_else(|| RelayError::MethodNotFound {
                action: self.name.clone(),
                method: method.to_string(),
                signature: format_signature(types),
            })
    }

    /// Every registered method as `name(signature)`, sorted.
    #[must_use]
    pub fn method_signatures(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .methods
            .keys()
            .map(|k| format!("{}{}", k.name, format_signature(&k.signature)))
            .collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// ActionBuilder
// ---------------------------------------------------------------------------

/// Typed description of an action whose instances are `D`.
pub struct ActionBuilder<D> {
    spec: ActionSpec,
    conflicts: Vec<String>,
    _delegate: PhantomData<fn() -> D>,
}

impl<D: Send + Sync + 'static> ActionBuilder<D> {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            spec: ActionSpec {
                name: name.into(),
                constructors: Vec::new(),
                methods: HashMap::new(),
            },
            conflicts: Vec::new(),
            _delegate: PhantomData,
        }
    }

    /// Adds a constructor overload.
    #[must_use]
    pub fn constructor<A, F>(mut self, f: F) -> Self
    where
        A: Signature,
        F: Fn(&ActionContext, A) -> Result<D, Failure> + Send + Sync + 'static,
    {
        let tags = A::type_tags();
        if self.spec.constructors.iter().any(|(sig, _)| *sig == tags) {
            self.conflicts
                .push(format!("constructor{}", format_signature(&tags)));
            return self;
        }
        let constructor: Constructor = Box::new(move |ctx, values| {
            let args = A::extract(values).map_err(|reason| Failure::new("InvalidArgument", reason))?;
            let delegate = f(ctx, args)?;
            Ok(Arc::new(delegate) as Instance)
        });
        self.spec.constructors.push((tags, constructor));
        self
    }

    /// Adds a method overload whose result is returned directly.
    #[must_use]
    pub fn method<A, R, F, Fut>(self, name: &str, f: F) -> Self
    where
        A: Signature,
        R: IntoValue + 'static,
        F: Fn(Arc<D>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Failure>> + Send + 'static,
    {
        let handler: Handler = Arc::new(
            move |instance: Instance, values: Vec<Value>, _ctx: InvokeContext| -> HandlerFuture {
                match bind::<D, A>(instance, values) {
                    Ok((delegate, args)) => {
                        let fut = f(delegate, args);
                        Box::pin(async move {
                            fut.await
                                .map(IntoValue::into_value)
                                .map_err(RelayError::Delegate)
                        })
                    }
                    Err(err) => Box::pin(async move { Err(err) }),
                }
            },
        );
        self.insert(name, A::type_tags(), handler)
    }

    /// Adds an asynchronous method overload.
    ///
    /// Calling `name` returns a call handle (`long`) at once while the work
    /// runs in the background. The first asynchronous overload of `name`
    /// also registers `name_reply(long)` for a non-blocking poll and
    /// `name_reply(long, int)` for a wait bounded by a timeout in
    /// milliseconds, where 0 waits indefinitely. A handle is only honoured
    /// by the reply methods of the instance and method that issued it.
    #[must_use]
    pub fn asynchronous<A, R, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        A: Signature,
        R: IntoValue + 'static,
        F: Fn(Arc<D>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Failure>> + Send + 'static,
    {
        let issue: Handler = Arc::new(
            move |instance: Instance, values: Vec<Value>, ctx: InvokeContext| -> HandlerFuture {
                match bind::<D, A>(instance, values) {
                    Ok((delegate, args)) => {
                        let fut = f(delegate, args);
                        let id = ctx.session.calls().issue(
                            ctx.owner(),
                            Box::pin(async move { fut.await.map(IntoValue::into_value) }),
                        );
                        Box::pin(async move { Ok(call_handle(id)) })
                    }
                    Err(err) => Box::pin(async move { Err(err) }),
                }
            },
        );
        self = self.insert(name, A::type_tags(), issue);

        let reply = format!("{name}{REPLY_SUFFIX}");
        let poll_key = MethodKey {
            name: reply.clone(),
            signature: vec![TypeTag::Long],
        };
        if !self.spec.methods.contains_key(&poll_key) {
            let issuer = name.to_string();
            let poll: Handler = Arc::new(
                move |_instance: Instance, values: Vec<Value>, ctx: InvokeContext| -> HandlerFuture {
                    poll_reply(&issuer, values, &ctx)
                },
            );
            let issuer = name.to_string();
            let wait: Handler = Arc::new(
                move |_instance: Instance, values: Vec<Value>, ctx: InvokeContext| -> HandlerFuture {
                    await_reply(&issuer, values, ctx)
                },
            );
            self.spec.methods.insert(poll_key, poll);
            self.spec.methods.insert(
                MethodKey {
                    name: reply,
                    signature: vec![TypeTag::Long, TypeTag::Int],
                },
                wait,
            );
        }
        self
    }

    fn insert(mut self, name: &str, signature: Vec<TypeTag>, handler: Handler) -> Self {
        let key = MethodKey {
            name: name.to_string(),
            signature,
        };
        if self.spec.methods.contains_key(&key) {
            self.conflicts
                .push(format!("{name}{}", format_signature(&key.signature)));
            return self;
        }
        self.spec.methods.insert(key, handler);
        self
    }
}

fn bind<D, A>(instance: Instance, values: Vec<Value>) -> Result<(Arc<D>, A), RelayError>
where
    D: Send + Sync + 'static,
    A: Signature,
{
    let delegate = instance
        .downcast::<D>()
        .map_err(|_| RelayError::Internal("instance does not match its action".to_string()))?;
    let args = A::extract(values).map_err(RelayError::Internal)?;
    Ok((delegate, args))
}

#[allow(clippy::cast_possible_wrap)]
fn call_handle(id: CallId) -> Value {
    Value::Long(id.0 as i64)
}

fn call_id(handle: i64) -> CallId {
    // Negative handles were never issued; 0 is never issued either.
    CallId(u64::try_from(handle).unwrap_or(0))
}

/// `issuer` is the asynchronous method whose replies this handler serves.
fn poll_reply(issuer: &str, values: Vec<Value>, ctx: &InvokeContext) -> HandlerFuture {
    let owner = CallOwner::new(ctx.object_id, issuer);
    let result = <(i64,)>::extract(values)
        .map_err(RelayError::Internal)
        .and_then(|(handle,)| {
            let id = call_id(handle);
            match ctx.session.calls().poll(id, &owner)? {
                ReplyPoll::Ready(Ok(value)) => Ok(value),
                ReplyPoll::Ready(Err(failure)) => Err(RelayError::Delegate(failure)),
                ReplyPoll::NotReady => Err(RelayError::ReplyNotArrived {
                    call_id: id,
                    waited_ms: 0,
                }),
            }
        });
    Box::pin(async move { result })
}

fn await_reply(issuer: &str, values: Vec<Value>, ctx: InvokeContext) -> HandlerFuture {
    let owner = CallOwner::new(ctx.object_id, issuer);
    Box::pin(async move {
        let (handle, timeout_ms) = <(i64, i32)>::extract(values).map_err(RelayError::Internal)?;
        let timeout = match u64::try_from(timeout_ms) {
            Ok(0) => None,
            Ok(ms) => Some(Duration::from_millis(ms)),
            // Negative timeouts poll once and report.
            Err(_) => Some(Duration::ZERO),
        };
        let session = ctx.session;
        session
            .calls()
            .await_reply(call_id(handle), &owner, timeout, session.cancel_token())
            .await
    })
}

// ---------------------------------------------------------------------------
// ActionCatalog
// ---------------------------------------------------------------------------

/// All actions known to the relay, keyed by exact action name.
#[derive(Debug, Default)]
pub struct ActionCatalog {
    actions: HashMap<String, Arc<ActionSpec>>,
}

impl ActionCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an action.
    ///
    /// # Errors
    ///
    /// Fails on duplicate overloads within the action, on an action name
    /// registered twice, and on reserved action names.
    pub fn register<D: Send + Sync + 'static>(&mut self, builder: ActionBuilder<D>) -> anyhow::Result<()> {
        let ActionBuilder { spec, conflicts, .. } = builder;
        if !conflicts.is_empty() {
            anyhow::bail!(
                "action {} declares duplicate signatures: {}",
                spec.name,
                conflicts.join(", ")
            );
        }
        if is_reserved(&spec.name) {
            anyhow::bail!("action name {} is reserved", spec.name);
        }
        if self.actions.contains_key(&spec.name) {
            anyhow::bail!("action {} is already registered", spec.name);
        }
        self.actions.insert(spec.name.clone(), Arc::new(spec));
        Ok(())
    }

    #[must_use]
    pub fn get(&self, action: &str) -> Option<Arc<ActionSpec>> {
        self.actions.get(action).cloned()
    }

    /// Registered action names, sorted.
    #[must_use]
    pub fn action_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Whether `name` is one of the reserved actions, compared case-insensitively.
pub(crate) fn is_reserved(name: &str) -> bool {
    [actions::REMOVE, actions::AUTHENTICATE, actions::INVALIDATE]
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    struct Counter {
        start: i64,
    }

    fn counter_action() -> ActionBuilder<Counter> {
        ActionBuilder::new("Counter")
            .constructor(|_ctx: &ActionContext, (start,): (i64,)| Ok(Counter { start }))
            .constructor(|_ctx: &ActionContext, (): ()| Ok(Counter { start: 0 }))
            .method("start", |c: Arc<Counter>, (): ()| async move { Ok::<_, Failure>(c.start) })
            .method("add", |c: Arc<Counter>, (n,): (i64,)| async move {
                Ok::<_, Failure>(c.start + n)
            })
            .method("add", |_c: Arc<Counter>, (n,): (f64,)| async move { Ok::<_, Failure>(n) })
    }

    fn ctx() -> ActionContext {
        ActionContext {
            config: Arc::new(RelayConfig::default()),
            backend: Arc::new(MemoryBackend::new("memory://test")),
        }
    }

    fn invoke_ctx(session: &Arc<crate::session::Session>, object: u64, method: &str) -> InvokeContext {
        InvokeContext {
            session: Arc::clone(session),
            object_id: ObjectId(object),
            method: method.to_string(),
        }
    }

    #[test]
    fn signature_tags_follow_tuple_order() {
        assert_eq!(
            <(String, f64)>::type_tags(),
            vec![TypeTag::String, TypeTag::Double]
        );
        assert!(<()>::type_tags().is_empty());
    }

    #[test]
    fn signature_extract_rejects_wrong_type() {
        let err = <(String,)>::extract(vec![Value::Int(1)]).unwrap_err();
        assert!(err.contains("argument 0"));
    }

    #[test]
    fn overloads_resolve_by_exact_types() {
        let mut catalog = ActionCatalog::new();
        catalog.register(counter_action()).unwrap();
        let spec = catalog.get("Counter").unwrap();

        assert!(spec.resolve("add", &[TypeTag::Long]).is_ok());
        assert!(spec.resolve("add", &[TypeTag::Double]).is_ok());
        // No widening from int to long.
        let err = spec.resolve("add", &[TypeTag::Int]).err().unwrap();
        assert!(matches!(err, RelayError::MethodNotFound { .. }));
        assert_eq!(err.to_string(), "no method Counter.add(int)");
    }

    #[tokio::test]
    async fn constructor_then_method_runs_handler() {
        let mut catalog = ActionCatalog::new();
        catalog.register(counter_action()).unwrap();
        let spec = catalog.get("Counter").unwrap();

        let instance = spec.instantiate(&ctx(), vec![Value::Long(40)]).unwrap();
        let handler = spec.resolve("add", &[TypeTag::Long]).unwrap();
        let session = Arc::new(crate::session::Session::detached());
        let value = handler(instance, vec![Value::Long(2)], invoke_ctx(&session, 1, "add"))
            .await
            .unwrap();
        assert_eq!(value, Value::Long(42));
    }

    #[test]
    fn missing_constructor_is_instantiation_error() {
        let mut catalog = ActionCatalog::new();
        catalog.register(counter_action()).unwrap();
        let spec = catalog.get("Counter").unwrap();
        let err = spec.instantiate(&ctx(), vec![Value::from("x")]).err().unwrap();
        assert!(matches!(err, RelayError::Instantiation { .. }));
    }

    #[test]
    fn duplicate_signature_fails_registration() {
        let builder = counter_action().method("start", |c: Arc<Counter>, (): ()| async move {
            Ok::<_, Failure>(c.start)
        });
        let err = ActionCatalog::new().register(builder).unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[test]
    fn reserved_and_duplicate_action_names_fail() {
        let mut catalog = ActionCatalog::new();
        assert!(catalog
            .register(ActionBuilder::<Counter>::new("storage.REMOVE"))
            .is_err());
        catalog.register(counter_action()).unwrap();
        assert!(catalog.register(counter_action()).is_err());
    }

    #[test]
    fn asynchronous_registers_reply_methods_once() {
        let builder = counter_action()
            .asynchronous("slow", |c: Arc<Counter>, (): ()| async move { Ok::<_, Failure>(c.start) })
            .asynchronous("slow", |c: Arc<Counter>, (n,): (i64,)| async move {
                Ok::<_, Failure>(c.start + n)
            });
        let mut catalog = ActionCatalog::new();
        catalog.register(builder).unwrap();
        let spec = catalog.get("Counter").unwrap();
        assert!(spec.resolve("slow_reply", &[TypeTag::Long]).is_ok());
        assert!(spec.resolve("slow_reply", &[TypeTag::Long, TypeTag::Int]).is_ok());
        assert!(spec.method_signatures().contains(&"slow(long)".to_string()));
    }

    #[tokio::test]
    async fn reply_handlers_only_serve_their_issuer() {
        let builder = counter_action()
            .asynchronous("slow", |c: Arc<Counter>, (): ()| async move { Ok::<_, Failure>(c.start) })
            .asynchronous("fast", |c: Arc<Counter>, (): ()| async move { Ok::<_, Failure>(c.start) });
        let mut catalog = ActionCatalog::new();
        catalog.register(builder).unwrap();
        let spec = catalog.get("Counter").unwrap();
        let instance = spec.instantiate(&ctx(), vec![Value::Long(5)]).unwrap();
        let session = Arc::new(crate::session::Session::detached());

        let issue = spec.resolve("slow", &[]).unwrap();
        let handle = issue(instance.clone(), vec![], invoke_ctx(&session, 1, "slow"))
            .await
            .unwrap();
        let wait = [handle, Value::Int(1000)];
        let wait_tags = [TypeTag::Long, TypeTag::Int];

        let other_method = spec.resolve("fast_reply", &wait_tags).unwrap();
        let err = other_method(instance.clone(), wait.to_vec(), invoke_ctx(&session, 1, "fast_reply"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownHandle { .. }));

        let own_reply = spec.resolve("slow_reply", &wait_tags).unwrap();
        let err = own_reply(instance.clone(), wait.to_vec(), invoke_ctx(&session, 2, "slow_reply"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownHandle { .. }));

        let value = own_reply(instance, wait.to_vec(), invoke_ctx(&session, 1, "slow_reply"))
            .await
            .unwrap();
        assert_eq!(value, Value::Long(5));
    }
}
