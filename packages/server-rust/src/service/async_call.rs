//! Per-session asynchronous call manager.
//!
//! An asynchronous call returns a [`CallId`] immediately while its work runs
//! on a spawned task. The reply is retrieved exactly once, either by a
//! non-blocking poll or by a bounded wait built on
//! [`poll_until`](super::retry::poll_until).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use devrelay_core::{CallId, Failure, ObjectId, Value};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::operation::RelayError;
use super::retry::{poll_until, Attempt, RetryOutcome};

/// Work issued as an asynchronous call.
pub type CallFuture = Pin<Box<dyn Future<Output = Result<Value, Failure>> + Send>>;

/// Result of a non-blocking reply poll.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyPoll {
    Ready(Result<Value, Failure>),
    NotReady,
}

/// The instance and method that issued a call. Only the same pair may
/// retrieve its reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOwner {
    pub object_id: ObjectId,
    pub method: String,
}

impl CallOwner {
    #[must_use]
    pub fn new(object_id: ObjectId, method: impl Into<String>) -> Self {
        Self {
            object_id,
            method: method.into(),
        }
    }
}

struct PendingCall {
    owner: CallOwner,
    rx: oneshot::Receiver<Result<Value, Failure>>,
    awaiting: bool,
}

/// Issues asynchronous calls and hands out their replies.
pub struct AsyncCallManager {
    pending: Mutex<HashMap<CallId, PendingCall>>,
    next_id: AtomicU64,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl std::fmt::Debug for AsyncCallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCallManager")
            .field("pending", &self.pending.lock().len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl AsyncCallManager {
    /// Creates a manager whose spawned calls stop when `cancel` fires.
    #[must_use]
    pub fn new(poll_interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            poll_interval,
            cancel,
        }
    }

    /// Starts `work` in the background and returns its handle.
    pub fn issue(&self, owner: CallOwner, work: CallFuture) -> CallId {
        let id = CallId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                result = work => {
                    // The receiver is gone if the session was torn down first.
                    let _ = tx.send(result);
                }
                () = cancel.cancelled() => {
                    debug!(call_id = %id, "asynchronous call cancelled");
                }
            }
        });

        self.pending
            .lock()
            .insert(
                id,
                PendingCall {
                    owner,
                    rx,
                    awaiting: false,
                },
            );
        id
    }

    /// Non-blocking retrieval by the call's `owner`. A `Ready` reply
    /// consumes the handle.
    ///
    /// # Errors
    ///
    /// `HandleConsumed` or `UnknownHandle` for handles that cannot be
    /// polled, `UnknownHandle` when `owner` did not issue the call (the
    /// handle stays live), `AwaitInProgress` while another request is
    /// waiting on it.
    pub fn poll(&self, id: CallId, owner: &CallOwner) -> Result<ReplyPoll, RelayError> {
        let mut pending = self.pending.lock();
        let Some(call) = pending.get_mut(&id) else {
            return Err(self.missing(id));
        };
        if call.owner != *owner {
            return Err(RelayError::UnknownHandle { call_id: id });
        }
        if call.awaiting {
            return Err(RelayError::AwaitInProgress { call_id: id });
        }
        Ok(Self::take(&mut pending, id))
    }

    /// Waits for the reply, failing with `ReplyNotArrived` once `timeout`
    /// elapses. `None` waits until the reply arrives or `cancel` fires.
    ///
    /// # Errors
    ///
    /// The errors of [`poll`](Self::poll), plus `ReplyNotArrived` on timeout,
    /// `Cancelled` on cancellation, and `Delegate` when the call itself failed.
    pub async fn await_reply(
        &self,
        id: CallId,
        owner: &CallOwner,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Value, RelayError> {
        {
            let mut pending = self.pending.lock();
            let Some(call) = pending.get_mut(&id) else {
                return Err(self.missing(id));
            };
            if call.owner != *owner {
                return Err(RelayError::UnknownHandle { call_id: id });
            }
            if call.awaiting {
                return Err(RelayError::AwaitInProgress { call_id: id });
            }
            call.awaiting = true;
        }
        let _claim = AwaitClaim { manager: self, id };

        let outcome = poll_until(
            || match Self::take(&mut self.pending.lock(), id) {
                ReplyPoll::Ready(result) => Attempt::Ready(result),
                ReplyPoll::NotReady => Attempt::NotReady,
            },
            timeout,
            self.poll_interval,
            cancel,
        )
        .await;

        match outcome {
            RetryOutcome::Ready(Ok(value)) => Ok(value),
            RetryOutcome::Ready(Err(failure)) => Err(RelayError::Delegate(failure)),
            RetryOutcome::TimedOut { waited } => Err(RelayError::ReplyNotArrived {
                call_id: id,
                waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            }),
            RetryOutcome::Cancelled => Err(RelayError::Cancelled { call_id: id }),
        }
    }

    /// Number of issued calls whose reply has not been retrieved.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drops every pending call. Spawned work is stopped by the session's
    /// cancellation token, not by this method.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    fn take(pending: &mut HashMap<CallId, PendingCall>, id: CallId) -> ReplyPoll {
        // Absent only when the session was torn down mid-wait.
        let Some(call) = pending.get_mut(&id) else {
            return ReplyPoll::Ready(Err(abandoned()));
        };
        match call.rx.try_recv() {
            Ok(result) => {
                pending.remove(&id);
                ReplyPoll::Ready(result)
            }
            Err(TryRecvError::Empty) => ReplyPoll::NotReady,
            Err(TryRecvError::Closed) => {
                pending.remove(&id);
                ReplyPoll::Ready(Err(abandoned()))
            }
        }
    }

    fn missing(&self, id: CallId) -> RelayError {
        if id.0 > 0 && id.0 < self.next_id.load(Ordering::Relaxed) {
            RelayError::HandleConsumed { call_id: id }
        } else {
            RelayError::UnknownHandle { call_id: id }
        }
    }
}

fn abandoned() -> Failure {
    Failure::new("CancelledError", "asynchronous call ended before producing a reply")
        .with_origin("relay")
}

/// Releases the single-awaiter claim when the wait ends, however it ends.
struct AwaitClaim<'a> {
    manager: &'a AsyncCallManager,
    id: CallId,
}

impl Drop for AwaitClaim<'_> {
    fn drop(&mut self) {
        if let Some(call) = self.manager.pending.lock().get_mut(&self.id) {
            call.awaiting = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::Instant;

    use super::*;

    const INTERVAL: Duration = Duration::from_millis(50);

    fn manager() -> AsyncCallManager {
        AsyncCallManager::new(INTERVAL, CancellationToken::new())
    }

    fn owner() -> CallOwner {
        CallOwner::new(ObjectId(1), "command_inout_asynch")
    }

    fn delayed(ms: u64, value: Value) -> CallFuture {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(value)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn handles_are_monotonic_from_one() {
        let calls = manager();
        assert_eq!(calls.issue(owner(), delayed(1, Value::Null)), CallId(1));
        assert_eq!(calls.issue(owner(), delayed(1, Value::Null)), CallId(2));
        assert_eq!(calls.pending_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_reports_not_ready_then_consumes_reply() {
        let calls = manager();
        let id = calls.issue(owner(), delayed(100, Value::Int(9)));

        assert_eq!(calls.poll(id, &owner()).unwrap(), ReplyPoll::NotReady);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.poll(id, &owner()).unwrap(), ReplyPoll::Ready(Ok(Value::Int(9))));

        let err = calls.poll(id, &owner()).unwrap_err();
        assert!(matches!(err, RelayError::HandleConsumed { call_id } if call_id == id));
    }

    #[tokio::test(start_paused = true)]
    async fn never_issued_handle_is_unknown() {
        let calls = manager();
        assert!(matches!(
            calls.poll(CallId(5), &owner()),
            Err(RelayError::UnknownHandle { .. })
        ));
        assert!(matches!(
            calls.poll(CallId(0), &owner()),
            Err(RelayError::UnknownHandle { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn await_times_out_within_one_interval() {
        let calls = manager();
        let cancel = CancellationToken::new();
        let id = calls.issue(owner(), delayed(10_000, Value::Null));

        let start = Instant::now();
        let err = calls
            .await_reply(id, &owner(), Some(Duration::from_millis(200)), &cancel)
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, RelayError::ReplyNotArrived { .. }));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed <= Duration::from_millis(250));
        // The handle stays live after a timeout.
        assert_eq!(calls.poll(id, &owner()).unwrap(), ReplyPoll::NotReady);
    }

    #[tokio::test(start_paused = true)]
    async fn await_returns_reply_within_one_interval_of_readiness() {
        let calls = manager();
        let cancel = CancellationToken::new();
        let id = calls.issue(owner(), delayed(120, Value::from("done")));

        let start = Instant::now();
        let value = calls.await_reply(id, &owner(), None, &cancel).await.unwrap();
        assert_eq!(value, Value::from("done"));
        assert!(start.elapsed() <= Duration::from_millis(170));
        assert_eq!(calls.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_call_surfaces_delegate_failure() {
        let calls = manager();
        let cancel = CancellationToken::new();
        let id = calls.issue(owner(), Box::pin(async {
            Err::<Value, _>(Failure::new("API_CommandFailed", "boom"))
        }));
        let err = calls.await_reply(id, &owner(), None, &cancel).await.unwrap_err();
        assert!(matches!(err, RelayError::Delegate(ref f) if f.kind == "API_CommandFailed"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_awaiter_is_rejected() {
        let calls = Arc::new(manager());
        let cancel = CancellationToken::new();
        let id = calls.issue(owner(), delayed(500, Value::Null));

        let first = {
            let calls = Arc::clone(&calls);
            let cancel = cancel.clone();
            tokio::spawn(async move { calls.await_reply(id, &owner(), None, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = calls.await_reply(id, &owner(), None, &cancel).await.unwrap_err();
        assert!(matches!(err, RelayError::AwaitInProgress { .. }));
        assert!(matches!(calls.poll(id, &owner()), Err(RelayError::AwaitInProgress { .. })));

        assert_eq!(first.await.unwrap().unwrap(), Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_indefinite_await() {
        let calls = manager();
        let cancel = CancellationToken::new();
        let id = calls.issue(owner(), delayed(60_000, Value::Null));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = calls.await_reply(id, &owner(), None, &cancel).await.unwrap_err();
        assert!(matches!(err, RelayError::Cancelled { .. }));
        // Claim released: the handle can be polled again.
        assert_eq!(calls.poll(id, &owner()).unwrap(), ReplyPoll::NotReady);
    }

    #[tokio::test(start_paused = true)]
    async fn manager_cancel_abandons_running_work() {
        let cancel = CancellationToken::new();
        let calls = AsyncCallManager::new(INTERVAL, cancel.clone());
        let id = calls.issue(owner(), delayed(60_000, Value::Null));
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(1)).await;

        match calls.poll(id, &owner()).unwrap() {
            ReplyPoll::Ready(Err(failure)) => assert_eq!(failure.kind, "CancelledError"),
            other => panic!("expected abandoned reply, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_owner_cannot_consume_reply() {
        let calls = manager();
        let cancel = CancellationToken::new();
        let id = calls.issue(owner(), delayed(10, Value::Int(3)));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let other_object = CallOwner::new(ObjectId(2), "command_inout_asynch");
        let other_method = CallOwner::new(ObjectId(1), "read_asynch");
        for stranger in [&other_object, &other_method] {
            assert!(matches!(
                calls.poll(id, stranger),
                Err(RelayError::UnknownHandle { call_id }) if call_id == id
            ));
            assert!(matches!(
                calls.await_reply(id, stranger, None, &cancel).await,
                Err(RelayError::UnknownHandle { .. })
            ));
        }

        assert_eq!(calls.pending_count(), 1);
        assert_eq!(calls.poll(id, &owner()).unwrap(), ReplyPoll::Ready(Ok(Value::Int(3))));
    }
}
