//! Load-shedding middleware for dispatches.
//!
//! A dispatch arriving while `max_concurrent_dispatches` are already running
//! fails with `RelayError::Overloaded`, which the HTTP layer captures into a
//! failure envelope like any other dispatch failure.
//!
//! Reserved actions and asynchronous reply retrievals never take a permit.

use std::sync::Arc;
use std::task::{Context, Poll};

use devrelay_core::ResponseEnvelope;
use tokio::sync::Semaphore;
use tower::{Layer, Service};
use tracing::warn;

use crate::service::catalog::{is_reserved, REPLY_SUFFIX};
use crate::service::dispatcher::DispatchFuture;
use crate::service::operation::{Call, RelayError};

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer bounding concurrent dispatches with a semaphore.
///
/// Permits are never queued for: when none is free the dispatch is refused.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    permits: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent as usize)),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            permits: Arc::clone(&self.permits),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    permits: Arc<Semaphore>,
}

impl<S> LoadShedService<S> {
    /// Permits currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl<S> Service<Call> for LoadShedService<S>
where
    S: Service<Call, Response = ResponseEnvelope, Error = RelayError> + Send,
    S::Future: Send + 'static,
{
    type Response = ResponseEnvelope;
    type Error = RelayError;
    type Future = DispatchFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: Call) -> Self::Future {
        if is_exempt(&call) {
            return Box::pin(self.inner.call(call));
        }
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            warn!(action = %call.request.action, call_id = call.call_id, "dispatch shed");
            return Box::pin(async { Err(RelayError::Overloaded) });
        };

        let fut = self.inner.call(call);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

fn is_exempt(call: &Call) -> bool {
    is_reserved(&call.request.action) || call.request.method.ends_with(REPLY_SUFFIX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
