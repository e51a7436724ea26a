//! Per-dispatch tracing span and latency histogram.

use std::task::{Context, Poll};
use std::time::Instant;

use devrelay_core::ResponseEnvelope;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::dispatcher::DispatchFuture;
use crate::service::operation::{Call, RelayError};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that wraps each dispatch in a `dispatch` span.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

/// Outcome label: `failure` when the envelope carries a captured failure.
fn outcome_label(result: &Result<ResponseEnvelope, RelayError>) -> &'static str {
    match result {
        Ok(response) if response.is_failure() => "failure",
        Ok(_) => "ok",
        Err(_) => "error",
    }
}

impl<S> Service<Call> for MetricsService<S>
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
        let call_id = call.call_id;
        let span = info_span!(
            "dispatch",
            action = %call.request.action,
            method = %call.request.method,
            call_id,
            session = %call.session.id(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(call);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();
                let outcome = outcome_label(&result);

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                let span = tracing::Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", outcome);

                ::metrics::histogram!("devrelay_dispatch_seconds", "outcome" => outcome)
                    .record(elapsed.as_secs_f64());
                tracing::debug!(call_id, duration_ms, outcome, "dispatch complete");

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use devrelay_core::{Failure, RequestEnvelope, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::session::Session;

    /// Echoes the request method as the result, or fails on `"fail"`.
    struct Echo;

    impl Service<Call> for Echo {
        type Response = ResponseEnvelope;
        type Error = RelayError;
        type Future = DispatchFuture;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, call: Call) -> Self::Future {
            let method = call.request.method;
            Box::pin(async move {
                if method == "fail" {
                    Ok(ResponseEnvelope::failure(Failure::new("Boom", "boom")))
                } else {
                    Ok(ResponseEnvelope::value(Value::String(method)))
                }
            })
        }
    }

    fn call(method: &str) -> Call {
        Call::new(
            42,
            Arc::new(Session::detached()),
            RequestEnvelope::create("DeviceProxy", vec![], method),
        )
    }

    #[tokio::test]
    async fn passes_response_through() {
        let resp = MetricsLayer.layer(Echo).oneshot(call("ping")).await.unwrap();
        assert_eq!(resp.primary(), Some(&Value::from("ping")));
    }

    #[test]
    fn outcome_distinguishes_captured_failures() {
        assert_eq!(outcome_label(&Ok(ResponseEnvelope::value(Value::Null))), "ok");
        assert_eq!(
            outcome_label(&Ok(ResponseEnvelope::failure(Failure::new("X", "x")))),
            "failure"
        );
        assert_eq!(outcome_label(&Err(RelayError::Overloaded)), "error");
    }
}
