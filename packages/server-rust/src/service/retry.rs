//! Poll-with-timeout combinator shared by every blocking reply wait.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result of a single non-blocking poll.
#[derive(Debug, PartialEq, Eq)]
pub enum Attempt<T> {
    Ready(T),
    NotReady,
}

/// Final outcome of [`poll_until`].
#[derive(Debug, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Ready(T),
    TimedOut { waited: Duration },
    Cancelled,
}

/// Repeatedly calls `poll` until it yields a value, the timeout elapses or
/// `cancel` fires.
///
/// `timeout = None` waits indefinitely. Between polls the task sleeps for
/// `min(interval, remaining)`, and a final poll is always made before the
/// timeout is reported, so the wait ends no earlier than the timeout and no
/// later than one interval after it.
pub async fn poll_until<T, F>(
    mut poll: F,
    timeout: Option<Duration>,
    interval: Duration,
    cancel: &CancellationToken,
) -> RetryOutcome<T>
where
    F: FnMut() -> Attempt<T>,
{
    let start = Instant::now();
    loop {
        if let Attempt::Ready(value) = poll() {
            return RetryOutcome::Ready(value);
        }

        let delay = match timeout {
            None => interval,
            Some(limit) => {
                let waited = start.elapsed();
                if waited >= limit {
                    return RetryOutcome::TimedOut { waited };
                }
                interval.min(limit - waited)
            }
        };

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => return RetryOutcome::Cancelled,
        }
    }
}
