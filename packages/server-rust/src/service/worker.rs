//! Background worker for periodic tasks.
//!
//! A `BackgroundWorker` owns one spawned task that calls the tick hook of
//! a `BackgroundRunnable` on a fixed interval until it is stopped.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Periodic handler driven by `BackgroundWorker`.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// Called once per tick interval.
    async fn on_tick(&mut self);

    /// Called once when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Handle to a running background worker.
pub struct BackgroundWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl BackgroundWorker {
    /// Spawns the worker. The first tick fires one full interval after start.
    ///
    /// `tick` must be non-zero; [`RelayConfig::validate`](crate::service::RelayConfig::validate)
    /// guarantees this for the configured reaper interval.
    pub fn start<R: BackgroundRunnable>(mut runnable: R, tick: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => runnable.on_tick().await,
                    _ = &mut stop_rx => break,
                }
            }

            runnable.shutdown().await;
        });

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the worker and waits for its shutdown hook to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default, Clone)]
    struct Counts {
        ticks: Arc<AtomicU32>,
        shutdowns: Arc<AtomicU32>,
    }

    struct Recorder(Counts);

    #[async_trait]
    impl BackgroundRunnable for Recorder {
        async fn on_tick(&mut self) {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tick_fires_on_interval() {
        let counts = Counts::default();
        let mut worker = BackgroundWorker::start(Recorder(counts.clone()), Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(105)).await;
        worker.stop().await;

        assert!(counts.ticks.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_a_full_interval() {
        let counts = Counts::default();
        let mut worker = BackgroundWorker::start(Recorder(counts.clone()), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(counts.ticks.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counts.ticks.load(Ordering::SeqCst), 1);
        worker.stop().await;
    }

    #[tokio::test]
    async fn stop_runs_shutdown_hook_once() {
        let counts = Counts::default();
        let mut worker = BackgroundWorker::start(Recorder(counts.clone()), Duration::from_secs(60));
        assert!(worker.is_running());

        worker.stop().await;
        worker.stop().await;
        assert_eq!(counts.shutdowns.load(Ordering::SeqCst), 1);
        assert!(!worker.is_running());
    }
}
