//! Cancellable periodic work.
//!
//! A [`BackgroundWorker`] waits one period, runs its unit of work, and
//! repeats until cancelled:
//!
//! ```text
//! Idle ──start()──▶ Waiting ──period──▶ Running ──done──▶ Waiting ...
//!                      │                   │
//!                      └────cancel─────────┴──────▶ Stopped
//! ```
//!
//! A failed or panicking run is logged and counted; the next tick still
//! happens.

use crate::error::ServerResult;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created, not started.
    Idle,
    /// Waiting for the next tick.
    Waiting,
    /// Running its unit of work.
    Running,
    /// Cancelled; no further ticks.
    Stopped,
}

#[derive(Debug)]
struct WorkerShared {
    name: String,
    state: Mutex<WorkerState>,
    runs: AtomicU64,
    failures: AtomicU64,
}

impl WorkerShared {
    fn set(&self, state: WorkerState) {
        let mut current = self.state.lock();
        if *current != WorkerState::Stopped {
            *current = state;
        }
    }
}

/// A periodic task bound to a cancellation token.
#[derive(Debug)]
pub struct BackgroundWorker {
    shared: Arc<WorkerShared>,
    period: Duration,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundWorker {
    /// Creates an idle worker. It stops when `parent` is cancelled.
    #[must_use]
    pub fn new(name: impl Into<String>, period: Duration, parent: &CancellationToken) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                name: name.into(),
                state: Mutex::new(WorkerState::Idle),
                runs: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
            period,
            cancel: parent.child_token(),
            handle: Mutex::new(None),
        }
    }

    /// Starts ticking on the current tokio runtime. Returns false if the
    /// worker was not idle.
    ///
    /// `work` receives the worker's token so long runs can stop early.
    pub fn start<F, Fut>(&self, work: F) -> bool
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServerResult<()>> + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            if *state != WorkerState::Idle {
                return false;
            }
            *state = WorkerState::Waiting;
        }

        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let period = self.period;
        let handle = tokio::spawn(async move {
            loop {
                shared.set(WorkerState::Waiting);
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(period) => {}
                }

                shared.set(WorkerState::Running);
                match AssertUnwindSafe(work(cancel.clone())).catch_unwind().await {
                    Ok(Ok(())) => {
                        shared.runs.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        shared.runs.fetch_add(1, Ordering::Relaxed);
                        shared.failures.fetch_add(1, Ordering::Relaxed);
                        warn!(worker = %shared.name, error = %e, "background work failed");
                    }
                    Err(_) => {
                        shared.runs.fetch_add(1, Ordering::Relaxed);
                        shared.failures.fetch_add(1, Ordering::Relaxed);
                        error!(worker = %shared.name, "background work panicked");
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
            }
            *shared.state.lock() = WorkerState::Stopped;
            debug!(worker = %shared.name, "background worker stopped");
        });
        *self.handle.lock() = Some(handle);
        true
    }

    /// Returns the worker's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock()
    }

    /// Returns the number of completed runs, failed ones included.
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.shared.runs.load(Ordering::Relaxed)
    }

    /// Returns the number of failed or panicked runs.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }

    /// Cancels the worker without waiting for it.
    pub fn stop(&self) {
        self.cancel.cancel();
        let mut state = self.shared.state.lock();
        if *state == WorkerState::Idle {
            *state = WorkerState::Stopped;
        }
    }

    /// Cancels the worker and waits for its current run to end.
    pub async fn stop_and_wait(&self) {
        self.stop();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(worker = %self.shared.name, error = %e, "background worker task failed");
            }
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerError;

    #[tokio::test(start_paused = true)]
    async fn ticks_every_period() {
        let parent = CancellationToken::new();
        let worker = BackgroundWorker::new("ticker", Duration::from_secs(10), &parent);
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);
        assert!(worker.start(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));
        assert!(!worker.start(|_| async { Ok(()) }));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert_eq!(worker.state(), WorkerState::Waiting);

        worker.stop_and_wait().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_worker() {
        let parent = CancellationToken::new();
        let worker = BackgroundWorker::new("flaky", Duration::from_secs(1), &parent);
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        worker.start(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    0 => Err(ServerError::command("transient")),
                    1 => panic!("boom"),
                    _ => Ok(()),
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(worker.runs(), 3);
        assert_eq!(worker.failures(), 2);
        assert_ne!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_aborts_wait() {
        let parent = CancellationToken::new();
        let worker = BackgroundWorker::new("idle", Duration::from_secs(3600), &parent);
        worker.start(|_| async { Ok(()) });
        parent.cancel();
        worker.stop_and_wait().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(worker.runs(), 0);
    }

    #[test]
    fn stopping_an_idle_worker() {
        let parent = CancellationToken::new();
        let worker = BackgroundWorker::new("never", Duration::from_secs(1), &parent);
        worker.stop();
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(!worker.start(|_| async { Ok(()) }));
    }
}
