//! Runtime abstraction for the background-loop scheduling this engine needs:
//! sleeping, spawning a named task, and reading the clock. Background loops
//! (the compaction loop, the index build loop, the lifecycle supervisor) are
//! generic over `Runtime` so they can run against a real `tokio` executor in
//! production and a lighter one in tests.

use std::{
    future::Future,
    pin::Pin,
    time::{
        Duration,
        SystemTime,
    },
};

use futures::future::BoxFuture;

pub mod prod;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[derive(thiserror::Error, Debug)]
pub enum JoinError {
    #[error("task was canceled")]
    Canceled,
    #[error("task panicked: {0}")]
    Panicked(anyhow::Error),
}

impl From<tokio::task::JoinError> for JoinError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            JoinError::Canceled
        } else {
            JoinError::Panicked(anyhow::anyhow!(e))
        }
    }
}

/// A handle to a spawned background task: cooperative shutdown plus join.
pub trait SpawnHandle: Send {
    fn shutdown(&mut self);
    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>>;
}

/// Preempt the task at its next yield point and wait for it to actually stop.
/// A canceled task is a normal, successful shutdown, not an error.
pub async fn shutdown_and_join(mut handle: Box<dyn SpawnHandle>) -> anyhow::Result<()> {
    handle.shutdown();
    if let Err(e) = handle.join().await {
        if !matches!(e, JoinError::Canceled) {
            return Err(e.into());
        }
    }
    Ok(())
}

pub trait Runtime: Clone + Send + Sync + 'static {
    /// Sleep for the given duration. Used by the timer-driven background
    /// loops (compaction, index build) to pace their ticks.
    fn wait(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;

    /// Spawn a named background future, returning a handle that can request
    /// cooperative shutdown and be joined.
    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle>;

    /// Current wall-clock time.
    fn system_time(&self) -> SystemTime;

    /// Current reading from a monotonic clock, for measuring elapsed
    /// durations (not comparable across processes).
    fn monotonic_now(&self) -> tokio::time::Instant;

    /// The runtime's source of randomness, used for tie-breaking and
    /// jittering background-loop intervals.
    fn rng(&self) -> Box<dyn rand::RngCore>;
}
