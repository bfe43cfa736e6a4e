use std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use runtime::Runtime;

use crate::metrics::log_bg_error_active;

/// Cap on how long a background loop's idle sleep can delay noticing
/// shutdown. Chosen to be short enough that `shutdown()` never perceptibly
/// stalls on it, regardless of how long the loop's own tick cadence is.
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared background-loop state: the cooperative shutdown flag and the
/// sticky-fatal error slot. Both the compaction loop and the index build
/// loop hold a handle to the same `BgState` so either one tripping the
/// error halts both (a non-OK `bg_error` disables future ticks/passes).
#[derive(Default)]
pub struct BgState {
    shutting_down: AtomicBool,
    error: Mutex<Option<Arc<anyhow::Error>>>,
}

impl BgState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn has_error(&self) -> bool {
        self.error.lock().is_some()
    }

    pub fn set_error(&self, e: anyhow::Error) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(Arc::new(e));
            log_bg_error_active(true);
        }
    }

    /// The first sticky error recorded, if any.
    pub fn error(&self) -> Option<Arc<anyhow::Error>> {
        self.error.lock().clone()
    }
}

/// Sleep for `total`, checking `is_shutting_down` every
/// `SHUTDOWN_POLL_INTERVAL` instead of once at the end. Returns `false` the
/// moment shutdown is observed (without necessarily sleeping the full
/// `total`), `true` once `total` has elapsed with no shutdown. An idle
/// background loop using this instead of a single `runtime.wait(total)` can
/// never delay `shutdown()` by more than one poll interval.
pub async fn wait_or_shutdown(runtime: &impl Runtime, bg: &BgState, total: Duration) -> bool {
    let mut remaining = total;
    loop {
        if bg.is_shutting_down() {
            return false;
        }
        if remaining.is_zero() {
            return true;
        }
        let chunk = remaining.min(SHUTDOWN_POLL_INTERVAL);
        runtime.wait(chunk).await;
        remaining -= chunk;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_is_sticky_and_keeps_the_first_cause() {
        let bg = BgState::new();
        assert!(!bg.has_error());
        bg.set_error(anyhow::anyhow!("first"));
        bg.set_error(anyhow::anyhow!("second"));
        assert!(bg.has_error());
        assert_eq!(bg.error().unwrap().to_string(), "first");
    }

    #[test]
    fn shutdown_flag_round_trips() {
        let bg = BgState::new();
        assert!(!bg.is_shutting_down());
        bg.begin_shutdown();
        assert!(bg.is_shutting_down());
    }

    #[tokio::test]
    async fn wait_or_shutdown_returns_early_once_shutdown_begins() {
        let bg = BgState::new();
        bg.begin_shutdown();
        let finished = wait_or_shutdown(&runtime::testing::test_runtime(), &bg, Duration::from_secs(3600)).await;
        assert!(!finished, "an already-shutting-down loop must not sleep the full interval");
    }

    #[tokio::test]
    async fn wait_or_shutdown_returns_true_once_the_full_interval_elapses() {
        let bg = BgState::new();
        let finished =
            wait_or_shutdown(&runtime::testing::test_runtime(), &bg, Duration::from_millis(1)).await;
        assert!(finished);
    }
}
