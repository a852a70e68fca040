//! Lease countdown timer
//!
//! Single-shot countdown used by the assignment lease (and available to any
//! future offer with a deadline). The numeric countdown and any visual
//! progress indicator are both presentations of the one stored deadline:
//! `remaining()` recomputes from it on every call instead of decrementing a
//! parallel counter, so the two can never drift apart.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Action run when the countdown elapses
pub type ExpiryAction = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct TimerInner {
    generation: u64,
    deadline: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

/// Single-shot countdown: `arm(duration, on_expire)`, `disarm()`,
/// `remaining()`.
///
/// `on_expire` fires at most once per arm cycle; a completed `disarm()`
/// cancels the pending countdown. Re-arming implicitly disarms any previous
/// countdown first, so `arm` is always safe to call.
#[derive(Clone)]
pub struct LeaseTimer {
    inner: Arc<Mutex<TimerInner>>,
}

impl LeaseTimer {
    /// Create a disarmed timer
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TimerInner {
                generation: 0,
                deadline: None,
                task: None,
            })),
        }
    }

    /// Start a countdown of `duration`, replacing any previous one.
    pub fn arm(&self, duration: Duration, on_expire: ExpiryAction) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let generation = inner.generation;
        if let Some(previous) = inner.task.take() {
            previous.abort();
        }
        let deadline = Instant::now() + duration;
        inner.deadline = Some(deadline);
        debug!(?duration, generation, "lease timer armed");

        let shared = Arc::clone(&self.inner);
        inner.task = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let fire = {
                let mut inner = shared.lock();
                if inner.generation == generation {
                    inner.deadline = None;
                    inner.task = None;
                    true
                } else {
                    false
                }
            };
            if fire {
                debug!(generation, "lease timer expired");
                on_expire().await;
            }
        }));
    }

    /// Cancel the pending countdown, if any.
    pub fn disarm(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.deadline = None;
        if let Some(task) = inner.task.take() {
            task.abort();
            debug!("lease timer disarmed");
        }
    }

    /// Time left until the deadline; zero when disarmed or already elapsed.
    pub fn remaining(&self) -> Duration {
        self.inner
            .lock()
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Whether a countdown is currently pending
    pub fn armed(&self) -> bool {
        self.inner.lock().deadline.is_some()
    }
}

impl Default for LeaseTimer {
    fn default() -> Self {
        Self::new()
    }
}
