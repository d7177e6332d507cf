//! Timer capability: "run this callback after a duration".
//!
//! The updater never touches wall-clock time directly. Production code
//! injects [`TokioScheduler`]; tests inject [`ManualClock`] and step
//! virtual time explicitly.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::trace;

/// Callback run when a timer expires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Schedules one-shot callbacks.
pub trait Scheduler: Send + Sync + 'static {
    /// Run `callback` once after `after` has elapsed. The returned handle
    /// cancels it; dropping the handle leaves the timer running.
    fn schedule(&self, after: Duration, callback: TimerCallback) -> TimerHandle;
}

/// Cancellation token for a scheduled callback.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancel the timer. A no-op if it already fired.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tokio
// ---------------------------------------------------------------------------

/// Timers as spawned `tokio::time::sleep` tasks.
///
/// Honors Tokio's paused clock, so `#[tokio::test(start_paused = true)]`
/// also works with it. Must be used from within a Tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, after: Duration, callback: TimerCallback) -> TimerHandle {
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            callback();
        });
        TimerHandle::new(move || task.abort())
    }
}

// ---------------------------------------------------------------------------
// Virtual clock
// ---------------------------------------------------------------------------

/// Manually advanced clock. Nothing fires until [`ManualClock::advance`].
#[derive(Clone, Default)]
pub struct ManualClock {
    inner: Arc<Mutex<ClockState>>,
}

#[derive(Default)]
struct ClockState {
    now: Duration,
    next_id: u64,
    // Keyed by (deadline, id): equal deadlines fire in scheduling order.
    timers: BTreeMap<(Duration, u64), TimerCallback>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClockState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Virtual time elapsed since construction.
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Number of timers that have not fired or been cancelled.
    pub fn armed(&self) -> usize {
        self.lock().timers.len()
    }

    /// Move time forward by `by`, firing every timer that comes due, in
    /// deadline order. Timers scheduled by a firing callback also fire if
    /// their deadline falls inside the window.
    pub fn advance(&self, by: Duration) {
        let target = self.lock().now + by;
        loop {
            let due = {
                let mut state = self.lock();
                let next = state
                    .timers
                    .first_key_value()
                    .map(|(k, _)| *k)
                    .filter(|(deadline, _)| *deadline <= target);
                match next {
                    Some(key) => {
                        state.now = key.0;
                        state.timers.remove(&key)
                    }
                    None => {
                        state.now = target;
                        None
                    }
                }
            };
            // Callbacks run with the clock unlocked so they can reschedule.
            match due {
                Some(callback) => callback(),
                None => break,
            }
        }
    }
}

impl Scheduler for ManualClock {
    fn schedule(&self, after: Duration, callback: TimerCallback) -> TimerHandle {
        let key = {
            let mut state = self.lock();
            state.next_id += 1;
            let key = (state.now + after, state.next_id);
            state.timers.insert(key, callback);
            key
        };
        trace!(deadline_ms = key.0.as_millis() as u64, "virtual timer armed");

        let weak: Weak<Mutex<ClockState>> = Arc::downgrade(&self.inner);
        TimerHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                let removed = inner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .timers
                    .remove(&key);
                // Dropped outside the lock: callbacks may own other handles.
                drop(removed);
            }
        })
    }
}

impl std::fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ManualClock")
            .field("now", &state.now)
            .field("armed", &state.timers.len())
            .finish()
    }
}
