//! Bounded request queue: run at most N units of work at once, start the
//! rest in submission order.

use crate::error::QueueError;
use crate::event::{Event, EventBus, EventKind};
use crate::model::{QueueStats, UnitId, UnitOutcome};
use crate::telemetry::metrics;
use crate::telemetry::unit::{record_outcome, start_unit_span};
use futures::FutureExt;
use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{Notify, broadcast, oneshot};
use tracing::{Instrument, Span, debug, warn};

/// Configuration for a request queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum units running at once. Must be positive.
    pub concurrency_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 3,
        }
    }
}

/// Hands a finished unit's result to its ticket.
type Deliver = Box<dyn FnOnce() + Send>;

/// A queued unit, type-erased. Running it reports how it ended and
/// returns the delivery of its result. Dropping it cancels the ticket.
struct Job {
    id: UnitId,
    enqueued_at: Instant,
    run: Box<dyn FnOnce() -> BoxFuture<'static, (UnitOutcome, Deliver)> + Send>,
}

struct QueueState {
    pending: VecDeque<Job>,
    active: usize,
}

struct QueueInner {
    limit: usize,
    state: Mutex<QueueState>,
    drained: Notify,
    events: EventBus,
}

/// Handle to a bounded request queue. Clones share the same queue.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl RequestQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_events(config, EventBus::new())
    }

    /// Build a queue that publishes onto an existing event bus.
    pub fn with_events(config: QueueConfig, events: EventBus) -> Self {
        // A zero limit would never start anything.
        let limit = config.concurrency_limit.max(1);
        Self {
            inner: Arc::new(QueueInner {
                limit,
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    active: 0,
                }),
                drained: Notify::new(),
                events,
            }),
        }
    }

    /// Submit a unit of work. It runs on a spawned task once a slot frees
    /// up, never inside this call. Must be called within a Tokio runtime.
    pub fn enqueue<F, Fut, T, E>(&self, work: F) -> Ticket<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let id = UnitId::new();
        let (tx, rx) = oneshot::channel();

        let run = move || -> BoxFuture<'static, (UnitOutcome, Deliver)> {
            async move {
                let result = AssertUnwindSafe(async move { work().await })
                    .catch_unwind()
                    .await;
                let (outcome, delivered) = match result {
                    Ok(Ok(value)) => (UnitOutcome::Succeeded, Ok(value)),
                    Ok(Err(e)) => (UnitOutcome::Failed, Err(QueueError::Work(e))),
                    Err(_) => (UnitOutcome::Panicked, Err(QueueError::Panicked)),
                };
                let deliver: Deliver = Box::new(move || {
                    // The caller may have dropped its ticket.
                    let _ = tx.send(delivered);
                });
                (outcome, deliver)
            }
            .boxed()
        };

        let pending = {
            let mut state = self.inner.lock();
            state.pending.push_back(Job {
                id,
                enqueued_at: Instant::now(),
                run: Box::new(run),
            });
            state.pending.len()
        };

        debug!(unit_id = %id, pending, "unit queued");
        metrics::units_enqueued().add(1, &[]);
        self.inner
            .events
            .publish(EventKind::UnitQueued { id, pending });

        self.inner.advance();
        Ticket { id, rx }
    }

    /// Units submitted but not yet started.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Units currently running.
    pub fn active_count(&self) -> usize {
        self.inner.lock().active
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.lock();
        QueueStats {
            pending: state.pending.len(),
            active: state.active,
            limit: self.inner.limit,
        }
    }

    /// Discard every unit that has not started. Their tickets resolve to
    /// [`QueueError::Cancelled`]; running units are left to finish.
    /// Returns how many units were discarded.
    pub fn clear(&self) -> usize {
        let (discarded, idle) = {
            let mut state = self.inner.lock();
            let discarded: Vec<Job> = state.pending.drain(..).collect();
            (discarded, state.active == 0)
        };
        let count = discarded.len();
        // Dropping the jobs drops their result senders.
        drop(discarded);

        if count > 0 {
            debug!(discarded = count, "queue cleared");
            metrics::units_cleared().add(count as u64, &[]);
        }
        self.inner
            .events
            .publish(EventKind::QueueCleared { discarded: count });
        if idle {
            self.inner.drained.notify_waiters();
        }
        count
    }

    /// Wait until nothing is pending or running.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.lock();
                if state.pending.is_empty() && state.active == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// The bus this queue publishes on, for components layered on top.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("stats", &self.stats())
            .finish()
    }
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start as many pending units as there are free slots.
    ///
    /// Slots are claimed under the lock, so a completion racing this call
    /// cannot hand the same slot out twice.
    fn advance(self: &Arc<Self>) {
        let (ready, active) = {
            let mut state = self.lock();
            let mut ready = Vec::new();
            while state.active < self.limit {
                match state.pending.pop_front() {
                    Some(job) => {
                        state.active += 1;
                        ready.push(job);
                    }
                    None => break,
                }
            }
            (ready, state.active)
        };

        for job in ready {
            let waited_ms = job.enqueued_at.elapsed().as_millis() as u64;
            debug!(unit_id = %job.id, active, waited_ms, "unit started");
            metrics::unit_wait_ms().record(waited_ms as f64, &[]);
            self.events.publish(EventKind::UnitStarted {
                id: job.id,
                active,
                waited_ms,
            });

            let inner = Arc::clone(self);
            let span = start_unit_span(&job.id);
            tokio::spawn(async move {
                let started = Instant::now();
                let (outcome, deliver) = (job.run)().instrument(span.clone()).await;
                inner.complete(job.id, outcome, deliver, started, &span);
            });
        }
    }

    fn complete(
        self: &Arc<Self>,
        id: UnitId,
        outcome: UnitOutcome,
        deliver: Deliver,
        started: Instant,
        span: &Span,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;
        {
            let mut state = self.lock();
            state.active -= 1;
        }

        record_outcome(span, outcome);
        match outcome {
            UnitOutcome::Succeeded => debug!(unit_id = %id, duration_ms, "unit finished"),
            UnitOutcome::Failed => debug!(unit_id = %id, duration_ms, "unit failed"),
            UnitOutcome::Panicked => warn!(unit_id = %id, duration_ms, "unit panicked"),
        }
        metrics::units_finished().add(1, &[KeyValue::new("outcome", outcome.as_str())]);
        metrics::unit_duration_ms().record(duration_ms as f64, &[]);
        self.events.publish(EventKind::UnitFinished {
            id,
            outcome,
            duration_ms,
        });
        // Only after the slot is released: a resolved ticket never counts
        // as active.
        deliver();

        self.advance();

        let state = self.lock();
        if state.pending.is_empty() && state.active == 0 {
            drop(state);
            self.drained.notify_waiters();
        }
    }
}

/// Pending result of a queued unit. Resolves exactly once.
#[must_use = "a ticket does nothing unless awaited; dropping it does not cancel the unit"]
pub struct Ticket<T, E> {
    id: UnitId,
    rx: oneshot::Receiver<Result<T, QueueError<E>>>,
}

impl<T, E> Ticket<T, E> {
    pub fn id(&self) -> UnitId {
        self.id
    }
}

impl<T, E> Future for Ticket<T, E> {
    type Output = Result<T, QueueError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without sending: the job was discarded.
            Poll::Ready(Err(_)) => Poll::Ready(Err(QueueError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T, E> std::fmt::Debug for Ticket<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket").field("id", &self.id).finish()
    }
}
