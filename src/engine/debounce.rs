//! Debounced, coalescing updater.
//!
//! Turns a rapid stream of "persist this payload for key K" requests into
//! at most one send per key per debounce window, carrying the latest
//! payload. Sends go through a [`RequestQueue`], so they also respect its
//! concurrency limit.
//!
//! Per key: `Idle -> Pending -> Sending -> Idle`. The window is fixed: it
//! starts at the first request of a burst and is not extended by later
//! ones. A request that arrives while the key is sending waits as the
//! next round and arms its own timer only once the send settles, so a key
//! never has two sends in flight.

use crate::engine::clock::{Scheduler, TimerHandle};
use crate::engine::queue::RequestQueue;
use crate::error::UpdateError;
use crate::event::{Event, EventKind};
use crate::model::KeyPhase;
use crate::telemetry::metrics;
use crate::telemetry::unit::{record_state_transition, start_round_span};
use futures::FutureExt;
use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, oneshot};
use tracing::{Instrument, Span, debug, info, warn};

/// Configuration for a debounced updater.
#[derive(Debug, Clone)]
pub struct DebounceConfig {
    /// Quiet window measured from the first request of a burst.
    pub interval: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
        }
    }
}

type SendFn<K, P, E> = Arc<dyn Fn(K, P) -> BoxFuture<'static, Result<(), E>> + Send + Sync>;
type Waiter<E> = oneshot::Sender<Result<(), UpdateError<E>>>;
type Round<K, P, E> = (K, P, Vec<Waiter<E>>);

/// What `request` did with a payload.
#[derive(Debug, Clone, Copy)]
enum Disposition {
    /// Key was idle; a timer was armed.
    Scheduled,
    /// Replaced the payload of an armed timer.
    Coalesced,
    /// Stored as the next round behind an in-flight send.
    Deferred,
}

impl Disposition {
    fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Coalesced => "coalesced",
            Self::Deferred => "deferred",
        }
    }
}

/// One debounce group.
struct KeyState<P, E> {
    /// Latest payload not yet handed to the queue.
    payload: Option<P>,
    /// Receipts of every request folded into `payload`.
    waiters: Vec<Waiter<E>>,
    /// Armed timer, tagged with its round number.
    timer: Option<(u64, TimerHandle)>,
    /// A send is enqueued or running.
    sending: bool,
    /// Dispatch the next round without a timer once the send settles.
    flush_on_settle: bool,
}

impl<P, E> KeyState<P, E> {
    fn new() -> Self {
        Self {
            payload: None,
            waiters: Vec::new(),
            timer: None,
            sending: false,
            flush_on_settle: false,
        }
    }

    fn phase(&self) -> KeyPhase {
        match (self.sending, self.payload.is_some()) {
            (true, true) => KeyPhase::SendingWithNext,
            (true, false) => KeyPhase::Sending,
            (false, true) => KeyPhase::Pending,
            (false, false) => KeyPhase::Idle,
        }
    }

    fn take_round(&mut self) -> Option<(P, Vec<Waiter<E>>)> {
        let payload = self.payload.take()?;
        self.sending = true;
        Some((payload, std::mem::take(&mut self.waiters)))
    }
}

struct DebounceInner<K, P, E> {
    queue: RequestQueue,
    scheduler: Arc<dyn Scheduler>,
    interval: Duration,
    send: SendFn<K, P, E>,
    keys: Mutex<HashMap<K, KeyState<P, E>>>,
    settled: Notify,
    next_round: AtomicU64,
}

/// Debounced, coalescing updater. Clones share the same state.
///
/// Timers hold only a weak reference: once every handle is dropped, armed
/// payloads are lost. Owners call [`Debouncer::flush_all`] on teardown.
pub struct Debouncer<K, P, E> {
    inner: Arc<DebounceInner<K, P, E>>,
}

impl<K, P, E> Clone for Debouncer<K, P, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, P, E> Debouncer<K, P, E>
where
    K: Eq + Hash + Clone + Display + Send + 'static,
    P: Send + 'static,
    E: Send + Sync + 'static,
{
    /// Create an updater that persists payloads with `send`, routed
    /// through `queue`, with timers from `scheduler`.
    pub fn new<S, F, Fut>(
        queue: RequestQueue,
        scheduler: S,
        config: DebounceConfig,
        send: F,
    ) -> Self
    where
        S: Scheduler,
        F: Fn(K, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let send: SendFn<K, P, E> = Arc::new(move |key, payload| send(key, payload).boxed());
        Self {
            inner: Arc::new(DebounceInner {
                queue,
                scheduler: Arc::new(scheduler),
                interval: config.interval,
                send,
                keys: Mutex::new(HashMap::new()),
                settled: Notify::new(),
                next_round: AtomicU64::new(0),
            }),
        }
    }

    /// Record `payload` as the latest value for `key`.
    ///
    /// The receipt resolves once the round carrying this payload settles.
    /// Dropping it is fine; the update still goes out.
    pub fn request(&self, key: K, payload: P) -> Receipt<E> {
        let (tx, rx) = oneshot::channel();
        let disposition = {
            let mut keys = self.inner.lock();
            let state = keys.entry(key.clone()).or_insert_with(KeyState::new);
            state.payload = Some(payload);
            state.waiters.push(tx);
            if state.sending {
                Disposition::Deferred
            } else if state.timer.is_none() {
                self.inner.arm(&key, state);
                Disposition::Scheduled
            } else {
                Disposition::Coalesced
            }
        };

        let label = key.to_string();
        debug!(key = %label, disposition = disposition.as_str(), "update requested");
        metrics::update_requests()
            .add(1, &[KeyValue::new("disposition", disposition.as_str())]);
        let kind = match disposition {
            Disposition::Scheduled => EventKind::UpdateScheduled { key: label },
            Disposition::Coalesced => EventKind::UpdateCoalesced { key: label },
            Disposition::Deferred => EventKind::UpdateDeferred { key: label },
        };
        self.inner.queue.events().publish(kind);

        Receipt { rx }
    }

    /// Drop the armed timer and stored payload for `key` without sending.
    /// An in-flight send is not affected. Returns whether a payload was
    /// discarded.
    pub fn cancel(&self, key: &K) -> bool {
        let (discarded, timer, waiters) = {
            let mut keys = self.inner.lock();
            let Some(state) = keys.get_mut(key) else {
                return false;
            };
            let timer = state.timer.take().map(|(_, handle)| handle);
            let discarded = state.payload.take().is_some();
            let waiters = std::mem::take(&mut state.waiters);
            state.flush_on_settle = false;
            if !state.sending {
                keys.remove(key);
            }
            (discarded, timer, waiters)
        };

        if let Some(timer) = timer {
            timer.cancel();
        }
        // Dropped senders resolve their receipts as cancelled.
        drop(waiters);

        if discarded {
            debug!(key = %key, "pending update cancelled");
            metrics::updates_cancelled().add(1, &[]);
            self.inner.queue.events().publish(EventKind::UpdateCancelled {
                key: key.to_string(),
            });
        }
        discarded
    }

    /// Fire every armed timer now. Keys whose next round waits behind an
    /// in-flight send dispatch it as soon as that send settles. Returns how
    /// many rounds were dispatched immediately.
    pub fn flush_all(&self) -> usize {
        let (due, timers) = {
            let mut keys = self.inner.lock();
            let mut due: Vec<Round<K, P, E>> = Vec::new();
            let mut timers = Vec::new();
            for (key, state) in keys.iter_mut() {
                if let Some((_, handle)) = state.timer.take() {
                    timers.push(handle);
                    if let Some((payload, waiters)) = state.take_round() {
                        due.push((key.clone(), payload, waiters));
                    }
                } else if state.sending && state.payload.is_some() {
                    state.flush_on_settle = true;
                }
            }
            (due, timers)
        };

        for timer in timers {
            timer.cancel();
        }
        let rounds = due.len();
        for (key, payload, waiters) in due {
            self.inner.dispatch(key, payload, waiters);
        }

        info!(rounds, "flushed pending updates");
        self.inner
            .queue
            .events()
            .publish(EventKind::Flushed { rounds });
        rounds
    }

    /// Current phase of `key`'s debounce group.
    pub fn phase(&self, key: &K) -> KeyPhase {
        self.inner
            .lock()
            .get(key)
            .map_or(KeyPhase::Idle, KeyState::phase)
    }

    /// Keys that are not idle.
    pub fn tracked_keys(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.inner.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.queue.subscribe()
    }

    /// Wait until no key has a send in flight. Armed timers do not count.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.inner.lock().values().any(|state| state.sending) {
                return;
            }
            notified.await;
        }
    }
}

impl<K, P, E> DebounceInner<K, P, E>
where
    K: Eq + Hash + Clone + Display + Send + 'static,
    P: Send + 'static,
    E: Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, HashMap<K, KeyState<P, E>>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm(self: &Arc<Self>, key: &K, state: &mut KeyState<P, E>) {
        let round = self.next_round.fetch_add(1, Ordering::Relaxed) + 1;
        let weak = Arc::downgrade(self);
        let key = key.clone();
        let handle = self.scheduler.schedule(
            self.interval,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.fire(key, round);
                }
            }),
        );
        state.timer = Some((round, handle));
    }

    /// Timer expiry for `key`. Ignored unless `round` is still the armed one.
    fn fire(self: &Arc<Self>, key: K, round: u64) {
        let due = {
            let mut keys = self.lock();
            let Some(state) = keys.get_mut(&key) else {
                return;
            };
            match state.timer {
                Some((armed, _)) if armed == round => {}
                _ => return,
            }
            state.timer = None;
            let due = state.take_round();
            if due.is_none() {
                keys.remove(&key);
            }
            due
        };

        if let Some((payload, waiters)) = due {
            self.dispatch(key, payload, waiters);
        }
    }

    /// Hand one round to the queue and watch it settle.
    fn dispatch(self: &Arc<Self>, key: K, payload: P, waiters: Vec<Waiter<E>>) {
        let send = Arc::clone(&self.send);
        let send_key = key.clone();
        let ticket = self.queue.enqueue(move || send(send_key, payload));

        let unit = ticket.id();
        let label = key.to_string();
        let span = start_round_span(&label, &unit);
        record_state_transition(&span, "pending", "sending");
        debug!(key = %label, unit_id = %unit, "update dispatched");
        self.queue
            .events()
            .publish(EventKind::UpdateDispatched { key: label, unit });

        let inner = Arc::clone(self);
        let round_span = span.clone();
        tokio::spawn(
            async move {
                let result = ticket.await.map_err(UpdateError::from);
                inner.settle(key, result, waiters, &round_span);
            }
            .instrument(span),
        );
    }

    fn settle(
        self: &Arc<Self>,
        key: K,
        result: Result<(), UpdateError<E>>,
        waiters: Vec<Waiter<E>>,
        span: &Span,
    ) {
        let label = key.to_string();
        let tag = match &result {
            Ok(()) => "ok",
            Err(UpdateError::Send(_)) => "error",
            Err(UpdateError::Cancelled) => "cancelled",
            Err(UpdateError::Panicked) => "panicked",
        };
        if result.is_ok() {
            debug!(key = %label, "update sent");
        } else {
            warn!(key = %label, result = tag, "update not persisted");
        }
        metrics::update_sends().add(1, &[KeyValue::new("result", tag)]);

        // Key state first: a resolved receipt never observes the round as
        // still sending.
        let (next, phase) = {
            let mut keys = self.lock();
            match keys.get_mut(&key) {
                None => (None, KeyPhase::Idle),
                Some(state) => {
                    state.sending = false;
                    let mut next = None;
                    if state.payload.is_some() {
                        if state.flush_on_settle {
                            state.flush_on_settle = false;
                            next = state.take_round();
                        } else {
                            self.arm(&key, state);
                        }
                    }
                    let phase = state.phase();
                    if phase == KeyPhase::Idle {
                        keys.remove(&key);
                    }
                    (next, phase)
                }
            }
        };
        record_state_transition(span, "sending", &phase.to_string());
        self.queue.events().publish(EventKind::UpdateSettled {
            key: label,
            success: result.is_ok(),
        });

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }

        if let Some((payload, waiters)) = next {
            self.dispatch(key, payload, waiters);
        }
        self.settled.notify_waiters();
    }
}

/// Resolves once the round carrying a request settles.
pub struct Receipt<E> {
    rx: oneshot::Receiver<Result<(), UpdateError<E>>>,
}

impl<E> Future for Receipt<E> {
    type Output = Result<(), UpdateError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Waiter dropped: the payload was cancelled or the updater went away.
            Poll::Ready(Err(_)) => Poll::Ready(Err(UpdateError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<E> std::fmt::Debug for Receipt<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receipt").finish_non_exhaustive()
    }
}
