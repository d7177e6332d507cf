//! Integration tests for the debounced, coalescing updater.
//!
//! Timers run on a `ManualClock`, so every window is stepped explicitly.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use syncq::engine::{DebounceConfig, Debouncer, ManualClock, QueueConfig, RequestQueue};
use syncq::error::UpdateError;
use syncq::event::EventKind;
use syncq::model::{KeyPhase, RecordKey};
use tokio::sync::Semaphore;

const WINDOW: Duration = Duration::from_millis(1000);

type Updater = Debouncer<RecordKey, &'static str, String>;

/// Stand-in for the remote API. Optionally holds every send until released.
#[derive(Clone, Default)]
struct Remote {
    sent: Arc<Mutex<Vec<(RecordKey, &'static str)>>>,
    started: Arc<AtomicUsize>,
    in_flight: Arc<Mutex<HashMap<RecordKey, usize>>>,
    overlapped: Arc<AtomicBool>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    reject: Arc<Mutex<HashSet<&'static str>>>,
    gate: Option<Arc<Semaphore>>,
}

impl Remote {
    fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    fn reject(&self, payload: &'static str) {
        self.reject.lock().unwrap().insert(payload);
    }

    fn sent(&self) -> Vec<(RecordKey, &'static str)> {
        self.sent.lock().unwrap().clone()
    }

    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    async fn send(&self, key: RecordKey, payload: &'static str) -> Result<(), String> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(key.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
        }

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        *self.in_flight.lock().unwrap().get_mut(&key).unwrap() -= 1;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push((key, payload));
        if self.reject.lock().unwrap().contains(payload) {
            Err(format!("rejected {payload}"))
        } else {
            Ok(())
        }
    }
}

fn setup(limit: usize, remote: &Remote) -> (Updater, ManualClock) {
    let clock = ManualClock::new();
    let queue = RequestQueue::new(QueueConfig {
        concurrency_limit: limit,
    });
    let sink = remote.clone();
    let updater: Updater = Debouncer::new(
        queue,
        clock.clone(),
        DebounceConfig { interval: WINDOW },
        move |key: RecordKey, payload: &'static str| {
            let sink = sink.clone();
            async move { sink.send(key, payload).await }
        },
    );
    (updater, clock)
}

fn task(id: &str) -> RecordKey {
    RecordKey::new("tasks", id)
}

/// Let spawned tasks run until `cond` holds.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}

// ---------------------------------------------------------------------------
// Coalescing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn burst_sends_only_the_last_payload() {
    let remote = Remote::default();
    let (updater, clock) = setup(3, &remote);

    updater.request(task("1"), "p1");
    clock.advance(Duration::from_millis(300));
    updater.request(task("1"), "p2");
    clock.advance(Duration::from_millis(300));
    updater.request(task("1"), "p3");
    assert_eq!(updater.phase(&task("1")), KeyPhase::Pending);

    clock.advance(Duration::from_millis(399));
    updater.idle().await;
    assert!(remote.sent().is_empty(), "fired before the window closed");

    clock.advance(Duration::from_millis(1));
    updater.idle().await;
    assert_eq!(remote.sent(), vec![(task("1"), "p3")]);
    assert_eq!(updater.phase(&task("1")), KeyPhase::Idle);
    assert_eq!(updater.tracked_keys(), 0);
}

#[tokio::test]
async fn window_is_measured_from_the_first_request() {
    let remote = Remote::default();
    let (updater, clock) = setup(3, &remote);

    updater.request(task("1"), "first");
    clock.advance(Duration::from_millis(900));
    updater.request(task("1"), "late");
    clock.advance(Duration::from_millis(100));
    updater.idle().await;

    assert_eq!(remote.sent(), vec![(task("1"), "late")]);
    assert_eq!(clock.now(), Duration::from_millis(1000));
}

#[tokio::test]
async fn coalesced_requests_share_the_round_outcome() {
    let remote = Remote::default();
    let (updater, clock) = setup(3, &remote);

    let first = updater.request(task("1"), "a");
    let second = updater.request(task("1"), "b");
    clock.advance(WINDOW);

    assert!(first.await.is_ok());
    assert!(second.await.is_ok());
    assert_eq!(remote.sent(), vec![(task("1"), "b")]);
}

#[tokio::test]
async fn different_keys_debounce_independently() {
    let remote = Remote::default();
    let (updater, clock) = setup(3, &remote);

    updater.request(task("a"), "a1");
    clock.advance(Duration::from_millis(500));
    updater.request(task("b"), "b1");

    clock.advance(Duration::from_millis(500));
    updater.idle().await;
    assert_eq!(remote.sent(), vec![(task("a"), "a1")]);
    assert_eq!(updater.phase(&task("b")), KeyPhase::Pending);

    clock.advance(Duration::from_millis(500));
    updater.idle().await;
    assert_eq!(remote.sent(), vec![(task("a"), "a1"), (task("b"), "b1")]);
}

// ---------------------------------------------------------------------------
// One send per key in flight
// ---------------------------------------------------------------------------

#[tokio::test]
async fn request_during_send_waits_for_it_to_finish() {
    let remote = Remote::gated();
    let (updater, clock) = setup(3, &remote);
    let key = task("1");

    updater.request(key.clone(), "p1");
    clock.advance(WINDOW);
    wait_until(|| remote.started() == 1).await;
    assert_eq!(updater.phase(&key), KeyPhase::Sending);

    updater.request(key.clone(), "p4");
    assert_eq!(updater.phase(&key), KeyPhase::SendingWithNext);

    // No timer is armed for the next round while the first is in flight.
    clock.advance(WINDOW * 5);
    tokio::task::yield_now().await;
    assert_eq!(remote.started(), 1);

    remote.release(1);
    wait_until(|| updater.phase(&key) == KeyPhase::Pending).await;
    assert_eq!(remote.sent(), vec![(key.clone(), "p1")]);

    clock.advance(WINDOW);
    wait_until(|| remote.started() == 2).await;
    remote.release(1);
    updater.idle().await;

    assert_eq!(remote.sent(), vec![(key.clone(), "p1"), (key, "p4")]);
    assert!(!remote.overlapped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn next_round_slot_keeps_only_the_latest_payload() {
    let remote = Remote::gated();
    let (updater, clock) = setup(3, &remote);
    let key = task("1");

    updater.request(key.clone(), "p1");
    clock.advance(WINDOW);
    wait_until(|| remote.started() == 1).await;

    updater.request(key.clone(), "p2");
    updater.request(key.clone(), "p3");

    remote.release(1);
    wait_until(|| updater.phase(&key) == KeyPhase::Pending).await;
    clock.advance(WINDOW);
    wait_until(|| remote.started() == 2).await;
    remote.release(1);
    updater.idle().await;

    assert_eq!(remote.sent(), vec![(key.clone(), "p1"), (key, "p3")]);
}

#[tokio::test]
async fn sends_respect_the_queue_concurrency_limit() {
    let remote = Remote::gated();
    let (updater, clock) = setup(1, &remote);

    for id in ["a", "b", "c"] {
        updater.request(task(id), "v");
    }
    clock.advance(WINDOW);
    wait_until(|| remote.started() == 1).await;
    assert_eq!(updater.queue().active_count(), 1);
    assert_eq!(updater.queue().pending_count(), 2);

    remote.release(3);
    updater.idle().await;

    assert_eq!(remote.sent().len(), 3);
    assert_eq!(remote.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn settled_receipt_sees_the_key_idle_again() {
    let remote = Remote::default();
    let (updater, clock) = setup(2, &remote);
    let mut events = updater.subscribe();

    for i in 0..150 {
        let receipt = updater.request(task("1"), "edit");
        clock.advance(WINDOW);
        receipt.await.unwrap();

        assert_eq!(updater.phase(&task("1")), KeyPhase::Idle, "round {i}");
        assert_eq!(updater.tracked_keys(), 0);
    }
    assert_eq!(remote.sent().len(), 150);

    // Every follow-up request found the key idle, never behind a send.
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event.kind, EventKind::UpdateDeferred { .. }),
            "request deferred behind a settled send"
        );
    }
}

// ---------------------------------------------------------------------------
// Cancel and flush
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_drops_the_pending_payload() {
    let remote = Remote::default();
    let (updater, clock) = setup(3, &remote);

    let receipt = updater.request(task("1"), "draft");
    assert!(updater.cancel(&task("1")));
    assert_eq!(clock.armed(), 0);

    clock.advance(WINDOW * 2);
    updater.idle().await;

    assert!(remote.sent().is_empty());
    assert!(matches!(receipt.await, Err(UpdateError::Cancelled)));
    assert_eq!(updater.phase(&task("1")), KeyPhase::Idle);
    assert!(!updater.cancel(&task("1")));
}

#[tokio::test]
async fn cancel_leaves_an_in_flight_send_alone() {
    let remote = Remote::gated();
    let (updater, clock) = setup(3, &remote);
    let key = task("1");

    let sent = updater.request(key.clone(), "p1");
    clock.advance(WINDOW);
    wait_until(|| remote.started() == 1).await;

    let next = updater.request(key.clone(), "p2");
    assert!(updater.cancel(&key));
    assert_eq!(updater.phase(&key), KeyPhase::Sending);

    remote.release(1);
    assert!(sent.await.is_ok());
    assert!(matches!(next.await, Err(UpdateError::Cancelled)));
    updater.idle().await;

    assert_eq!(remote.sent(), vec![(key.clone(), "p1")]);
    assert_eq!(updater.phase(&key), KeyPhase::Idle);
}

#[tokio::test]
async fn flush_all_sends_without_waiting_for_the_window() {
    let remote = Remote::default();
    let (updater, clock) = setup(3, &remote);

    updater.request(task("a"), "a1");
    updater.request(task("b"), "b1");

    assert_eq!(updater.flush_all(), 2);
    assert_eq!(clock.armed(), 0);
    updater.idle().await;

    let mut sent = remote.sent();
    sent.sort();
    assert_eq!(sent, vec![(task("a"), "a1"), (task("b"), "b1")]);
    assert_eq!(clock.now(), Duration::ZERO);
}

#[tokio::test]
async fn flush_all_releases_next_round_once_in_flight_send_settles() {
    let remote = Remote::gated();
    let (updater, clock) = setup(3, &remote);
    let key = task("1");

    updater.request(key.clone(), "p1");
    clock.advance(WINDOW);
    wait_until(|| remote.started() == 1).await;
    updater.request(key.clone(), "p2");

    assert_eq!(updater.flush_all(), 0);

    remote.release(1);
    wait_until(|| remote.started() == 2).await;
    assert_eq!(clock.armed(), 0);
    remote.release(1);
    updater.idle().await;

    assert_eq!(remote.sent(), vec![(key.clone(), "p1"), (key, "p2")]);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_send_reaches_receipt_and_key_recovers() {
    let remote = Remote::default();
    remote.reject("bad");
    let (updater, clock) = setup(3, &remote);
    let key = task("1");

    let receipt = updater.request(key.clone(), "bad");
    clock.advance(WINDOW);
    match receipt.await {
        Err(UpdateError::Send(e)) => assert_eq!(*e, "rejected bad"),
        other => panic!("expected send failure, got {other:?}"),
    }
    updater.idle().await;
    assert_eq!(updater.phase(&key), KeyPhase::Idle);

    let retry = updater.request(key.clone(), "good");
    clock.advance(WINDOW);
    assert!(retry.await.is_ok());
    assert_eq!(remote.sent(), vec![(key.clone(), "bad"), (key, "good")]);
}

#[tokio::test]
async fn queue_clear_cancels_a_dispatched_round() {
    let remote = Remote::gated();
    let (updater, clock) = setup(1, &remote);

    updater.request(task("a"), "a1");
    clock.advance(WINDOW);
    wait_until(|| remote.started() == 1).await;

    let blocked = updater.request(task("b"), "b1");
    clock.advance(WINDOW);
    assert_eq!(updater.queue().pending_count(), 1);

    assert_eq!(updater.queue().clear(), 1);
    assert!(matches!(blocked.await, Err(UpdateError::Cancelled)));

    remote.release(1);
    updater.idle().await;
    assert_eq!(updater.phase(&task("b")), KeyPhase::Idle);
    assert_eq!(remote.sent(), vec![(task("a"), "a1")]);
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn round_lifecycle_is_published_in_order() {
    let remote = Remote::default();
    let (updater, clock) = setup(3, &remote);
    let mut events = updater.subscribe();

    updater.request(task("1"), "a");
    updater.request(task("1"), "b");
    clock.advance(WINDOW);
    updater.idle().await;
    updater.queue().idle().await;

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        let name = match event.kind {
            EventKind::UpdateScheduled { .. } => "scheduled",
            EventKind::UpdateCoalesced { .. } => "coalesced",
            EventKind::UpdateDispatched { .. } => "dispatched",
            EventKind::UnitQueued { .. } => "queued",
            EventKind::UnitStarted { .. } => "started",
            EventKind::UnitFinished { .. } => "finished",
            EventKind::UpdateSettled { success, .. } => {
                assert!(success);
                "settled"
            }
            _ => continue,
        };
        kinds.push(name);
    }

    assert_eq!(
        kinds,
        vec![
            "scheduled",
            "coalesced",
            "queued",
            "started",
            "dispatched",
            "finished",
            "settled"
        ]
    );
}
