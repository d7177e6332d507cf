//! Scripted replay of edit bursts against a simulated remote sink.
//!
//! A scenario is a TOML script of timed steps (request, cancel, flush).
//! Replaying it drives a real [`Debouncer`] over a real [`RequestQueue`]
//! and records exactly which payloads reached the sink, and when.
//!
//! ```toml
//! debounce_ms = 200
//! send_latency_ms = 50
//! fail_keys = ["tasks/9"]
//!
//! [[steps]]
//! at_ms = 0
//! action = "request"
//! key = "tasks/1"
//! payload = { title = "Draft" }
//! ```

use crate::config::Config;
use crate::engine::{DebounceConfig, Debouncer, QueueConfig, RequestQueue, TokioScheduler};
use crate::error::{Error, Result, UpdateError};
use crate::model::RecordKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

// ---------------------------------------------------------------------------
// Script
// ---------------------------------------------------------------------------

/// A replayable script. Unset settings fall back to [`Config`].
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub concurrency: Option<usize>,
    pub debounce_ms: Option<u64>,
    /// How long each simulated send takes.
    #[serde(default)]
    pub send_latency_ms: u64,
    /// Keys whose sends the sink rejects.
    #[serde(default)]
    pub fail_keys: Vec<RecordKey>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    /// Offset from the start of the replay.
    pub at_ms: u64,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Request {
        key: RecordKey,
        payload: serde_json::Value,
    },
    Cancel {
        key: RecordKey,
    },
    Flush,
}

impl Scenario {
    pub fn from_toml(content: &str) -> Result<Self> {
        let scenario: Self =
            toml::from_str(content).map_err(|e| Error::Scenario(format!("bad script: {e}")))?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| Error::Scenario(format!("{}: {e}", path.display())))
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == Some(0) {
            return Err(Error::Scenario("concurrency must be positive".to_string()));
        }
        if self.debounce_ms == Some(0) {
            return Err(Error::Scenario("debounce_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Replay the script in (Tokio) time and report what was sent.
    pub async fn run(&self, defaults: &Config) -> Result<Report> {
        let concurrency = self.concurrency.unwrap_or(defaults.concurrency_limit);
        let debounce_ms = self.debounce_ms.unwrap_or(defaults.debounce_ms);

        let queue = RequestQueue::new(QueueConfig {
            concurrency_limit: concurrency,
        });
        let started = Instant::now();
        let sink = SimulatedSink::new(
            started,
            Duration::from_millis(self.send_latency_ms),
            self.fail_keys.iter().cloned().collect(),
        );
        let send_sink = sink.clone();
        let debouncer = Debouncer::new(
            queue.clone(),
            TokioScheduler,
            DebounceConfig {
                interval: Duration::from_millis(debounce_ms),
            },
            move |key: RecordKey, payload: serde_json::Value| {
                let sink = send_sink.clone();
                async move { sink.send(key, payload).await }
            },
        );

        info!(
            concurrency,
            debounce_ms,
            steps = self.steps.len(),
            "replaying scenario"
        );

        let mut steps = self.steps.clone();
        steps.sort_by_key(|step| step.at_ms);

        let mut receipts = Vec::new();
        for step in steps {
            tokio::time::sleep_until(started + Duration::from_millis(step.at_ms)).await;
            match step.action {
                Action::Request { key, payload } => {
                    receipts.push(debouncer.request(key, payload));
                }
                Action::Cancel { key } => {
                    debouncer.cancel(&key);
                }
                Action::Flush => {
                    debouncer.flush_all();
                }
            }
        }

        let requests = receipts.len();
        let (mut acknowledged, mut failed, mut cancelled) = (0, 0, 0);
        for receipt in receipts {
            match receipt.await {
                Ok(()) => acknowledged += 1,
                Err(UpdateError::Send(_)) | Err(UpdateError::Panicked) => failed += 1,
                Err(UpdateError::Cancelled) => cancelled += 1,
            }
        }
        debouncer.idle().await;
        queue.idle().await;

        Ok(Report {
            concurrency,
            debounce_ms,
            requests,
            acknowledged,
            failed,
            cancelled,
            max_in_flight: sink.max_in_flight(),
            sends: sink.records(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// One call that reached the sink.
#[derive(Debug, Clone, Serialize)]
pub struct SendRecord {
    pub at_ms: u64,
    pub key: RecordKey,
    pub payload: serde_json::Value,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub concurrency: usize,
    pub debounce_ms: u64,
    /// `request` steps replayed.
    pub requests: usize,
    /// Receipts that resolved successfully.
    pub acknowledged: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Peak concurrent sends seen by the sink.
    pub max_in_flight: usize,
    pub sends: Vec<SendRecord>,
    pub elapsed_ms: u64,
}

impl Report {
    pub fn sends_for(&self, key: &RecordKey) -> Vec<&SendRecord> {
        self.sends.iter().filter(|s| &s.key == key).collect()
    }
}

// ---------------------------------------------------------------------------
// Simulated sink
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
#[error("simulated remote rejected update for {0}")]
pub struct RejectedUpdate(pub RecordKey);

/// Stands in for the remote API: sleeps, records, optionally rejects.
#[derive(Clone)]
struct SimulatedSink {
    started: Instant,
    latency: Duration,
    fail_keys: Arc<HashSet<RecordKey>>,
    records: Arc<Mutex<Vec<SendRecord>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl SimulatedSink {
    fn new(started: Instant, latency: Duration, fail_keys: HashSet<RecordKey>) -> Self {
        Self {
            started,
            latency,
            fail_keys: Arc::new(fail_keys),
            records: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn send(
        &self,
        key: RecordKey,
        payload: serde_json::Value,
    ) -> std::result::Result<(), RejectedUpdate> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let at_ms = self.started.elapsed().as_millis() as u64;

        tokio::time::sleep(self.latency).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let ok = !self.fail_keys.contains(&key);
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SendRecord {
                at_ms,
                key: key.clone(),
                payload,
                ok,
            });
        if ok { Ok(()) } else { Err(RejectedUpdate(key)) }
    }

    fn records(&self) -> Vec<SendRecord> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        records.sort_by_key(|r| r.at_ms);
        records
    }

    fn max_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Bench
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub concurrency: usize,
    pub units: usize,
    pub work_ms: u64,
    pub elapsed_ms: u64,
    /// `ceil(units / concurrency) * work_ms`: the ideal bounded runtime.
    pub expected_ms: u64,
    /// Peak units observed running at once, measured inside the units.
    pub max_active: usize,
}

/// Push `units` sleeping units through a queue and time it.
pub async fn run_bench(concurrency: usize, units: usize, work_ms: u64) -> BenchReport {
    let queue = RequestQueue::new(QueueConfig {
        concurrency_limit: concurrency,
    });
    let started = Instant::now();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut tickets = Vec::with_capacity(units);
    for _ in 0..units {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        tickets.push(queue.enqueue(move || async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(work_ms)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, std::convert::Infallible>(())
        }));
    }
    for ticket in tickets {
        let _ = ticket.await;
    }

    let limit = queue.limit();
    BenchReport {
        concurrency: limit,
        units,
        work_ms,
        elapsed_ms: started.elapsed().as_millis() as u64,
        expected_ms: units.div_ceil(limit) as u64 * work_ms,
        max_active: peak.load(Ordering::SeqCst),
    }
}
