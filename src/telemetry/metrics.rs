//! Metric instrument factories for syncq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider every instrument is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for syncq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("syncq")
}

/// Counter: units submitted to a queue.
pub fn units_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("syncq.queue.enqueued")
        .with_description("Number of units of work submitted")
        .build()
}

/// Counter: units that ran to completion.
/// Labels: `outcome` ("succeeded" | "failed" | "panicked").
pub fn units_finished() -> Counter<u64> {
    meter()
        .u64_counter("syncq.queue.finished")
        .with_description("Number of units of work that finished running")
        .build()
}

/// Counter: units discarded by `clear()` before starting.
pub fn units_cleared() -> Counter<u64> {
    meter()
        .u64_counter("syncq.queue.cleared")
        .with_description("Number of units of work discarded before starting")
        .build()
}

/// Histogram: time a unit spent waiting for a slot.
pub fn unit_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("syncq.queue.wait_ms")
        .with_description("Time from enqueue to start in milliseconds")
        .with_unit("ms")
        .build()
}

/// Histogram: time a unit spent running.
pub fn unit_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("syncq.queue.duration_ms")
        .with_description("Unit run time in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: update requests.
/// Labels: `disposition` ("scheduled" | "coalesced" | "deferred").
pub fn update_requests() -> Counter<u64> {
    meter()
        .u64_counter("syncq.update.requests")
        .with_description("Number of debounced update requests")
        .build()
}

/// Counter: send rounds that settled.
/// Labels: `result` ("ok" | "error" | "cancelled" | "panicked").
pub fn update_sends() -> Counter<u64> {
    meter()
        .u64_counter("syncq.update.sends")
        .with_description("Number of debounced send rounds settled")
        .build()
}

/// Counter: pending updates dropped by `cancel(key)`.
pub fn updates_cancelled() -> Counter<u64> {
    meter()
        .u64_counter("syncq.update.cancelled")
        .with_description("Number of pending updates cancelled before sending")
        .build()
}
