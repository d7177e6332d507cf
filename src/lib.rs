//! # syncq
//!
//! Client-side write path for a dashboard backed by a hosted Postgres API.
//!
//! Provides a bounded-concurrency request queue, a per-record debounced
//! updater that coalesces rapid edits into one send, structured events for
//! both, and OpenTelemetry observability.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod scenario;
pub mod telemetry;
