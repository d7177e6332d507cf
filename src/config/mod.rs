//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on malformed values. Every variable
//! is optional; defaults match the dashboard's observed usage.

use crate::engine::{DebounceConfig, QueueConfig};
use crate::error::{Error, Result};
use serde::Serialize;
use std::time::Duration;

pub const DEFAULT_CONCURRENCY: usize = 3;
pub const DEFAULT_DEBOUNCE_MS: u64 = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Maximum sends running at once (`SYNCQ_CONCURRENCY`).
    pub concurrency_limit: usize,
    /// Debounce window in milliseconds (`SYNCQ_DEBOUNCE_MS`).
    pub debounce_ms: u64,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            concurrency_limit: positive_var(&lookup, "SYNCQ_CONCURRENCY", DEFAULT_CONCURRENCY)?,
            debounce_ms: positive_var(&lookup, "SYNCQ_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS)?,
            otel_endpoint: lookup("OTEL_ENDPOINT").filter(|v| !v.is_empty()),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn queue(&self) -> QueueConfig {
        QueueConfig {
            concurrency_limit: self.concurrency_limit,
        }
    }

    pub fn debounce(&self) -> DebounceConfig {
        DebounceConfig {
            interval: Duration::from_millis(self.debounce_ms),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

fn positive_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let Some(raw) = lookup(name) else {
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(Error::Config(format!(
            "{name} must be a positive integer, got '{raw}'"
        ))),
    }
}
