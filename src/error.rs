//! Error types for syncq.
//!
//! Failures are always local to the ticket or receipt that produced them.
//! Nothing here is fatal to the queue or the updater.

use std::sync::Arc;
use thiserror::Error;

/// Crate-level error for the ambient concerns (config, scripts, telemetry).
#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("scenario error: {0}")]
    Scenario(String),

    #[error("telemetry error: {0}")]
    Telemetry(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a unit of work that did not produce a value.
#[derive(Debug, Error)]
pub enum QueueError<E> {
    /// The unit ran and returned this error.
    #[error("unit of work failed: {0}")]
    Work(E),

    /// The unit was discarded by `clear()` before it started.
    #[error("unit of work cancelled before it started")]
    Cancelled,

    /// The unit panicked while running. Its slot was released.
    #[error("unit of work panicked")]
    Panicked,
}

impl<E> QueueError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Outcome of a debounced update round that was not persisted.
///
/// Shared by every receipt whose request was coalesced into the round,
/// hence the `Arc` around the send error.
#[derive(Debug, Error)]
pub enum UpdateError<E> {
    #[error("send failed: {0}")]
    Send(Arc<E>),

    /// Cancelled by `cancel(key)` or discarded from the queue before sending.
    #[error("update cancelled before it was sent")]
    Cancelled,

    #[error("send panicked")]
    Panicked,
}

impl<E> Clone for UpdateError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Send(e) => Self::Send(Arc::clone(e)),
            Self::Cancelled => Self::Cancelled,
            Self::Panicked => Self::Panicked,
        }
    }
}

impl<E> From<QueueError<E>> for UpdateError<E> {
    fn from(err: QueueError<E>) -> Self {
        match err {
            QueueError::Work(e) => Self::Send(Arc::new(e)),
            QueueError::Cancelled => Self::Cancelled,
            QueueError::Panicked => Self::Panicked,
        }
    }
}
