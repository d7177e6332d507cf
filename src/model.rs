//! Core data model.
//!
//! Units of work have no identity beyond their place in the queue; the
//! `UnitId` exists only so logs, spans and events can be correlated.
//! Debounce groups are keyed by whatever the caller chooses, typically a
//! `RecordKey` naming one row of one table.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Unit identity
// ---------------------------------------------------------------------------

/// Newtype for unit-of-work IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitId(pub Uuid);

impl UnitId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

/// How a unit of work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    Succeeded,
    Failed,
    Panicked,
}

impl UnitOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Panicked => "panicked",
        }
    }
}

impl std::fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Submitted but not yet started.
    pub pending: usize,
    /// Currently running. Never above `limit`.
    pub active: usize,
    pub limit: usize,
}

// ---------------------------------------------------------------------------
// Record keys
// ---------------------------------------------------------------------------

/// Identity of one remote record: `table/id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordKey {
    pub table: String,
    pub id: String,
}

impl RecordKey {
    pub fn new(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.table, self.id)
    }
}

impl FromStr for RecordKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((table, id)) if !table.is_empty() && !id.is_empty() => {
                Ok(Self::new(table, id))
            }
            _ => Err(format!("invalid record key '{s}': expected table/id")),
        }
    }
}

impl TryFrom<String> for RecordKey {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RecordKey> for String {
    fn from(key: RecordKey) -> Self {
        key.to_string()
    }
}

// ---------------------------------------------------------------------------
// Key phase
// ---------------------------------------------------------------------------

/// Where a debounce group is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPhase {
    /// Nothing stored, nothing in flight.
    Idle,
    /// Timer armed, payload stored.
    Pending,
    /// A send is enqueued or running.
    Sending,
    /// A send is in flight and the next round's payload is waiting behind it.
    SendingWithNext,
}

impl std::fmt::Display for KeyPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KeyPhase::Idle => "idle",
            KeyPhase::Pending => "pending",
            KeyPhase::Sending => "sending",
            KeyPhase::SendingWithNext => "sending_with_next",
        };
        write!(f, "{s}")
    }
}
