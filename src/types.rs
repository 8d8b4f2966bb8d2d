//! Core types for channel records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Store-assigned record identifier. Strictly increasing per collection.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct RecordId(pub u64);

impl RecordId {
    pub fn next(self) -> Self {
        RecordId(self.0 + 1)
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Fixed per-record overhead counted against a collection's byte capacity.
const RECORD_OVERHEAD: usize = 8 + 8 + 1;

/// A single record in a bounded collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier (assigned by store).
    pub id: RecordId,

    /// When the record was stored.
    pub timestamp: Timestamp,

    /// Event name. Absent for bootstrap markers.
    pub event: Option<String>,

    /// Application-defined payload.
    pub payload: serde_json::Value,

    /// Synthetic record written to seed an empty collection.
    pub bootstrap_marker: bool,
}

impl Record {
    /// True if this record should be dispatched under its event name.
    pub fn is_message(&self) -> bool {
        !self.bootstrap_marker && self.event.as_deref().is_some_and(|e| !e.is_empty())
    }

    /// Size charged against a collection's byte capacity.
    pub fn approximate_size(&self) -> usize {
        let event = self.event.as_ref().map_or(0, String::len);
        let payload = serde_json::to_vec(&self.payload).map_or(0, |v| v.len());
        RECORD_OVERHEAD + event + payload
    }
}

/// Input for creating a new record (before id/timestamp assigned).
#[derive(Clone, Debug)]
pub struct RecordInput {
    pub event: Option<String>,
    pub payload: serde_json::Value,
    pub bootstrap_marker: bool,
}

impl RecordInput {
    /// A regular message under `event`.
    pub fn message(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: Some(event.into()),
            payload,
            bootstrap_marker: false,
        }
    }

    /// A message whose payload is any serializable value.
    pub fn json(event: impl Into<String>, payload: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self::message(event, serde_json::to_value(payload)?))
    }

    /// The synthetic first record of an empty collection.
    pub fn bootstrap_marker() -> Self {
        Self {
            event: None,
            payload: serde_json::Value::Null,
            bootstrap_marker: true,
        }
    }

    /// Stamp the input with its store-assigned id.
    pub fn into_record(self, id: RecordId) -> Record {
        Record {
            id,
            timestamp: Timestamp::now(),
            event: self.event,
            payload: self.payload,
            bootstrap_marker: self.bootstrap_marker,
        }
    }
}
