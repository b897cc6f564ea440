//! Data models for stored data.

use serde::Serialize;
use time::OffsetDateTime;

use fieldnode_types::{NarrowReading, WideReading};

/// A device stored in the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredDevice {
    /// Device identifier.
    pub id: String,
    /// Device name.
    pub name: Option<String>,
    /// Free-form location label.
    pub location: Option<String>,
    /// When the last message from this device was persisted.
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    /// Opaque sensor description from the newest message.
    pub sensor_config: Option<serde_json::Value>,
}

/// Shape-specific values of a stored reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReadingValues {
    /// Wide row: all columns, nullable.
    Wide(WideReading),
    /// Narrow row: one sensor value.
    Narrow(NarrowReading),
}

/// A reading stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredReading {
    /// Database row ID.
    pub id: i64,
    /// Device identifier.
    pub device_id: String,
    /// When the reading was persisted.
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    /// Measured values.
    #[serde(flatten)]
    pub values: ReadingValues,
}

/// Mean of one sensor over one hour bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyAverage {
    /// Bucket start, formatted `YYYY-MM-DD HH:00` (UTC).
    pub hour: String,
    /// Arithmetic mean of the readings in the bucket.
    pub value: f64,
}

/// Result of applying one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Timestamp assigned to every row of the message.
    pub recorded_at: OffsetDateTime,
    /// Number of reading rows inserted.
    pub inserted: usize,
    /// Number of old rows deleted by retention.
    pub pruned: u64,
}
