//! Core types for field telemetry.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Sentinel device identifier used when a message carries no usable `device_id`.
pub const UNKNOWN_DEVICE_ID: &str = "unknown";

/// How readings are laid out in a store.
///
/// A deployment commits to exactly one shape for the lifetime of its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingShape {
    /// One row per message with fixed, nullable columns.
    #[default]
    Wide,
    /// One row per `(sensor_type, value, units)` entry of a message.
    Narrow,
}

impl ReadingShape {
    /// Stable lowercase name, as stored in the database and config files.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingShape::Wide => "wide",
            ReadingShape::Narrow => "narrow",
        }
    }
}

impl fmt::Display for ReadingShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadingShape {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wide" => Ok(ReadingShape::Wide),
            "narrow" => Ok(ReadingShape::Narrow),
            other => Err(ParseError::UnknownShape(other.to_string())),
        }
    }
}

/// Column names of a wide reading, in storage order.
///
/// These double as the sensor type names used when wide readings are
/// aggregated per sensor.
pub const WIDE_COLUMNS: [&str; 10] = [
    "air_temp",
    "humidity",
    "soil_temp_10cm",
    "soil_temp_30cm",
    "ph",
    "air_quality",
    "water_temp",
    "water_ph",
    "water_turbidity",
    "water_tds",
];

/// A single wide-shape reading. Every column is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WideReading {
    /// Air temperature in degrees Celsius.
    pub air_temp: Option<f64>,
    /// Relative humidity in percent.
    pub humidity: Option<f64>,
    /// Soil temperature at 10 cm depth.
    pub soil_temp_10cm: Option<f64>,
    /// Soil temperature at 30 cm depth.
    pub soil_temp_30cm: Option<f64>,
    /// Soil pH.
    pub ph: Option<f64>,
    /// Air quality index.
    pub air_quality: Option<i64>,
    /// Water temperature (water-quality extension).
    pub water_temp: Option<f64>,
    /// Water pH (water-quality extension).
    pub water_ph: Option<f64>,
    /// Water turbidity (water-quality extension).
    pub water_turbidity: Option<f64>,
    /// Total dissolved solids (water-quality extension).
    pub water_tds: Option<f64>,
}

impl WideReading {
    /// Returns true when no column carries a value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values().iter().all(|(_, v)| v.is_none())
    }

    /// Column values paired with their names, in [`WIDE_COLUMNS`] order.
    #[must_use]
    pub fn values(&self) -> [(&'static str, Option<f64>); 10] {
        [
            ("air_temp", self.air_temp),
            ("humidity", self.humidity),
            ("soil_temp_10cm", self.soil_temp_10cm),
            ("soil_temp_30cm", self.soil_temp_30cm),
            ("ph", self.ph),
            ("air_quality", self.air_quality.map(|v| v as f64)),
            ("water_temp", self.water_temp),
            ("water_ph", self.water_ph),
            ("water_turbidity", self.water_turbidity),
            ("water_tds", self.water_tds),
        ]
    }
}

/// A single narrow-shape reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrowReading {
    /// Sensor type, e.g. `temp` or `humidity`.
    pub sensor_type: String,
    /// Measured value.
    pub value: f64,
    /// Unit label as reported by the device.
    pub units: Option<String>,
}

/// The readings derived from one message, tagged by shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "shape", content = "readings", rename_all = "lowercase")]
pub enum ReadingSet {
    /// Exactly one wide row.
    Wide(WideReading),
    /// Zero or more narrow rows.
    Narrow(Vec<NarrowReading>),
}

impl ReadingSet {
    /// The shape of this reading set.
    #[must_use]
    pub fn shape(&self) -> ReadingShape {
        match self {
            ReadingSet::Wide(_) => ReadingShape::Wide,
            ReadingSet::Narrow(_) => ReadingShape::Narrow,
        }
    }

    /// Number of rows this set expands into.
    #[must_use]
    pub fn row_count(&self) -> usize {
        match self {
            ReadingSet::Wide(_) => 1,
            ReadingSet::Narrow(readings) => readings.len(),
        }
    }
}

/// Device registry update carried by every message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceUpsert {
    /// Device identifier (`"unknown"` for anonymous devices).
    pub device_id: String,
    /// Human-readable device name.
    pub device_name: Option<String>,
    /// Free-form location label.
    pub location: Option<String>,
    /// Opaque description of the device's sensor set.
    pub sensor_config: Option<serde_json::Value>,
}

impl DeviceUpsert {
    /// Create an upsert carrying only the identifier.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: None,
            location: None,
            sensor_config: None,
        }
    }

    /// Returns true when the message did not identify its device.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.device_id == UNKNOWN_DEVICE_ID
    }
}

/// The normalized form of one bus message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedMessage {
    /// Device registry update.
    pub device: DeviceUpsert,
    /// Derived readings.
    pub readings: ReadingSet,
}
