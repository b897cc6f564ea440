//! Query builder for readings.
//!
//! [`ReadingQuery`] drives both the flat listing
//! ([`Store::query_readings`](crate::Store::query_readings)) and the hourly
//! aggregation ([`Store::hourly_averages`](crate::Store::hourly_averages)).
//! All values are bound as SQL parameters; the only text spliced into SQL is
//! drawn from the fixed wide column list.
//!
//! # Example
//!
//! ```
//! use fieldnode_store::{ReadingQuery, Store};
//! use fieldnode_types::ReadingShape;
//!
//! let store = Store::open_in_memory(ReadingShape::Narrow, 1000)?;
//!
//! // Last 24 hours of temperature readings from one device
//! let query = ReadingQuery::new()
//!     .device("greenhouse-1")
//!     .sensor_type("temp")
//!     .hours(24)
//!     .limit(50);
//!
//! let readings = store.query_readings(&query)?;
//! let hourly = store.hourly_averages(&query)?;
//! # Ok::<(), fieldnode_store::Error>(())
//! ```

use fieldnode_types::{ReadingShape, WIDE_COLUMNS};
use time::OffsetDateTime;

use crate::error::{Error, Result};

/// Number of rows returned when no limit is given.
pub const DEFAULT_LIMIT: u32 = 100;

const WIDE_SELECT: &str = "SELECT id, device_id, recorded_at, air_temp, humidity, \
     soil_temp_10cm, soil_temp_30cm, ph, air_quality, water_temp, water_ph, \
     water_turbidity, water_tds FROM readings";

const NARROW_SELECT: &str =
    "SELECT id, device_id, recorded_at, sensor_type, sensor_value, sensor_units FROM readings";

const HOUR_BUCKET: &str = "strftime('%Y-%m-%d %H:00', recorded_at, 'unixepoch')";

/// Fluent query builder for readings.
///
/// Results are always ordered newest first by `recorded_at`, ties broken by
/// insertion order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadingQuery {
    /// Filter by device ID.
    pub device_id: Option<String>,
    /// Filter by sensor type.
    pub sensor_type: Option<String>,
    /// Only rows recorded within the trailing window of this many hours.
    pub hours: Option<u32>,
    /// Maximum number of rows for listings ([`DEFAULT_LIMIT`] when unset).
    pub limit: Option<u32>,
}

impl ReadingQuery {
    /// Create a query with no filters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by device ID.
    pub fn device(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self
    }

    /// Filter by sensor type.
    ///
    /// Listings support this on narrow stores only. Aggregation supports it
    /// on both shapes; for wide stores the sensor type is a column name.
    pub fn sensor_type(mut self, sensor_type: &str) -> Self {
        self.sensor_type = Some(sensor_type.to_string());
        self
    }

    /// Restrict to rows recorded strictly after `now - hours`.
    pub fn hours(mut self, hours: u32) -> Self {
        self.hours = Some(hours);
        self
    }

    /// Limit the maximum number of rows returned by a listing.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The effective listing limit.
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }

    /// Build the SQL WHERE conditions and parameters shared by every query.
    ///
    /// The sensor type condition is left to the caller since its meaning
    /// depends on the shape.
    fn base_conditions(&self, now: OffsetDateTime) -> (Vec<String>, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref device_id) = self.device_id {
            conditions.push("device_id = ?".to_string());
            params.push(Box::new(device_id.clone()));
        }

        if let Some(hours) = self.hours {
            let cutoff = now.unix_timestamp() - i64::from(hours) * 3600;
            conditions.push("recorded_at > ?".to_string());
            params.push(Box::new(cutoff));
        }

        (conditions, params)
    }

    /// Build the SQL WHERE clause and parameters for a listing.
    pub(crate) fn build_where(
        &self,
        shape: ReadingShape,
        now: OffsetDateTime,
    ) -> Result<(String, Vec<Box<dyn rusqlite::ToSql>>)> {
        let (mut conditions, mut params) = self.base_conditions(now);

        if let Some(ref sensor_type) = self.sensor_type {
            if shape == ReadingShape::Wide {
                return Err(Error::UnsupportedFilter(
                    "sensor_type is only supported on narrow stores".to_string(),
                ));
            }
            conditions.push("sensor_type = ?".to_string());
            params.push(Box::new(sensor_type.clone()));
        }

        Ok((where_clause(&conditions), params))
    }

    /// Build the full listing SQL and its parameters.
    pub(crate) fn build_sql(
        &self,
        shape: ReadingShape,
        now: OffsetDateTime,
    ) -> Result<(String, Vec<Box<dyn rusqlite::ToSql>>)> {
        let (where_clause, params) = self.build_where(shape, now)?;
        let select = match shape {
            ReadingShape::Wide => WIDE_SELECT,
            ReadingShape::Narrow => NARROW_SELECT,
        };

        let sql = format!(
            "{} {} ORDER BY recorded_at DESC, id DESC LIMIT {}",
            select,
            where_clause,
            self.effective_limit()
        );

        Ok((sql, params))
    }

    /// Build the hourly aggregation SQL and its parameters.
    ///
    /// Every row of the result is `(sensor_type, hour, value)`, ordered by
    /// hour ascending. Returns `None` when the filter cannot match anything
    /// (a wide store asked for an unknown column).
    pub(crate) fn build_hourly_sql(
        &self,
        shape: ReadingShape,
        now: OffsetDateTime,
    ) -> Option<(String, Vec<Box<dyn rusqlite::ToSql>>)> {
        match shape {
            ReadingShape::Narrow => {
                let (mut conditions, mut params) = self.base_conditions(now);
                if let Some(ref sensor_type) = self.sensor_type {
                    conditions.push("sensor_type = ?".to_string());
                    params.push(Box::new(sensor_type.clone()));
                }
                let sql = format!(
                    "SELECT sensor_type, {HOUR_BUCKET} AS hour, AVG(sensor_value) \
                     FROM readings {} GROUP BY sensor_type, hour \
                     ORDER BY hour ASC, sensor_type ASC",
                    where_clause(&conditions)
                );
                Some((sql, params))
            }
            ReadingShape::Wide => {
                let columns: Vec<&str> = WIDE_COLUMNS
                    .iter()
                    .copied()
                    .filter(|c| self.sensor_type.as_deref().is_none_or(|s| s == *c))
                    .collect();
                if columns.is_empty() {
                    return None;
                }

                let mut parts = Vec::with_capacity(columns.len());
                let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
                for column in columns {
                    let (mut conditions, column_params) = self.base_conditions(now);
                    conditions.push(format!("{column} IS NOT NULL"));
                    params.extend(column_params);
                    parts.push(format!(
                        "SELECT '{column}' AS sensor_type, {HOUR_BUCKET} AS hour, \
                         AVG({column}) AS value FROM readings {} GROUP BY hour",
                        where_clause(&conditions)
                    ));
                }

                let sql = format!(
                    "SELECT sensor_type, hour, value FROM ({}) ORDER BY hour ASC, sensor_type ASC",
                    parts.join(" UNION ALL ")
                );
                Some((sql, params))
            }
        }
    }
}

fn where_clause(conditions: &[String]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    }
}
