//! Main store implementation.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, Transaction};
use time::OffsetDateTime;
use tracing::{debug, info};

use fieldnode_types::{
    DeviceUpsert, NarrowReading, NormalizedMessage, ReadingSet, ReadingShape, WideReading,
};

use crate::error::{Error, Result};
use crate::models::{HourlyAverage, IngestOutcome, ReadingValues, StoredDevice, StoredReading};
use crate::queries::ReadingQuery;
use crate::schema;

/// How long a connection waits on a lock held by another connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-based store for field telemetry.
///
/// A store is committed to one [`ReadingShape`] and keeps at most
/// `max_records` readings after every committed ingest.
pub struct Store {
    conn: Connection,
    shape: ReadingShape,
    max_records: u64,
    last_recorded_at: i64,
}

impl Store {
    /// Open or create a database at the given path.
    ///
    /// Returns [`Error::ShapeMismatch`] if the database was created with a
    /// different shape.
    pub fn open<P: AsRef<Path>>(path: P, shape: ReadingShape, max_records: u64) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directories if needed
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // WAL lets query connections read while the ingest connection writes
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        Self::with_connection(conn, shape, max_records)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory(shape: ReadingShape, max_records: u64) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, shape, max_records)
    }

    fn with_connection(conn: Connection, shape: ReadingShape, max_records: u64) -> Result<Self> {
        schema::initialize(&conn, shape)?;

        let last_recorded_at: Option<i64> =
            conn.query_row("SELECT MAX(recorded_at) FROM readings", [], |row| {
                row.get(0)
            })?;

        Ok(Self {
            conn,
            shape,
            max_records,
            last_recorded_at: last_recorded_at.unwrap_or(i64::MIN),
        })
    }

    /// The reading shape this store is committed to.
    pub fn shape(&self) -> ReadingShape {
        self.shape
    }

    /// The retention ceiling.
    pub fn max_records(&self) -> u64 {
        self.max_records
    }
}

// Ingest and retention
impl Store {
    /// Apply one normalized message, stamped with the current time.
    ///
    /// The timestamp is clamped so it never precedes one already assigned by
    /// this store. Device upsert, reading inserts and retention pruning run in
    /// one transaction; on error nothing is committed.
    pub fn ingest(&mut self, message: &NormalizedMessage) -> Result<IngestOutcome> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let recorded_at = now.max(self.last_recorded_at);
        let recorded_at = OffsetDateTime::from_unix_timestamp(recorded_at)
            .map_err(|e| Error::InvalidTimestamp(e.to_string()))?;
        self.ingest_at(message, recorded_at)
    }

    /// Apply one normalized message with an explicit `recorded_at`.
    ///
    /// Used for replay and tests. No clamping is applied; sub-second
    /// precision is dropped.
    pub fn ingest_at(
        &mut self,
        message: &NormalizedMessage,
        recorded_at: OffsetDateTime,
    ) -> Result<IngestOutcome> {
        let requested = message.readings.shape();
        if requested != self.shape {
            return Err(Error::ShapeMismatch {
                stored: self.shape,
                requested,
            });
        }

        // Stored at second resolution
        let ts = recorded_at.unix_timestamp();
        let recorded_at = OffsetDateTime::from_unix_timestamp(ts)
            .map_err(|e| Error::InvalidTimestamp(e.to_string()))?;
        let sensor_config = message
            .device
            .sensor_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let tx = self.conn.transaction()?;
        upsert_device(&tx, &message.device, sensor_config.as_deref(), ts)?;
        let inserted = insert_readings(&tx, &message.device.device_id, &message.readings, ts)?;
        let pruned = prune_oldest(&tx, self.max_records)?;
        tx.commit()?;

        self.last_recorded_at = self.last_recorded_at.max(ts);

        debug!(
            "Ingested {} reading(s) from {} at {} (pruned {})",
            inserted, message.device.device_id, ts, pruned
        );

        Ok(IngestOutcome {
            recorded_at,
            inserted,
            pruned,
        })
    }

    /// Enforce the retention ceiling outside of an ingest.
    ///
    /// Returns the number of rows deleted.
    pub fn prune(&mut self) -> Result<u64> {
        let tx = self.conn.transaction()?;
        let pruned = prune_oldest(&tx, self.max_records)?;
        tx.commit()?;

        if pruned > 0 {
            info!(
                "Pruned {} reading(s) to honor max_records = {}",
                pruned, self.max_records
            );
        }
        Ok(pruned)
    }
}

fn upsert_device(
    tx: &Transaction<'_>,
    device: &DeviceUpsert,
    sensor_config: Option<&str>,
    last_seen: i64,
) -> Result<()> {
    tx.execute(
        "INSERT INTO devices (device_id, device_name, location, last_seen, sensor_config)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(device_id) DO UPDATE SET
            device_name = excluded.device_name,
            location = excluded.location,
            last_seen = excluded.last_seen,
            sensor_config = excluded.sensor_config",
        rusqlite::params![
            device.device_id,
            device.device_name,
            device.location,
            last_seen,
            sensor_config,
        ],
    )?;
    Ok(())
}

fn insert_readings(
    tx: &Transaction<'_>,
    device_id: &str,
    readings: &ReadingSet,
    recorded_at: i64,
) -> Result<usize> {
    match readings {
        ReadingSet::Wide(r) => {
            tx.execute(
                "INSERT INTO readings (device_id, air_temp, humidity, soil_temp_10cm,
                 soil_temp_30cm, ph, air_quality, water_temp, water_ph, water_turbidity,
                 water_tds, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    device_id,
                    r.air_temp,
                    r.humidity,
                    r.soil_temp_10cm,
                    r.soil_temp_30cm,
                    r.ph,
                    r.air_quality,
                    r.water_temp,
                    r.water_ph,
                    r.water_turbidity,
                    r.water_tds,
                    recorded_at,
                ],
            )?;
            Ok(1)
        }
        ReadingSet::Narrow(entries) => {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO readings (device_id, sensor_type, sensor_value, sensor_units,
                 recorded_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for entry in entries {
                stmt.execute(rusqlite::params![
                    device_id,
                    entry.sensor_type,
                    entry.value,
                    entry.units,
                    recorded_at,
                ])?;
            }
            Ok(entries.len())
        }
    }
}

/// Delete the oldest rows beyond `max_records`.
fn prune_oldest(tx: &Transaction<'_>, max_records: u64) -> Result<u64> {
    let count: i64 = tx.query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))?;
    let excess = (count as u64).saturating_sub(max_records);
    if excess == 0 {
        return Ok(0);
    }

    let deleted = tx.execute(
        "DELETE FROM readings WHERE id IN (
            SELECT id FROM readings ORDER BY recorded_at ASC, id ASC LIMIT ?1
         )",
        [excess as i64],
    )?;

    Ok(deleted as u64)
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let ts: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp(ts).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Integer, Box::new(e))
    })
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| {
            serde_json::from_str(&s).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
            })
        })
        .transpose()
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<StoredDevice> {
    Ok(StoredDevice {
        id: row.get(0)?,
        name: row.get(1)?,
        location: row.get(2)?,
        last_seen: timestamp(row, 3)?,
        sensor_config: json_column(row, 4)?,
    })
}

fn wide_from_row(row: &Row<'_>) -> rusqlite::Result<StoredReading> {
    Ok(StoredReading {
        id: row.get(0)?,
        device_id: row.get(1)?,
        recorded_at: timestamp(row, 2)?,
        values: ReadingValues::Wide(WideReading {
            air_temp: row.get(3)?,
            humidity: row.get(4)?,
            soil_temp_10cm: row.get(5)?,
            soil_temp_30cm: row.get(6)?,
            ph: row.get(7)?,
            air_quality: row.get(8)?,
            water_temp: row.get(9)?,
            water_ph: row.get(10)?,
            water_turbidity: row.get(11)?,
            water_tds: row.get(12)?,
        }),
    })
}

fn narrow_from_row(row: &Row<'_>) -> rusqlite::Result<StoredReading> {
    Ok(StoredReading {
        id: row.get(0)?,
        device_id: row.get(1)?,
        recorded_at: timestamp(row, 2)?,
        values: ReadingValues::Narrow(NarrowReading {
            sensor_type: row.get(3)?,
            value: row.get(4)?,
            units: row.get(5)?,
        }),
    })
}

// Device operations
impl Store {
    /// Get a device by ID.
    pub fn get_device(&self, device_id: &str) -> Result<Option<StoredDevice>> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, device_name, location, last_seen, sensor_config
             FROM devices WHERE device_id = ?",
        )?;

        let device = stmt.query_row([device_id], device_from_row).optional()?;

        Ok(device)
    }

    /// List all devices, most recently seen first.
    pub fn list_devices(&self) -> Result<Vec<StoredDevice>> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, device_name, location, last_seen, sensor_config
             FROM devices ORDER BY last_seen DESC, device_id ASC",
        )?;

        let devices = stmt
            .query_map([], device_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(devices)
    }
}

// Query operations
impl Store {
    /// Query readings with filters, newest first.
    pub fn query_readings(&self, query: &ReadingQuery) -> Result<Vec<StoredReading>> {
        let (sql, params) = query.build_sql(self.shape, OffsetDateTime::now_utc())?;

        debug!("Executing query: {}", sql);

        let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let from_row: fn(&Row<'_>) -> rusqlite::Result<StoredReading> = match self.shape {
            ReadingShape::Wide => wide_from_row,
            ReadingShape::Narrow => narrow_from_row,
        };

        let mut stmt = self.conn.prepare(&sql)?;
        let readings = stmt
            .query_map(params_ref.as_slice(), from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(readings)
    }

    /// Hourly means per sensor type, buckets in ascending order.
    ///
    /// The query's `limit` does not apply.
    pub fn hourly_averages(
        &self,
        query: &ReadingQuery,
    ) -> Result<BTreeMap<String, Vec<HourlyAverage>>> {
        let mut result: BTreeMap<String, Vec<HourlyAverage>> = BTreeMap::new();

        let Some((sql, params)) = query.build_hourly_sql(self.shape, OffsetDateTime::now_utc())
        else {
            return Ok(result);
        };

        debug!("Executing aggregation: {}", sql);

        let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_ref.as_slice(), |row| {
            Ok((
                row.get::<_, String>(0)?,
                HourlyAverage {
                    hour: row.get(1)?,
                    value: row.get(2)?,
                },
            ))
        })?;

        for row in rows {
            let (sensor_type, average) = row?;
            result.entry(sensor_type).or_default().push(average);
        }

        Ok(result)
    }

    /// Count readings, optionally for one device.
    pub fn count_readings(&self, device_id: Option<&str>) -> Result<u64> {
        let count: i64 = match device_id {
            Some(id) => self.conn.query_row(
                "SELECT COUNT(*) FROM readings WHERE device_id = ?",
                [id],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))?,
        };

        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldnode_types::{Normalizer, UNKNOWN_DEVICE_ID};
    use time::Duration as TimeDuration;
    use time::macros::datetime;

    fn wide_message(device_id: &str, air_temp: Option<f64>) -> NormalizedMessage {
        NormalizedMessage {
            device: DeviceUpsert::new(device_id),
            readings: ReadingSet::Wide(WideReading {
                air_temp,
                ..Default::default()
            }),
        }
    }

    fn narrow_message(device_id: &str, entries: &[(&str, f64)]) -> NormalizedMessage {
        NormalizedMessage {
            device: DeviceUpsert::new(device_id),
            readings: ReadingSet::Narrow(
                entries
                    .iter()
                    .map(|(sensor_type, value)| NarrowReading {
                        sensor_type: sensor_type.to_string(),
                        value: *value,
                        units: None,
                    })
                    .collect(),
            ),
        }
    }

    fn air_temps(readings: &[StoredReading]) -> Vec<Option<f64>> {
        readings
            .iter()
            .map(|r| match &r.values {
                ReadingValues::Wide(w) => w.air_temp,
                ReadingValues::Narrow(_) => panic!("expected wide"),
            })
            .collect()
    }

    #[test]
    fn test_open_in_memory() {
        let store = Store::open_in_memory(ReadingShape::Wide, 10).unwrap();
        assert!(store.list_devices().unwrap().is_empty());
        assert_eq!(store.count_readings(None).unwrap(), 0);
        assert_eq!(store.shape(), ReadingShape::Wide);
        assert_eq!(store.max_records(), 10);
    }

    // ==================== Round trip ====================

    #[test]
    fn test_wide_round_trip() {
        let mut store = Store::open_in_memory(ReadingShape::Wide, 100).unwrap();
        let normalizer = Normalizer::new(ReadingShape::Wide);
        let msg = normalizer
            .normalize(
                br#"{"device_id":"d1","air_temp":21.5,"humidity":55,"soil_temp_10cm":14.2,
                    "soil_temp_30cm":12.9,"ph":6.8,"air_quality":42}"#,
            )
            .unwrap();

        let outcome = store.ingest(&msg).unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.pruned, 0);

        let readings = store.query_readings(&ReadingQuery::new()).unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].device_id, "d1");
        assert_eq!(readings[0].recorded_at, outcome.recorded_at);
        let ReadingSet::Wide(expected) = msg.readings else {
            panic!("expected wide");
        };
        assert_eq!(readings[0].values, ReadingValues::Wide(expected));
    }

    #[test]
    fn test_wide_missing_columns_stored_as_null() {
        let mut store = Store::open_in_memory(ReadingShape::Wide, 100).unwrap();
        store.ingest(&wide_message("d1", None)).unwrap();

        let readings = store.query_readings(&ReadingQuery::new()).unwrap();
        assert_eq!(readings[0].values, ReadingValues::Wide(WideReading::default()));
    }

    #[test]
    fn test_narrow_round_trip_with_units() {
        let mut store = Store::open_in_memory(ReadingShape::Narrow, 100).unwrap();
        let msg = Normalizer::new(ReadingShape::Narrow)
            .normalize(br#"{"device_id":"d2","readings":{"temp":{"value":20,"units":"C"}}}"#)
            .unwrap();
        store.ingest(&msg).unwrap();

        let readings = store.query_readings(&ReadingQuery::new()).unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(
            readings[0].values,
            ReadingValues::Narrow(NarrowReading {
                sensor_type: "temp".to_string(),
                value: 20.0,
                units: Some("C".to_string()),
            })
        );
    }

    // ==================== Narrow expansion ====================

    #[test]
    fn test_narrow_expansion_shares_timestamp() {
        let mut store = Store::open_in_memory(ReadingShape::Narrow, 100).unwrap();
        let outcome = store
            .ingest(&narrow_message("d2", &[("temp", 20.0), ("humidity", 50.0)]))
            .unwrap();
        assert_eq!(outcome.inserted, 2);

        let readings = store.query_readings(&ReadingQuery::new()).unwrap();
        assert_eq!(readings.len(), 2);
        assert!(readings.iter().all(|r| r.device_id == "d2"));
        assert!(readings.iter().all(|r| r.recorded_at == outcome.recorded_at));
    }

    #[test]
    fn test_narrow_empty_message_still_upserts_device() {
        let mut store = Store::open_in_memory(ReadingShape::Narrow, 100).unwrap();
        let outcome = store.ingest(&narrow_message("d3", &[])).unwrap();
        assert_eq!(outcome.inserted, 0);
        assert_eq!(store.count_readings(None).unwrap(), 0);
        assert!(store.get_device("d3").unwrap().is_some());
    }

    // ==================== Retention ====================

    #[test]
    fn test_retention_ceiling_deletes_oldest() {
        let mut store = Store::open_in_memory(ReadingShape::Wide, 5).unwrap();
        let base = datetime!(2024-05-01 12:00 UTC);

        for i in 0..8 {
            let outcome = store
                .ingest_at(
                    &wide_message("d1", Some(i as f64)),
                    base + TimeDuration::minutes(i),
                )
                .unwrap();
            assert!(store.count_readings(None).unwrap() <= 5);
            assert_eq!(outcome.pruned, if i >= 5 { 1 } else { 0 });
        }

        let readings = store.query_readings(&ReadingQuery::new()).unwrap();
        assert_eq!(
            air_temps(&readings),
            vec![Some(7.0), Some(6.0), Some(5.0), Some(4.0), Some(3.0)]
        );
    }

    #[test]
    fn test_retention_same_timestamp_breaks_ties_by_id() {
        let mut store = Store::open_in_memory(ReadingShape::Wide, 2).unwrap();
        let at = datetime!(2024-05-01 12:00 UTC);

        for i in 0..3 {
            store.ingest_at(&wide_message("d1", Some(i as f64)), at).unwrap();
        }

        let readings = store.query_readings(&ReadingQuery::new()).unwrap();
        assert_eq!(air_temps(&readings), vec![Some(2.0), Some(1.0)]);
    }

    #[test]
    fn test_retention_batch_larger_than_ceiling() {
        let mut store = Store::open_in_memory(ReadingShape::Narrow, 3).unwrap();
        let outcome = store
            .ingest(&narrow_message(
                "d1",
                &[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0), ("e", 5.0)],
            ))
            .unwrap();

        assert_eq!(outcome.inserted, 5);
        assert_eq!(outcome.pruned, 2);
        assert_eq!(store.count_readings(None).unwrap(), 3);
    }

    #[test]
    fn test_standalone_prune_after_lowering_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");

        {
            let mut store = Store::open(&path, ReadingShape::Wide, 10).unwrap();
            for i in 0..10 {
                store.ingest(&wide_message("d1", Some(i as f64))).unwrap();
            }
        }

        let mut store = Store::open(&path, ReadingShape::Wide, 4).unwrap();
        assert_eq!(store.count_readings(None).unwrap(), 10);
        assert_eq!(store.prune().unwrap(), 6);
        assert_eq!(store.count_readings(None).unwrap(), 4);
        assert_eq!(store.prune().unwrap(), 0);
    }

    // ==================== Device upsert ====================

    #[test]
    fn test_device_upsert_idempotent() {
        let mut store = Store::open_in_memory(ReadingShape::Wide, 100).unwrap();
        let first = datetime!(2024-05-01 12:00 UTC);
        let second = datetime!(2024-05-01 13:00 UTC);

        let mut msg = wide_message("d1", Some(20.0));
        msg.device.device_name = Some("North bed".to_string());
        msg.device.location = Some("plot 4".to_string());
        store.ingest_at(&msg, first).unwrap();

        let mut msg = wide_message("d1", Some(21.0));
        msg.device.device_name = Some("North bed (moved)".to_string());
        store.ingest_at(&msg, second).unwrap();

        let devices = store.list_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "d1");
        assert_eq!(devices[0].name.as_deref(), Some("North bed (moved)"));
        // Replace-on-write: an absent field clears the stored value
        assert_eq!(devices[0].location, None);
        assert_eq!(devices[0].last_seen, second);
        assert_eq!(store.count_readings(Some("d1")).unwrap(), 2);
    }

    #[test]
    fn test_device_sensor_config_round_trip() {
        let mut store = Store::open_in_memory(ReadingShape::Narrow, 100).unwrap();
        let mut msg = narrow_message("d2", &[("temp", 20.0)]);
        msg.device.sensor_config = Some(serde_json::json!({"temp": {"model": "DS18B20"}}));
        store.ingest(&msg).unwrap();

        let device = store.get_device("d2").unwrap().unwrap();
        assert_eq!(
            device.sensor_config,
            Some(serde_json::json!({"temp": {"model": "DS18B20"}}))
        );
        assert!(store.get_device("missing").unwrap().is_none());
    }

    #[test]
    fn test_unknown_device_is_registered() {
        let mut store = Store::open_in_memory(ReadingShape::Wide, 100).unwrap();
        let msg = Normalizer::new(ReadingShape::Wide)
            .normalize(br#"{"air_temp":18}"#)
            .unwrap();
        store.ingest(&msg).unwrap();
        assert!(store.get_device(UNKNOWN_DEVICE_ID).unwrap().is_some());
    }

    // ==================== Timestamps ====================

    #[test]
    fn test_recorded_at_is_clamped_monotonic() {
        let mut store = Store::open_in_memory(ReadingShape::Wide, 100).unwrap();
        let future = OffsetDateTime::now_utc() + TimeDuration::hours(2);
        store.ingest_at(&wide_message("d1", None), future).unwrap();

        let outcome = store.ingest(&wide_message("d1", None)).unwrap();
        assert!(outcome.recorded_at >= future.replace_nanosecond(0).unwrap());
    }

    #[test]
    fn test_clamp_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.db");
        let future = OffsetDateTime::now_utc() + TimeDuration::hours(2);

        {
            let mut store = Store::open(&path, ReadingShape::Wide, 100).unwrap();
            store.ingest_at(&wide_message("d1", None), future).unwrap();
        }

        let mut store = Store::open(&path, ReadingShape::Wide, 100).unwrap();
        let outcome = store.ingest(&wide_message("d1", None)).unwrap();
        assert_eq!(outcome.recorded_at.unix_timestamp(), future.unix_timestamp());
    }

    // ==================== Shapes ====================

    #[test]
    fn test_reopen_with_other_shape_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        drop(Store::open(&path, ReadingShape::Narrow, 100).unwrap());

        let err = Store::open(&path, ReadingShape::Wide, 100).err().unwrap();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_ingest_rejects_other_shape_without_side_effects() {
        let mut store = Store::open_in_memory(ReadingShape::Wide, 100).unwrap();
        let err = store
            .ingest(&narrow_message("d1", &[("temp", 20.0)]))
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
        assert!(store.list_devices().unwrap().is_empty());
        assert_eq!(store.count_readings(None).unwrap(), 0);
    }

    // ==================== Query filters ====================

    #[test]
    fn test_query_filters() {
        let mut store = Store::open_in_memory(ReadingShape::Narrow, 1000).unwrap();
        let now = OffsetDateTime::now_utc();

        store
            .ingest_at(&narrow_message("d1", &[("temp", 10.0)]), now - TimeDuration::hours(3))
            .unwrap();
        store
            .ingest_at(
                &narrow_message("d1", &[("temp", 11.0), ("humidity", 40.0)]),
                now - TimeDuration::minutes(30),
            )
            .unwrap();
        store
            .ingest_at(&narrow_message("d2", &[("temp", 12.0)]), now - TimeDuration::minutes(10))
            .unwrap();

        let all = store.query_readings(&ReadingQuery::new()).unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|w| w[0].recorded_at >= w[1].recorded_at));

        let d1 = store.query_readings(&ReadingQuery::new().device("d1")).unwrap();
        assert_eq!(d1.len(), 3);
        assert!(d1.iter().all(|r| r.device_id == "d1"));

        let temp = store
            .query_readings(&ReadingQuery::new().sensor_type("temp"))
            .unwrap();
        assert_eq!(temp.len(), 3);

        let recent = store.query_readings(&ReadingQuery::new().hours(1)).unwrap();
        assert_eq!(recent.len(), 3);
        assert!(recent.iter().all(|r| r.recorded_at > now - TimeDuration::hours(1)));

        let combined = store
            .query_readings(&ReadingQuery::new().device("d1").sensor_type("temp").hours(1))
            .unwrap();
        assert_eq!(combined.len(), 1);

        let limited = store.query_readings(&ReadingQuery::new().limit(2)).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].device_id, "d2");
    }

    #[test]
    fn test_hours_window_ignores_insertion_order() {
        let mut store = Store::open_in_memory(ReadingShape::Wide, 1000).unwrap();

        // Recent row first, then a backfilled one from three hours ago
        store.ingest(&wide_message("d1", Some(25.0))).unwrap();
        store
            .ingest_at(
                &wide_message("d1", Some(5.0)),
                OffsetDateTime::now_utc() - TimeDuration::hours(3),
            )
            .unwrap();
        assert_eq!(store.count_readings(None).unwrap(), 2);

        let recent = store.query_readings(&ReadingQuery::new().hours(1)).unwrap();
        assert_eq!(air_temps(&recent), vec![Some(25.0)]);

        let all = store.query_readings(&ReadingQuery::new()).unwrap();
        assert_eq!(air_temps(&all), vec![Some(25.0), Some(5.0)]);
    }

    #[test]
    fn test_query_default_limit() {
        let mut store = Store::open_in_memory(ReadingShape::Wide, 1000).unwrap();
        for _ in 0..120 {
            store.ingest(&wide_message("d1", Some(1.0))).unwrap();
        }
        let readings = store.query_readings(&ReadingQuery::new()).unwrap();
        assert_eq!(readings.len(), 100);
    }

    #[test]
    fn test_sensor_type_filter_on_wide_store_is_unsupported() {
        let store = Store::open_in_memory(ReadingShape::Wide, 100).unwrap();
        let err = store
            .query_readings(&ReadingQuery::new().sensor_type("air_temp"))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFilter(_)));
    }

    // ==================== Hourly aggregation ====================

    #[test]
    fn test_hourly_averages_narrow() {
        let mut store = Store::open_in_memory(ReadingShape::Narrow, 1000).unwrap();
        let h = datetime!(2024-05-01 10:00 UTC);

        store
            .ingest_at(&narrow_message("d1", &[("temp", 10.0), ("humidity", 40.0)]), h + TimeDuration::minutes(5))
            .unwrap();
        store
            .ingest_at(&narrow_message("d1", &[("temp", 20.0)]), h + TimeDuration::minutes(50))
            .unwrap();
        store
            .ingest_at(&narrow_message("d1", &[("temp", 30.0)]), h + TimeDuration::minutes(65))
            .unwrap();

        let hourly = store.hourly_averages(&ReadingQuery::new()).unwrap();
        assert_eq!(
            hourly["temp"],
            vec![
                HourlyAverage {
                    hour: "2024-05-01 10:00".to_string(),
                    value: 15.0,
                },
                HourlyAverage {
                    hour: "2024-05-01 11:00".to_string(),
                    value: 30.0,
                },
            ]
        );
        assert_eq!(hourly["humidity"].len(), 1);

        let temp_only = store
            .hourly_averages(&ReadingQuery::new().sensor_type("temp"))
            .unwrap();
        assert_eq!(temp_only.keys().collect::<Vec<_>>(), vec!["temp"]);
    }

    #[test]
    fn test_hourly_averages_wide_per_column() {
        let mut store = Store::open_in_memory(ReadingShape::Wide, 1000).unwrap();
        let h = datetime!(2024-05-01 10:00 UTC);

        let mut msg = wide_message("d1", Some(10.0));
        if let ReadingSet::Wide(ref mut w) = msg.readings {
            w.humidity = Some(50.0);
        }
        store.ingest_at(&msg, h).unwrap();
        store
            .ingest_at(&wide_message("d1", Some(20.0)), h + TimeDuration::minutes(30))
            .unwrap();
        store
            .ingest_at(&wide_message("d2", Some(100.0)), h + TimeDuration::minutes(30))
            .unwrap();

        let hourly = store.hourly_averages(&ReadingQuery::new().device("d1")).unwrap();
        assert_eq!(hourly.len(), 2);
        assert_eq!(hourly["air_temp"][0].value, 15.0);
        assert_eq!(hourly["humidity"][0].value, 50.0);
        assert!(!hourly.contains_key("ph"));

        let unknown = store
            .hourly_averages(&ReadingQuery::new().sensor_type("co2"))
            .unwrap();
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_hourly_averages_respect_hours_window() {
        let mut store = Store::open_in_memory(ReadingShape::Narrow, 1000).unwrap();
        let now = OffsetDateTime::now_utc();
        store
            .ingest_at(&narrow_message("d1", &[("temp", 1.0)]), now - TimeDuration::hours(5))
            .unwrap();
        store
            .ingest_at(&narrow_message("d1", &[("temp", 2.0)]), now)
            .unwrap();

        let hourly = store.hourly_averages(&ReadingQuery::new().hours(2)).unwrap();
        assert_eq!(hourly["temp"].len(), 1);
        assert_eq!(hourly["temp"][0].value, 2.0);
    }
}
