//! Database schema and migrations.
//!
//! The readings table takes one of two layouts depending on the
//! [`ReadingShape`] the store was created with. The shape is recorded in
//! `store_meta` and checked on every open.

use rusqlite::{Connection, OptionalExtension};

use fieldnode_types::ReadingShape;

use crate::error::{Error, Result};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema for the given shape.
///
/// A fresh database is created with `shape`. An existing database must
/// already be committed to `shape`, otherwise [`Error::ShapeMismatch`] is
/// returned and nothing is modified.
pub fn initialize(conn: &Connection, shape: ReadingShape) -> Result<()> {
    let version = get_schema_version(conn)?;

    if version == 0 {
        // Fresh database - create all tables
        create_schema_v1(conn, shape)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        return Ok(());
    }

    let stored = stored_shape(conn)?.unwrap_or_default();
    if stored != shape {
        return Err(Error::ShapeMismatch {
            stored,
            requested: shape,
        });
    }

    if version < SCHEMA_VERSION {
        migrate(conn, version)?;
    }

    Ok(())
}

/// Read the shape recorded in `store_meta`, if any.
pub fn stored_shape(conn: &Connection) -> Result<Option<ReadingShape>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = 'shape'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    value
        .map(|v| {
            v.parse::<ReadingShape>().map_err(|e| {
                Error::Database(rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                ))
            })
        })
        .transpose()
}

/// Get the current schema version.
fn get_schema_version(conn: &Connection) -> Result<i32> {
    // Check if the schema_version table exists
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 =
        conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))?;

    Ok(version)
}

/// Set the schema version.
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?)",
        [version],
    )?;
    Ok(())
}

/// Create the initial schema (version 1).
fn create_schema_v1(conn: &Connection, shape: ReadingShape) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Device registry, upserted by every message
        CREATE TABLE IF NOT EXISTS devices (
            device_id TEXT PRIMARY KEY,
            device_name TEXT,
            location TEXT,
            last_seen INTEGER NOT NULL,
            sensor_config TEXT
        );
        "#,
    )?;

    // readings.device_id is not a foreign key; readings may land before their device row.
    match shape {
        ReadingShape::Wide => conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                air_temp REAL,
                humidity REAL,
                soil_temp_10cm REAL,
                soil_temp_30cm REAL,
                ph REAL,
                air_quality INTEGER,
                water_temp REAL,
                water_ph REAL,
                water_turbidity REAL,
                water_tds REAL,
                recorded_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_readings_device
                ON readings(device_id);
            "#,
        )?,
        ReadingShape::Narrow => conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                sensor_type TEXT NOT NULL,
                sensor_value REAL NOT NULL,
                sensor_units TEXT,
                recorded_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_readings_device_sensor
                ON readings(device_id, sensor_type);
            "#,
        )?,
    }

    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_readings_recorded ON readings(recorded_at, id);",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO store_meta (key, value) VALUES ('shape', ?1)",
        [shape.as_str()],
    )?;

    Ok(())
}

/// Run migrations from old_version to current.
fn migrate(conn: &Connection, old_version: i32) -> Result<()> {
    // Add future migrations here
    // if old_version < 2 { migrate_to_v2(conn)?; }

    let _ = old_version;
    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_columns(conn: &Connection, table: &str) -> Vec<String> {
        conn.prepare(&format!("PRAGMA table_info({table})"))
            .unwrap()
            .query_map([], |row| row.get(1))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_initialize_fresh_wide_database() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn, ReadingShape::Wide).unwrap();

        // Verify tables exist
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"devices".to_string()));
        assert!(tables.contains(&"readings".to_string()));
        assert!(tables.contains(&"store_meta".to_string()));
        assert!(tables.contains(&"schema_version".to_string()));

        let columns = table_columns(&conn, "readings");
        for column in fieldnode_types::WIDE_COLUMNS {
            assert!(columns.contains(&column.to_string()), "missing {column}");
        }
        assert!(!columns.contains(&"sensor_type".to_string()));
    }

    #[test]
    fn test_initialize_fresh_narrow_database() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn, ReadingShape::Narrow).unwrap();

        let columns = table_columns(&conn, "readings");
        assert!(columns.contains(&"sensor_type".to_string()));
        assert!(columns.contains(&"sensor_value".to_string()));
        assert!(columns.contains(&"sensor_units".to_string()));
        assert!(!columns.contains(&"air_temp".to_string()));
        assert_eq!(stored_shape(&conn).unwrap(), Some(ReadingShape::Narrow));
    }

    #[test]
    fn test_schema_version_tracking() {
        let conn = Connection::open_in_memory().unwrap();

        // Fresh database should have version 0
        assert_eq!(get_schema_version(&conn).unwrap(), 0);

        // After initialization, should have current version
        initialize(&conn, ReadingShape::Wide).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);

        // Re-initializing with the same shape is a no-op
        initialize(&conn, ReadingShape::Wide).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_reinitialize_with_other_shape_fails() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn, ReadingShape::Wide).unwrap();

        let err = initialize(&conn, ReadingShape::Narrow).unwrap_err();
        assert!(matches!(
            err,
            Error::ShapeMismatch {
                stored: ReadingShape::Wide,
                requested: ReadingShape::Narrow,
            }
        ));
    }

    #[test]
    fn test_indexes_created() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn, ReadingShape::Narrow).unwrap();

        let indexes: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='index' AND tbl_name='readings'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(indexes.contains(&"idx_readings_device_sensor".to_string()));
        assert!(indexes.contains(&"idx_readings_recorded".to_string()));
    }
}
