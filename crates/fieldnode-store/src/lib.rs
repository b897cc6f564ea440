//! SQLite persistence for fieldnode telemetry.
//!
//! This crate owns the on-disk layout, the transactional ingest path with
//! bounded retention, and the read queries served over HTTP.
//!
//! # Features
//!
//! - Wide or narrow reading layout, fixed per database
//! - Device registry upserted by every message
//! - Retention pruning inside the ingest transaction
//! - Filtered listings and hourly averages
//!
//! # Example
//!
//! ```no_run
//! use fieldnode_store::{ReadingQuery, Store};
//! use fieldnode_types::ReadingShape;
//!
//! let store = Store::open(fieldnode_store::default_db_path(), ReadingShape::Wide, 100_000)?;
//!
//! // Query recent readings
//! let query = ReadingQuery::new()
//!     .device("greenhouse-1")
//!     .hours(24)
//!     .limit(10);
//! let readings = store.query_readings(&query)?;
//! # Ok::<(), fieldnode_store::Error>(())
//! ```

mod error;
mod models;
mod queries;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::{HourlyAverage, IngestOutcome, ReadingValues, StoredDevice, StoredReading};
pub use queries::{DEFAULT_LIMIT, ReadingQuery};
pub use store::Store;

/// Default retention ceiling.
pub const DEFAULT_MAX_RECORDS: u64 = 100_000;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/fieldnode/data.db`
/// - macOS: `~/Library/Application Support/fieldnode/data.db`
/// - Windows: `C:\Users\<user>\AppData\Local\fieldnode\data.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("fieldnode")
        .join("data.db")
}
