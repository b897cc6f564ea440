//! Application state shared across handlers.

use std::sync::Arc;

use fieldnode_store::Store;
use time::OffsetDateTime;
use tokio::sync::{Mutex, watch};

use crate::bus::ConnectionState;
use crate::config::Config;
use crate::ingest::IngestStats;

/// Shared application state.
///
/// The store here is the query connection. The ingest worker has its own.
pub struct AppState {
    /// The query store (wrapped in Mutex for thread-safe access).
    pub store: Mutex<Store>,
    /// Configuration, fixed at startup.
    pub config: Config,
    /// Ingest counters.
    pub stats: Arc<IngestStats>,
    /// Broker session state.
    pub connection: watch::Receiver<ConnectionState>,
    /// When the service started.
    pub started_at: OffsetDateTime,
    ingest: bool,
}

impl AppState {
    /// Create state for a service with a running bus session.
    pub fn new(
        store: Store,
        config: Config,
        stats: Arc<IngestStats>,
        connection: watch::Receiver<ConnectionState>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: Mutex::new(store),
            config,
            stats,
            connection,
            started_at: OffsetDateTime::now_utc(),
            ingest: true,
        })
    }

    /// Create state for a query-only service.
    ///
    /// The connection state stays [`ConnectionState::Disconnected`].
    pub fn query_only(store: Store, config: Config) -> Arc<Self> {
        let (_, connection) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            store: Mutex::new(store),
            config,
            stats: Arc::new(IngestStats::new()),
            connection,
            started_at: OffsetDateTime::now_utc(),
            ingest: false,
        })
    }

    /// Whether a bus session feeds this service.
    pub fn ingest_enabled(&self) -> bool {
        self.ingest
    }

    /// Current broker session state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }
}
