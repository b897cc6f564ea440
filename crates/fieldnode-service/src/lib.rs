//! Broker-fed ingest service and HTTP query API for field sensor readings.
//!
//! This crate provides a service that:
//! - Subscribes to one topic on an MQTT broker and keeps the session alive
//! - Normalizes each JSON message and stores it in the local database
//! - Enforces a retention ceiling on stored readings
//! - Exposes a read-only REST API over the stored data
//!
//! # REST API Endpoints
//!
//! - `GET /health` - Service health check
//! - `GET /status` - Broker session state and ingest counters
//! - `GET /devices` - List all known devices
//! - `GET /devices/{id}` - Get device info
//! - `GET /devices/{id}/hourly` - Hourly averages for one device
//! - `GET /readings` - Query readings with filters
//! - `GET /readings/hourly` - Hourly averages per sensor type
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/fieldnode/server.toml`:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [storage]
//! path = "~/.local/share/fieldnode/data.db"
//! shape = "narrow"
//! max_records = 100000
//!
//! [mqtt]
//! broker = "mqtts://broker.local:8883"
//! topic = "sensors/environment"
//! username = "collector"
//! password = "secret"
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod bus;
pub mod config;
pub mod ingest;
pub mod state;

pub use bus::{
    BusMessage, BusTransport, ConnectionState, MessageHandler, MqttTransport, ReconnectPolicy,
    SessionConfig, SessionHandle, TransportError,
};
pub use config::{
    AuthMode, AuthModeKind, Config, ConfigError, MqttConfig, ReconnectConfig, ServerConfig,
    StorageConfig, ValidationError,
};
pub use ingest::{IngestStats, IngestStatsSnapshot, IngestWorker};
pub use state::AppState;

/// Per-request timeout for the HTTP surface.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the full HTTP application with its middleware stack.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(api::router())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            REQUEST_TIMEOUT,
        ))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
