//! fieldnode service - broker ingest and HTTP query API.
//!
//! Run with: `cargo run -p fieldnode-service`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use fieldnode_service::{
    AppState, Config, ConfigError, IngestStats, IngestWorker, MqttTransport, SessionConfig, bus,
};
use fieldnode_store::Store;

/// fieldnode service - broker ingest and HTTP query API.
#[derive(Parser, Debug)]
#[command(name = "fieldnode-service")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long)]
    bind: Option<String>,

    /// Database path (overrides config).
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Do not connect to the broker (query API only).
    #[arg(long)]
    no_ingest: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fieldnode_service=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    // Override config with CLI args
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(db_path) = args.database {
        config.storage.path = db_path;
    }

    let ingest = !args.no_ingest;
    config.validate(ingest)?;
    let addr: SocketAddr = config.server.bind.parse()?;

    // Open the database
    let storage = &config.storage;
    info!(
        "Opening {} database at {:?} (max {} readings)",
        storage.shape, storage.path, storage.max_records
    );
    let query_store = Store::open(&storage.path, storage.shape, storage.max_records)?;

    // Nothing fallible may run between session start and serve
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let (state, session) = if ingest {
        let mut ingest_store = Store::open(&storage.path, storage.shape, storage.max_records)?;
        let stats = Arc::new(IngestStats::new());

        let pruned = ingest_store.prune()?;
        if pruned > 0 {
            info!("Pruned {} reading(s) above the retention ceiling", pruned);
            stats.record_pruned(pruned);
        }

        let auth = config.mqtt.auth().map_err(ConfigError::Validation)?;
        info!(
            "Connecting to {} as '{}' ({} auth), topic '{}'",
            config.mqtt.broker,
            config.mqtt.client_id,
            auth.kind(),
            config.mqtt.topic
        );
        let transport = MqttTransport::new(&config.mqtt, &auth)?;
        let worker = Arc::new(IngestWorker::new(ingest_store, Arc::clone(&stats)));
        let session = bus::start(SessionConfig::from_config(&config.mqtt), transport, worker);

        let state = AppState::new(query_store, config, stats, session.subscribe_state());
        (state, Some(session))
    } else {
        info!("Broker ingest disabled");
        (AppState::query_only(query_store, config), None)
    };

    let app = fieldnode_service::app(state);

    info!("Starting server on {}", addr);

    // Run the server; the session is stopped whether or not it fails
    let server = async {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    };
    let served = match session {
        Some(session) => session.stop_after(server).await,
        None => server.await,
    };
    served?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
