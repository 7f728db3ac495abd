//! netwatch Binary Entry Point
//!
//! Runs storage, the orchestration engine and the operational HTTP surface.
//! Core functionality is provided by the `netwatch` library crate.

use clap::Parser;
use netwatch::{
    config::AppConfig,
    engine::Engine,
    server::{AppState, create_router},
    storage::{Event, EventSeverity, StorageBuilder, StorageHandles},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Static event source tag for process lifecycle events.
const SYSTEM_EVENT_SOURCE: &str = "system";

/// netwatch - Network Discovery and Metric Polling
#[derive(Parser, Debug)]
#[command(name = "netwatch", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/config.yaml",
        env = "NETWATCH_CONFIG"
    )]
    config: String,

    /// Server bind address (overrides config file)
    #[arg(long, env = "NETWATCH_SERVER_BIND")]
    server_bind: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, env = "NETWATCH_SERVER_PORT")]
    server_port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(long, env = "NETWATCH_DB_URL")]
    db_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,netwatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("netwatch - Network Discovery and Metric Polling");

    let cli = Cli::parse();

    tracing::info!("Loading configuration from: {}", cli.config);
    let mut config = AppConfig::load(&cli.config)?;

    // Apply CLI/env overrides (CLI > ENV > config file)
    if let Some(bind) = cli.server_bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.server_port {
        config.server.port = port;
    }
    if let Some(url) = cli.db_url {
        config.database.url = url;
    }
    config.validate()?;

    tracing::info!(
        bind = %config.server.bind,
        port = config.server.port,
        database = %config.database.url,
        plugin = %config.plugin.path.display(),
        "Configuration loaded"
    );

    let storage = StorageBuilder::new(&config.database.url)
        .max_connections(config.database.max_connections)
        .build()
        .await?;

    let (engine_handle, engine) = Engine::start(config.engine_config(), storage.clone()).await?;
    engine.aggregator().event(Event::system(
        SYSTEM_EVENT_SOURCE,
        EventSeverity::Info,
        "Service started",
        serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }),
    ));

    let app = create_router(AppState {
        storage: storage.clone(),
        engine: engine_handle,
        registry: Arc::clone(engine.registry()),
        scheduler: Arc::clone(engine.scheduler()),
        max_hosts: config.discovery.max_hosts,
    });

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;

    tracing::info!("Web server listening on: http://{}", addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(engine, storage))
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal, then stop the engine and close storage.
async fn shutdown_signal(engine: Engine, storage: StorageHandles) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }

    engine.aggregator().event(Event::system(
        SYSTEM_EVENT_SOURCE,
        EventSeverity::Info,
        "Service stopping",
        serde_json::json!({}),
    ));

    tracing::info!("Shutting down engine...");
    if let Err(e) = engine.shutdown().await {
        tracing::error!("Failed to shutdown engine: {}", e);
    }

    tracing::info!("Shutting down storage...");
    storage.shutdown().await;
}
