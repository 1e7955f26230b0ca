use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use taskcron_core::TaskcronConfig;
use taskcron_scheduler::{
    EngineConfig, SchedulerLoop, SqliteTaskStore, SystemClock, TaskRegistry, TaskStore, UuidV7Ids,
};
use tracing::info;

mod app;
mod http;
mod sink;

/// Task scheduling gateway: HTTP task management plus the background tick loop.
#[derive(Debug, Parser)]
#[command(name = "taskcron-gateway", version, about)]
struct Args {
    /// Path to the TOML config file (falls back to TASKCRON_CONFIG).
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "taskcron_gateway=info,taskcron_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    // load config: --config > TASKCRON_CONFIG env > ~/.taskcron/taskcron.toml
    let args = Args::parse();
    let config_path = args.config.or_else(|| std::env::var("TASKCRON_CONFIG").ok());
    let config = TaskcronConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        TaskcronConfig::default()
    });
    config.ensure_dirs()?;

    let db_path = &config.database.path;
    info!(path = %db_path, "opening SQLite database");
    let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open(db_path)?);
    info!("database migrations complete");

    let clock = Arc::new(SystemClock);
    let registry = TaskRegistry::new(
        store.clone(),
        clock.clone(),
        Arc::new(UuidV7Ids),
        config.scheduler.page_size,
    );
    let engine = Arc::new(SchedulerLoop::new(
        store,
        Arc::new(sink::FileArtifactSink::new(&config.sink.artifact_dir)),
        clock,
        EngineConfig::from(&config.scheduler),
    ));

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let tick_every = Duration::from_secs(config.scheduler.tick_interval_secs);

    let state = Arc::new(app::AppState::new(config, registry, Arc::clone(&engine)));
    let router = app::build_router(state);

    // spawn scheduler loop in background; it drains in-flight work on shutdown
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler = tokio::spawn(async move { engine.run(tick_every, shutdown_rx).await });

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("taskcron gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // signal scheduler to stop and wait for the drain
    let _ = shutdown_tx.send(true);
    scheduler.await?;
    info!("scheduler drained, exiting");
    Ok(())
}
