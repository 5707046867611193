//! capstand — the Capstan daemon.
//!
//! Single-node process wiring the state store, the rollout engine, and the
//! REST API together, with the in-process registry and gateway from
//! `capstan_engine::local`. Point a real cluster gateway at the engine to
//! run against an actual cluster.
//!
//! # Usage
//!
//! ```text
//! capstand --port 8443 --data-dir /var/lib/capstan
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use capstan_core::{Author, SystemClock};
use capstan_engine::{
    local::{LocalGateway, LocalRegistry},
    EngineConfig, RolloutScheduler, RolloutService,
};
use capstan_queue::JobQueue;
use capstan_state::Store;

#[derive(Parser)]
#[command(name = "capstand", about = "Capstan control-plane daemon")]
struct Cli {
    /// Port for the REST API.
    #[arg(long, default_value = "8443")]
    port: u16,

    /// Data directory for persistent state.
    #[arg(long, default_value = "/var/lib/capstan")]
    data_dir: PathBuf,

    /// Upper bound on concurrently running rollout turns.
    #[arg(long, default_value = "10")]
    max_concurrent_jobs: usize,

    /// Seconds between retries of a rollout turn that made no progress.
    #[arg(long, default_value = "3")]
    retry_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,capstand=debug,capstan=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    info!("capstan daemon starting");

    std::fs::create_dir_all(&cli.data_dir)?;
    let db_path = cli.data_dir.join("capstan.redb");
    let store = Store::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let registry = Arc::new(LocalRegistry::new(Author {
        id: "capstand".to_string(),
        name: "capstand".to_string(),
    }));
    let gateway = Arc::new(LocalGateway::new());

    let config = EngineConfig {
        max_concurrent_jobs: cli.max_concurrent_jobs,
        retry_interval: chrono::Duration::seconds(cli.retry_interval_secs as i64),
        ..EngineConfig::default()
    };

    let service = Arc::new(RolloutService::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        registry,
        gateway,
        Arc::new(store.clone()),
        Arc::new(JobQueue::new()),
        Arc::new(SystemClock),
        config,
    ));
    info!("rollout engine initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = RolloutScheduler::new(service.clone());
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(shutdown_rx).await;
    });
    info!("rollout scheduler started");

    let router = capstan_api::build_router(service, store);
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // In-flight turns finish and persist before the scheduler exits.
    let _ = scheduler_handle.await;

    info!("capstan daemon stopped");
    Ok(())
}
