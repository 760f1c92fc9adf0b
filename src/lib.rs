pub mod api;
pub mod batch_controller;
pub mod chunk_server;
pub mod clock;
pub mod error;
pub mod event_log;
pub mod firmware_store;
pub mod health_supervisor;
pub mod key_store;
pub mod metrics;
pub mod model;
pub mod repository;
pub mod service;
pub mod session_engine;
pub mod update_advisor;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::router::api_router;
use crate::health_supervisor::{DEFAULT_SCAN_INTERVAL_SECS, DEFAULT_STUCK_THRESHOLD_MINUTES};
use crate::metrics::router::metrics_router;
use crate::chunk_server::DEFAULT_CACHE_MAX_BYTES;
use crate::service::OtaService;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Root directory for firmware binaries and the signing key store.
    #[clap(long, env, default_value = "./data")]
    pub storage_root: String,
    /// Address the device- and operator-facing API listens on.
    #[clap(long, env, default_value = "0.0.0.0:8080")]
    pub listen_addr: String,
    /// Address the Prometheus `/metrics` endpoint listens on.
    #[clap(long, env, default_value = "0.0.0.0:9090")]
    pub metrics_listen_addr: String,
    #[clap(long, env, default_value = "info")]
    log_level: LevelFilter,
    /// Default `max_concurrent` for batches that don't specify one.
    #[clap(long, env, default_value_t = crate::batch_controller::DEFAULT_MAX_CONCURRENT)]
    pub max_concurrent_default: u32,
    /// Aggregate byte cap for the chunk cache.
    #[clap(long, env, default_value_t = DEFAULT_CACHE_MAX_BYTES)]
    pub chunk_cache_bytes: u64,
    /// Interval between Health Supervisor background scans.
    #[clap(long, env, default_value_t = DEFAULT_SCAN_INTERVAL_SECS)]
    pub supervisor_interval_secs: u64,
    /// Minutes a non-terminal session may sit before the supervisor
    /// considers it stuck.
    #[clap(long, env, default_value_t = DEFAULT_STUCK_THRESHOLD_MINUTES)]
    pub stuck_threshold_minutes: i64,
}

/// Runs the orchestrator with the provided CLI configuration.
///
/// Initializes logging, sets up graceful shutdown handling, builds the
/// `OtaService` component graph, spawns the Health Supervisor's
/// background scan loop, and starts both the main API server and the
/// metrics server.
///
/// # Errors
///
/// Returns an error if binding to either configured listen address
/// fails.
///
/// # Panics
///
/// Panics if the Ctrl+C signal handler fails to register.
pub async fn run(cli: Cli) -> Result<()> {
    tracing_subscriber::registry()
        .with(cli.log_level)
        .with(fmt::layer())
        .init();

    let cancel_token = CancellationToken::new();

    let ctrl_c_listener_task = tokio::spawn({
        let cancel_token_clone = cancel_token.clone();
        async move {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for Ctrl+C signal");
            info!("Ctrl+C received, proceeding with graceful shutdown...");
            cancel_token_clone.cancel();
        }
    });

    let service = Arc::new(OtaService::new(
        cli.storage_root.clone(),
        cli.chunk_cache_bytes,
    ));
    info!(storage_root = %cli.storage_root, "OTA service initialized");

    service
        .health_supervisor
        .clone()
        .spawn_scan_loop(
            cli.supervisor_interval_secs,
            cli.stuck_threshold_minutes,
            cancel_token.clone(),
        );

    let main_server_cancel_token = cancel_token.clone();
    let metrics_server_cancel_token = cancel_token.clone();

    tokio::try_join!(
        start_main_server(&cli.listen_addr, Arc::clone(&service), main_server_cancel_token),
        start_metrics_server(&cli.metrics_listen_addr, metrics_server_cancel_token),
    )?;

    ctrl_c_listener_task.await?;
    service.session_engine.drain_verification_tasks().await;
    service.firmware_store.drain_validation_tasks().await;

    info!("All services shut down gracefully.");

    Ok(())
}

async fn start_main_server(
    listen_address: &str,
    service: Arc<OtaService>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(listen_address).await?;
    info!("orchestrator listening on {}", listener.local_addr()?);

    let shutdown_future = async move {
        cancel_token.cancelled().await;
    };

    axum::serve(listener, api_router(service))
        .with_graceful_shutdown(shutdown_future)
        .await?;
    info!("Main server shut down gracefully");
    Ok(())
}

async fn start_metrics_server(listen_address: &str, cancel_token: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(listen_address).await?;
    info!("Metrics server listening on {}", listener.local_addr()?);

    let shutdown_future = async move {
        cancel_token.cancelled().await;
    };

    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(shutdown_future)
        .await?;
    info!("Metrics server shut down gracefully");
    Ok(())
}
