use conslee::app::App;
use conslee::config::{normalize_listen_addr, Config};
use conslee::docker::DockerRuntime;
use conslee::proxy::Server;
use conslee::runtime::SharedRuntime;
use conslee::scheduler::Scheduler;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// How long graceful shutdown may take before the process exits anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("conslee=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("conslee.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "failed to load configuration");
        e
    })?;

    info!(
        path = %config_path.display(),
        listen_addr = %config.server.listen_addr,
        reaper_interval_secs = config.idle_reaper.interval.as_secs(),
        services = config.services.len(),
        "configuration loaded"
    );

    let runtime: SharedRuntime = Arc::new(DockerRuntime::connect().await?);

    let reaper_interval = config.idle_reaper.interval;
    let listen_addr = normalize_listen_addr(&config.server.listen_addr);
    let app = App::new(config, config_path, runtime)?;

    // Shutdown channel shared by every background task
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Idle reaper + schedule enforcement
    let scheduler = Scheduler::new(Arc::clone(&app), reaper_interval, shutdown_rx.clone());
    let scheduler_handle = tokio::spawn(scheduler.run());

    // Single listener: admin API, health endpoint and proxied traffic
    let server = Server::bind(&listen_addr, Arc::clone(&app), shutdown_rx.clone()).await?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "proxy server error");
        }
    });

    // Wait for a shutdown signal or an internal restart request
    let mut should_restart = false;

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
            _ = sighup.recv() => {
                info!("restart requested (SIGHUP), shutting down gracefully");
                should_restart = true;
            }
            _ = app.restart_requested() => {
                info!("restart requested, shutting down gracefully");
                should_restart = true;
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C, shutting down");
            }
            _ = app.restart_requested() => {
                info!("restart requested, shutting down gracefully");
                should_restart = true;
            }
        }
    }

    // Signal shutdown and drain within the grace period
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = server_handle.await;
        let _ = scheduler_handle.await;
    })
    .await;

    if should_restart {
        info!("restarting (exiting for supervisor restart)");
        std::process::exit(0);
    }

    info!("shutdown complete");
    Ok(())
}
