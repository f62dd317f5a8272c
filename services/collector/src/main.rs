// collector: Observes live broadcasts on SOOP and CHZZK and persists
// normalized analytics records into the warehouse.

use collector::config;
use collector::orchestrator::Collector;
use collector::warehouse::Warehouse;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let (collector_cfg, warehouse_cfg) = match config::load_from_env() {
        Ok(cfgs) => cfgs,
        Err(e) => {
            eprintln!("FATAL: invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!(version = env!("CARGO_PKG_VERSION"), "collector starting");

    info!("connecting to warehouse...");
    let warehouse = match Warehouse::connect(&warehouse_cfg).await {
        Ok(warehouse) => warehouse,
        Err(e) => {
            error!(error = %e, "warehouse connection failed");
            std::process::exit(2);
        }
    };
    if let Err(e) = warehouse.run_migrations().await {
        error!(error = %e, "schema migrations failed");
        std::process::exit(2);
    }
    info!("migrations applied");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    match Collector::new(collector_cfg, warehouse).run(shutdown_rx).await {
        Ok(()) => info!("collector shut down gracefully"),
        Err(e) => {
            error!(error = %e, "fatal warehouse failure");
            std::process::exit(2);
        }
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
