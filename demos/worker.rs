//! Worker process.
//!
//! Run with: cargo run --example worker
//! Send SIGHUP to reload handlers, Ctrl+C to drain and stop.

use jobwire::{logging, HandlerRegistry, QueueConfig, WorkerRuntime};
use tracing::{error, info};

mod jobs;

fn handlers() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register(jobs::SEND_EMAIL, jobs::send_email)
        .register(jobs::PROCESS_PAYMENT, jobs::process_payment)
        .register(jobs::CLEANUP, jobs::cleanup);
    registry
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();

    let config = QueueConfig::from_env();
    let runtime = WorkerRuntime::connect(config, handlers).await?;
    runtime.start().await?;
    info!(worker_id = %runtime.worker_id(), "Worker running. Press Ctrl+C to stop.");

    wait_for_signals(&runtime).await;

    runtime.shutdown().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signals(runtime: &WorkerRuntime) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            error!(error = %e, "Failed to install SIGHUP handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                return;
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading");
                if let Err(e) = runtime.reload().await {
                    error!(error = %e, "Reload failed");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_runtime: &WorkerRuntime) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
