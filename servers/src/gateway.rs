use anyhow::Result;
use std::path::PathBuf;
use tokio::signal;

mod gateway_logic;
use gateway_logic::{config, logger, service};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();

    let log_dir = config
        .log_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("./logs"));
    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    logger::setup_logging(&log_dir, &log_level)?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let mut service_handle = tokio::spawn(service::run(config, shutdown_tx.subscribe()));

    // Wait for shutdown signal, or for the service to bail out on its own
    tokio::select! {
        result = &mut service_handle => {
            match result {
                Ok(result) => result?,
                Err(e) => log::error!("service task panicked: {}", e),
            }
            return Ok(());
        }
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate()).unwrap();
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    // Wait for the service to shut down
    match service_handle.await {
        Ok(result) => result?,
        Err(e) => log::error!("service task panicked: {}", e),
    }

    log::info!("Shutdown complete.");
    Ok(())
}
