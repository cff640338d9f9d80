//! Wires the gateway stack together: pairing identity, the connection state
//! machine, and the hooks between them. Runs until shutdown is signalled.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use lib_gateway::{
    AdmissionConfig, CloudConnection, ConnectionConfig, MemoryBudget, PairingConfig,
    PairingManager, QueueConfig, WsTransport,
};

use super::config::Config;

pub async fn run(config: Config, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let server_url = config
        .server_url
        .clone()
        .context("server url not configured (set --server-url or GATEWAY_SERVER_URL)")?;

    let pairing = Arc::new(PairingManager::new(PairingConfig {
        cloud_url: server_url.clone(),
        key_file: config.key_file.clone(),
        ..PairingConfig::default()
    })?);

    // Host-side stand-in for the controller's heap telemetry: the admission
    // gates sample this accounted pool.
    let pool = config.memory_pool_bytes.unwrap_or(120_000);
    let probe = Arc::new(MemoryBudget::new(pool));

    let conn = Arc::new(CloudConnection::new(
        Arc::new(WsTransport::new()),
        probe,
        connection_config(&config),
    ));

    {
        let pairing = pairing.clone();
        conn.on_register(move || {
            let pairing = pairing.clone();
            Box::pin(async move { pairing.register_claim().await })
        });
    }

    // Key rotation: persist the new key, then hand it to the connection so
    // the next dial authenticates with it. Weak handle, the connection owns
    // the hook.
    {
        let pairing = pairing.clone();
        let conn_weak = Arc::downgrade(&conn);
        conn.on_regenerate_key(move || {
            let pairing = pairing.clone();
            let conn_weak = conn_weak.clone();
            Box::pin(async move {
                match pairing.regenerate_key() {
                    Ok(()) => {
                        if let Some(conn) = conn_weak.upgrade() {
                            conn.set_device_key(&pairing.device_key());
                        }
                        true
                    }
                    Err(e) => {
                        log::error!("[cloud] key rotation failed: {}", e);
                        false
                    }
                }
            })
        });
    }

    // Relay commands: answer state requests, log anything unrecognized.
    {
        let conn_weak = Arc::downgrade(&conn);
        let device_id = pairing.device_id();
        conn.on_command(move |msg_type, payload| match msg_type {
            "request_state" => {
                if let Some(conn) = conn_weak.upgrade() {
                    let state = serde_json::json!({
                        "type": "state",
                        "deviceId": device_id,
                        "status": conn.status(),
                        "queued": conn.queued(),
                    });
                    conn.send(&state.to_string());
                }
            }
            other => log::info!("[cloud] unhandled command {}: {}", other, payload),
        });
    }

    conn.begin(&server_url, &pairing.device_id(), &pairing.device_key());

    let status_interval = Duration::from_secs(config.status_interval_seconds.unwrap_or(60));
    let mut ticker = tokio::time::interval(status_interval);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                log::info!(
                    "[cloud] status={} queued={} auth_failures={}",
                    conn.status(),
                    conn.queued(),
                    conn.auth_failure_count()
                );
            }
        }
    }

    conn.end();
    Ok(())
}

/// Maps the flat config file / CLI knobs onto the state machine's tuning,
/// keeping the library defaults for anything not exposed.
fn connection_config(config: &Config) -> ConnectionConfig {
    let defaults = ConnectionConfig::default();
    let admission_defaults = AdmissionConfig::default();
    ConnectionConfig {
        startup_grace: config
            .startup_grace_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.startup_grace),
        heartbeat_interval: config
            .heartbeat_interval_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.heartbeat_interval),
        heartbeat_timeout: config
            .heartbeat_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.heartbeat_timeout),
        admission: AdmissionConfig {
            min_connect_bytes: config
                .min_connect_bytes
                .unwrap_or(admission_defaults.min_connect_bytes),
            min_contiguous_bytes: config
                .min_contiguous_bytes
                .unwrap_or(admission_defaults.min_contiguous_bytes),
            min_stay_connected_bytes: config
                .min_stay_connected_bytes
                .unwrap_or(admission_defaults.min_stay_connected_bytes),
            pause_disconnect_bytes: config
                .pause_disconnect_bytes
                .unwrap_or(admission_defaults.pause_disconnect_bytes),
            ..admission_defaults
        },
        queue: QueueConfig {
            capacity: config.queue_capacity.unwrap_or(16),
            ..QueueConfig::default()
        },
        ..defaults
    }
}
