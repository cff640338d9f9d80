//! # Gateway <-> Relay Integration Test
//!
//! Spins up a local WebSocket "relay" and runs the real gateway stack
//! against it: persisted pairing identity, the connection state machine,
//! and the production `WsTransport`. Verifies the full session lifecycle:
//!
//! 1. Identity is minted once and survives a reload from disk.
//! 2. The gateway dials, the relay greets with `{"type":"connected"}`.
//! 3. Application pings are answered and the session stays up.
//! 4. A relay command is forwarded to the command handler, and the reply
//!    (plus the proactive state push response) arrives back at the relay.
//! 5. `end()` closes the session in an orderly way.
//!
//! Run with `cargo run --bin test_gateway_relay`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;

use lib_gateway::{
    BackoffConfig, CloudConnection, ConnectionConfig, MemoryBudget, PairingConfig,
    PairingManager, WsTransport,
};

/// Everything the fake relay observed before the session closed.
#[derive(Debug, Default)]
struct RelayLog {
    texts: Vec<String>,
    pings: u32,
    orderly_close: bool,
}

async fn run_fake_relay(listener: TcpListener) -> Result<RelayLog> {
    let (stream, peer) = listener.accept().await?;
    println!("relay: device connected from {peer}");
    let mut ws = tokio_tungstenite::accept_async(stream).await?;

    // Greet like the production relay, then immediately push a command.
    ws.send(Message::Text(r#"{"type":"connected"}"#.into()))
        .await?;
    ws.send(Message::Text(
        r#"{"type":"brew_command","action":"start"}"#.into(),
    ))
    .await?;

    let mut log = RelayLog::default();
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => {
                if text.contains(r#""type":"ping""#) {
                    log.pings += 1;
                    ws.send(Message::Text(r#"{"type":"pong"}"#.into())).await?;
                } else {
                    println!("relay: received {text}");
                    log.texts.push(text.to_string());
                }
            }
            Message::Close(_) => {
                log.orderly_close = true;
                break;
            }
            _ => {}
        }
    }
    Ok(log)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server_url = format!("ws://{addr}");
    let relay = tokio::spawn(run_fake_relay(listener));

    // --- Pairing identity: minted once, reloaded from disk ---
    let key_dir = tempfile::tempdir()?;
    let key_file = key_dir.path().join("device.json");
    let pairing_config = PairingConfig {
        cloud_url: server_url.clone(),
        key_file: Some(key_file.clone()),
        ..PairingConfig::default()
    };
    let device_id = {
        let first = PairingManager::new(pairing_config.clone())?;
        assert!(first.device_id().starts_with("CM-"));
        assert!(!first.token_valid());
        let token = first.generate_token();
        assert_eq!(token.len(), 32);
        assert!(first.token_valid());
        println!(
            "pairing url: {}",
            first.pairing_url().context("pairing url")?
        );
        first.device_id()
    };
    let pairing = Arc::new(PairingManager::new(pairing_config)?);
    assert_eq!(pairing.device_id(), device_id, "identity must persist");

    // --- The gateway stack, tuned for a fast test run ---
    let config = ConnectionConfig {
        startup_grace: Duration::from_millis(200),
        state_push_delay: Duration::from_millis(500),
        heartbeat_interval: Duration::from_secs(1),
        heartbeat_timeout: Duration::from_millis(800),
        drain_interval: Duration::from_millis(50),
        watchdog_interval: Duration::from_millis(100),
        backoff: BackoffConfig {
            base_delay: Duration::from_millis(200),
            ..BackoffConfig::default()
        },
        ..ConnectionConfig::default()
    };
    let probe = Arc::new(MemoryBudget::new(120_000));
    let conn = Arc::new(CloudConnection::new(
        Arc::new(WsTransport::new()),
        probe,
        config,
    ));

    let (cmd_tx, mut cmd_rx) = tokio::sync::mpsc::unbounded_channel();
    conn.on_command(move |msg_type, payload| {
        let _ = cmd_tx.send((msg_type.to_string(), payload));
    });

    conn.begin(&server_url, &pairing.device_id(), &pairing.device_key());

    // --- Session comes up ---
    timeout(Duration::from_secs(10), async {
        while !conn.is_connected() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .context("gateway never connected")?;
    println!("gateway: connected as {}", pairing.device_id());

    // --- Commands flow in both directions ---
    let mut saw_brew_command = false;
    let mut saw_state_request = false;
    timeout(Duration::from_secs(10), async {
        while !(saw_brew_command && saw_state_request) {
            let (msg_type, payload) = cmd_rx.recv().await.context("command channel closed")?;
            match msg_type.as_str() {
                "brew_command" => {
                    assert_eq!(payload["action"], "start");
                    saw_brew_command = true;
                    assert!(conn.send(r#"{"type":"telemetry","boiler_c":92}"#));
                }
                "request_state" => {
                    saw_state_request = true;
                    let state = serde_json::json!({
                        "type": "state",
                        "deviceId": pairing.device_id(),
                        "status": conn.status(),
                    });
                    assert!(conn.send(&state.to_string()));
                }
                other => println!("gateway: ignoring command {other}"),
            }
        }
        anyhow::Ok(())
    })
    .await
    .context("commands never arrived")??;

    // --- A few heartbeat cycles keep the session alive ---
    sleep(Duration::from_secs(3)).await;
    assert!(conn.is_connected(), "heartbeats should keep the session up");
    assert_eq!(conn.auth_failure_count(), 0);

    conn.end();
    let log = timeout(Duration::from_secs(5), relay)
        .await
        .context("relay task hung")?
        .context("relay task panicked")??;

    assert!(log.pings >= 2, "expected several pings, saw {}", log.pings);
    assert!(
        log.texts.iter().any(|t| t.contains(r#""type":"telemetry""#)),
        "telemetry never reached the relay"
    );
    assert!(
        log.texts.iter().any(|t| t.contains(r#""type":"state""#)),
        "state reply never reached the relay"
    );
    assert!(log.orderly_close, "end() should close the session cleanly");

    println!("--- All gateway relay tests passed ---");
    Ok(())
}
