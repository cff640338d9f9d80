//! # Pairing Manager
//!
//! Owns the device identity the relay authenticates: a stable device id, a
//! persistent random device key, and short-lived pairing tokens shown to the
//! user during claiming. The connection manager never talks to this module
//! directly; it goes through the `on_register` / `on_regenerate_key` hooks
//! so the two lifecycles stay decoupled.
//!
//! `register_claim` is the one-shot HTTPS call that announces the current
//! token and device key to the relay before the persistent WebSocket is
//! attempted. The relay URL is the WebSocket endpoint; its scheme is
//! rewritten (`wss` -> `https`, `ws` -> `http`) for the HTTP call.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use rand::distr::{Alphanumeric, SampleString};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

/// Device key length: base64url of 32 bytes is 43 chars, kept for
/// compatibility with keys minted by the firmware.
const DEVICE_KEY_LEN: usize = 43;
/// Pairing token length shown in the claim URL.
const PAIRING_TOKEN_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no cloud URL configured")]
    MissingCloudUrl,

    #[error("identity file corrupt: {0}")]
    CorruptIdentity(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("registration rejected with HTTP status {0}")]
    Rejected(u16),
}

/// Tuning for the pairing flow.
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// The relay WebSocket endpoint (e.g. `wss://relay.example.io`).
    pub cloud_url: String,
    /// Where the device identity lives across restarts. `None` keeps it in
    /// memory only (tests, ephemeral deployments).
    pub key_file: Option<PathBuf>,
    /// How long a pairing token stays claimable.
    pub token_validity: Duration,
    /// Attempts for the registration POST before giving up.
    pub register_attempts: u32,
    /// Wait between registration attempts; the network stack may need a
    /// moment right after connectivity comes up.
    pub register_retry_delay: Duration,
    /// Timeout for each registration request.
    pub http_timeout: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            cloud_url: String::new(),
            key_file: None,
            token_validity: Duration::from_secs(600),
            register_attempts: 3,
            register_retry_delay: Duration::from_secs(1),
            http_timeout: Duration::from_secs(10),
        }
    }
}

/// The persisted half of the device identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Identity {
    device_id: String,
    device_key: String,
}

struct PairingToken {
    value: String,
    expires_at: Instant,
}

type PairingSuccessCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Device identity, pairing tokens, and the registration call.
pub struct PairingManager {
    config: PairingConfig,
    client: reqwest::Client,
    identity: Mutex<Identity>,
    token: Mutex<Option<PairingToken>>,
    on_pairing_success: Mutex<Option<PairingSuccessCallback>>,
}

impl PairingManager {
    /// Loads the identity from the key file, or mints and stores a fresh one
    /// on first boot.
    pub fn new(config: PairingConfig) -> Result<Self, PairingError> {
        let identity = match &config.key_file {
            Some(path) if path.exists() => {
                let raw = fs::read_to_string(path)?;
                let identity: Identity = serde_json::from_str(&raw)
                    .map_err(|e| PairingError::CorruptIdentity(e.to_string()))?;
                log::info!("[pairing] loaded identity {} from {}", identity.device_id, path.display());
                identity
            }
            _ => {
                let identity = Identity {
                    device_id: format!("CM-{:08X}", rand::rng().random::<u32>()),
                    device_key: Alphanumeric.sample_string(&mut rand::rng(), DEVICE_KEY_LEN),
                };
                if let Some(path) = &config.key_file {
                    persist_identity(path, &identity)?;
                    log::info!("[pairing] generated new identity {} (stored)", identity.device_id);
                } else {
                    log::info!("[pairing] generated new identity {} (in memory)", identity.device_id);
                }
                identity
            }
        };

        Ok(Self {
            client: reqwest::Client::new(),
            config,
            identity: Mutex::new(identity),
            token: Mutex::new(None),
            on_pairing_success: Mutex::new(None),
        })
    }

    pub fn device_id(&self) -> String {
        self.identity.lock().unwrap().device_id.clone()
    }

    pub fn device_key(&self) -> String {
        self.identity.lock().unwrap().device_key.clone()
    }

    /// Mints a fresh pairing token valid for the configured window.
    pub fn generate_token(&self) -> String {
        let value = Alphanumeric.sample_string(&mut rand::rng(), PAIRING_TOKEN_LEN);
        let mut token = self.token.lock().unwrap();
        *token = Some(PairingToken {
            value: value.clone(),
            expires_at: Instant::now() + self.config.token_validity,
        });
        log::info!(
            "[pairing] generated new token (valid {}s)",
            self.config.token_validity.as_secs()
        );
        value
    }

    pub fn token_valid(&self) -> bool {
        self.token
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| Instant::now() < t.expires_at)
            .unwrap_or(false)
    }

    /// The claim URL to show the user, or `None` without a live token.
    pub fn pairing_url(&self) -> Option<String> {
        let token = self.token.lock().unwrap();
        let token = token.as_ref().filter(|t| Instant::now() < t.expires_at)?;
        let identity = self.identity.lock().unwrap();
        Some(format!(
            "{}/pair?id={}&token={}",
            http_base(&self.config.cloud_url),
            identity.device_id,
            token.value
        ))
    }

    /// Rotates the device key in response to an authentication failure. The
    /// device id is stable for the lifetime of the key file.
    pub fn regenerate_key(&self) -> Result<(), PairingError> {
        let mut identity = self.identity.lock().unwrap();
        identity.device_key = Alphanumeric.sample_string(&mut rand::rng(), DEVICE_KEY_LEN);
        if let Some(path) = &self.config.key_file {
            persist_identity(path, &identity)?;
        }
        log::warn!("[pairing] device key rotated for {}", identity.device_id);
        Ok(())
    }

    /// Registers the current token and device key with the relay. Returns
    /// whether the relay accepted; every failure mode is logged, none is
    /// fatal to the caller.
    pub async fn register_claim(&self) -> bool {
        match self.try_register().await {
            Ok(()) => {
                log::info!("[pairing] token and device key registered with relay");
                true
            }
            Err(e) => {
                log::warn!("[pairing] registration failed: {}", e);
                false
            }
        }
    }

    async fn try_register(&self) -> Result<(), PairingError> {
        if self.config.cloud_url.is_empty() {
            return Err(PairingError::MissingCloudUrl);
        }
        if !self.token_valid() {
            self.generate_token();
        }

        let (device_id, device_key) = {
            let identity = self.identity.lock().unwrap();
            (identity.device_id.clone(), identity.device_key.clone())
        };
        let token = self
            .token
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| t.value.clone())
            .unwrap_or_default();

        let url = format!(
            "{}/api/devices/register-claim",
            http_base(&self.config.cloud_url)
        );
        let body = serde_json::json!({
            "deviceId": device_id,
            "token": token,
            "deviceKey": device_key,
        });

        let mut last_err = PairingError::Network("no attempts made".to_string());
        for attempt in 1..=self.config.register_attempts {
            let result = self
                .client
                .post(&url)
                .json(&body)
                .timeout(self.config.http_timeout)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    last_err = PairingError::Rejected(resp.status().as_u16());
                }
                Err(e) => {
                    last_err = PairingError::Network(e.to_string());
                }
            }

            log::warn!(
                "[pairing] registration attempt {}/{} failed: {}",
                attempt,
                self.config.register_attempts,
                last_err
            );
            if attempt < self.config.register_attempts {
                tokio::time::sleep(self.config.register_retry_delay).await;
            }
        }
        Err(last_err)
    }

    /// Invoked by the caller when the relay reports the device was claimed.
    /// Fires the success callback and burns the token.
    pub fn notify_pairing_success(&self, user_id: &str) {
        log::info!("[pairing] device claimed by user {}", user_id);
        if let Some(callback) = self.on_pairing_success.lock().unwrap().as_ref() {
            callback(user_id);
        }
        *self.token.lock().unwrap() = None;
    }

    pub fn on_pairing_success<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_pairing_success.lock().unwrap() = Some(Box::new(callback));
    }
}

/// Rewrites the relay WebSocket URL to its HTTP counterpart, trimming any
/// trailing slash. Bare hosts are assumed secure.
pub fn http_base(cloud_url: &str) -> String {
    let rewritten = if let Some(rest) = cloud_url.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = cloud_url.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else if cloud_url.starts_with("http://") || cloud_url.starts_with("https://") {
        cloud_url.to_string()
    } else if cloud_url.is_empty() {
        String::new()
    } else {
        format!("https://{}", cloud_url)
    };
    rewritten.trim_end_matches('/').to_string()
}

fn persist_identity(path: &PathBuf, identity: &Identity) -> Result<(), PairingError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string_pretty(identity)
        .map_err(|e| PairingError::CorruptIdentity(e.to_string()))?;
    fs::write(path, raw)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn test_config(cloud_url: &str) -> PairingConfig {
        PairingConfig {
            cloud_url: cloud_url.to_string(),
            register_retry_delay: Duration::from_millis(10),
            ..PairingConfig::default()
        }
    }

    #[test]
    fn http_base_rewrites_schemes() {
        assert_eq!(http_base("wss://relay.example.io"), "https://relay.example.io");
        assert_eq!(http_base("ws://10.0.0.2:9000/"), "http://10.0.0.2:9000");
        assert_eq!(http_base("https://relay.example.io"), "https://relay.example.io");
        assert_eq!(http_base("relay.example.io"), "https://relay.example.io");
    }

    #[test]
    fn identity_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("device.json");
        let config = PairingConfig {
            key_file: Some(key_file.clone()),
            ..test_config("wss://relay.example.io")
        };

        let first = PairingManager::new(config.clone()).unwrap();
        let (id, key) = (first.device_id(), first.device_key());
        assert!(id.starts_with("CM-"));
        assert_eq!(key.len(), DEVICE_KEY_LEN);
        drop(first);

        let second = PairingManager::new(config).unwrap();
        assert_eq!(second.device_id(), id);
        assert_eq!(second.device_key(), key);
    }

    #[test]
    fn key_rotation_keeps_device_id() {
        let dir = tempfile::tempdir().unwrap();
        let config = PairingConfig {
            key_file: Some(dir.path().join("device.json")),
            ..test_config("wss://relay.example.io")
        };
        let manager = PairingManager::new(config.clone()).unwrap();
        let (id, old_key) = (manager.device_id(), manager.device_key());

        manager.regenerate_key().unwrap();
        assert_eq!(manager.device_id(), id);
        assert_ne!(manager.device_key(), old_key);

        // The rotated key is what a fresh load sees.
        let reloaded = PairingManager::new(config).unwrap();
        assert_eq!(reloaded.device_key(), manager.device_key());
    }

    #[tokio::test(start_paused = true)]
    async fn token_expires_after_validity_window() {
        let manager = PairingManager::new(PairingConfig {
            token_validity: Duration::from_secs(600),
            ..test_config("wss://relay.example.io")
        })
        .unwrap();

        assert!(!manager.token_valid());
        assert_eq!(manager.pairing_url(), None);

        let token = manager.generate_token();
        assert!(manager.token_valid());
        let url = manager.pairing_url().unwrap();
        assert!(url.starts_with("https://relay.example.io/pair?id=CM-"));
        assert!(url.ends_with(&format!("&token={}", token)));

        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(!manager.token_valid());
        assert_eq!(manager.pairing_url(), None);
    }

    #[test]
    fn claim_notification_burns_token() {
        let manager = PairingManager::new(test_config("wss://relay.example.io")).unwrap();
        let claimed = std::sync::Arc::new(Mutex::new(None::<String>));
        let claimed_clone = claimed.clone();
        manager.on_pairing_success(move |user| {
            *claimed_clone.lock().unwrap() = Some(user.to_string());
        });

        manager.generate_token();
        manager.notify_pairing_success("user-42");
        assert_eq!(claimed.lock().unwrap().as_deref(), Some("user-42"));
        assert!(!manager.token_valid());
    }

    /// Minimal one-shot HTTP responder on a random local port.
    fn spawn_http_server(responses: Vec<&'static str>) -> (String, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind random port");
        let port = listener.local_addr().unwrap().port();
        let url = format!("ws://127.0.0.1:{}", port);

        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for status_line in responses {
                if let Ok((mut stream, _)) = listener.accept() {
                    // Headers and body may arrive in separate packets; keep
                    // reading until the Content-Length is satisfied.
                    stream
                        .set_read_timeout(Some(Duration::from_millis(500)))
                        .unwrap();
                    let mut raw = Vec::new();
                    let mut buf = [0u8; 2048];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => raw.extend_from_slice(&buf[..n]),
                        }
                        let text = String::from_utf8_lossy(&raw);
                        if let Some(header_end) = text.find("\r\n\r\n") {
                            let body_len = text
                                .lines()
                                .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap_or(0)))
                                .unwrap_or(0);
                            if raw.len() >= header_end + 4 + body_len {
                                break;
                            }
                        }
                    }
                    seen.push(String::from_utf8_lossy(&raw).into_owned());
                    let response = format!("{}\r\nContent-Length: 0\r\n\r\n", status_line);
                    let _ = stream.write_all(response.as_bytes());
                }
            }
            seen
        });
        (url, handle)
    }

    #[tokio::test]
    async fn register_claim_posts_identity() {
        let (url, server) = spawn_http_server(vec!["HTTP/1.1 200 OK"]);
        let manager = PairingManager::new(test_config(&url)).unwrap();

        assert!(manager.register_claim().await);

        let requests = server.join().unwrap();
        let request = &requests[0];
        assert!(request.starts_with("POST /api/devices/register-claim"));
        assert!(request.contains(&manager.device_id()));
        assert!(request.contains(&manager.device_key()));
    }

    #[tokio::test]
    async fn register_claim_retries_then_gives_up() {
        let (url, server) = spawn_http_server(vec![
            "HTTP/1.1 500 Internal Server Error",
            "HTTP/1.1 500 Internal Server Error",
            "HTTP/1.1 500 Internal Server Error",
        ]);
        let manager = PairingManager::new(test_config(&url)).unwrap();

        assert!(!manager.register_claim().await);
        assert_eq!(server.join().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn register_claim_requires_cloud_url() {
        let manager = PairingManager::new(PairingConfig::default()).unwrap();
        assert!(!manager.register_claim().await);
    }
}
