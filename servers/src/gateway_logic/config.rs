use clap::Parser;
use dirs; // Added for home_dir()
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Cloud relay gateway for the machine controller", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "GATEWAY_SERVER_URL", help = "Cloud relay base URL (wss://... or https://...).")]
    pub server_url: Option<String>,

    #[clap(long, env = "GATEWAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "GATEWAY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "GATEWAY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "GATEWAY_KEY_FILE", help = "Path where the device identity (id + key) is persisted.")]
    pub key_file: Option<PathBuf>,

    #[clap(long, env = "GATEWAY_STARTUP_GRACE_SECONDS", help = "Quiet period after startup before the first connection attempt.")]
    pub startup_grace_seconds: Option<u64>,

    #[clap(long, env = "GATEWAY_MIN_CONNECT_BYTES", help = "Free memory required before a connection attempt is admitted.")]
    pub min_connect_bytes: Option<u64>,

    #[clap(long, env = "GATEWAY_MIN_CONTIGUOUS_BYTES", help = "Largest contiguous free block required before an attempt is admitted.")]
    pub min_contiguous_bytes: Option<u64>,

    #[clap(long, env = "GATEWAY_MIN_STAY_CONNECTED_BYTES", help = "Free memory below which an established session is dropped.")]
    pub min_stay_connected_bytes: Option<u64>,

    #[clap(long, env = "GATEWAY_PAUSE_DISCONNECT_BYTES", help = "Free memory below which a pause request drops the session.")]
    pub pause_disconnect_bytes: Option<u64>,

    #[clap(long, env = "GATEWAY_HEARTBEAT_INTERVAL_SECONDS", help = "Application-level ping cadence while connected.")]
    pub heartbeat_interval_seconds: Option<u64>,

    #[clap(long, env = "GATEWAY_HEARTBEAT_TIMEOUT_SECONDS", help = "Seconds to wait for the matching pong before counting a miss.")]
    pub heartbeat_timeout_seconds: Option<u64>,

    #[clap(long, env = "GATEWAY_QUEUE_CAPACITY", help = "Outbound queue slots; sends past this are dropped.")]
    pub queue_capacity: Option<usize>,

    #[clap(long, env = "GATEWAY_MEMORY_POOL_BYTES", help = "Size of the accounted memory pool the admission gates sample.")]
    pub memory_pool_bytes: Option<u64>,

    #[clap(long, env = "GATEWAY_STATUS_INTERVAL_SECONDS", help = "Interval in seconds between status log lines.")]
    pub status_interval_seconds: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            server_url: other.server_url.or(self.server_url),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            key_file: other.key_file.or(self.key_file),
            startup_grace_seconds: other.startup_grace_seconds.or(self.startup_grace_seconds),
            min_connect_bytes: other.min_connect_bytes.or(self.min_connect_bytes),
            min_contiguous_bytes: other.min_contiguous_bytes.or(self.min_contiguous_bytes),
            min_stay_connected_bytes: other
                .min_stay_connected_bytes
                .or(self.min_stay_connected_bytes),
            pause_disconnect_bytes: other.pause_disconnect_bytes.or(self.pause_disconnect_bytes),
            heartbeat_interval_seconds: other
                .heartbeat_interval_seconds
                .or(self.heartbeat_interval_seconds),
            heartbeat_timeout_seconds: other
                .heartbeat_timeout_seconds
                .or(self.heartbeat_timeout_seconds),
            queue_capacity: other.queue_capacity.or(self.queue_capacity),
            memory_pool_bytes: other.memory_pool_bytes.or(self.memory_pool_bytes),
            status_interval_seconds: other
                .status_interval_seconds
                .or(self.status_interval_seconds),
        }
    }
}

pub fn load_config() -> Config {
    // 1. Load defaults. The memory thresholds keep their firmware-tuned
    //    values unless overridden for the host's pool size.
    let default_config = Config {
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        startup_grace_seconds: Some(15),
        min_connect_bytes: Some(40_000),
        min_contiguous_bytes: Some(16_384),
        min_stay_connected_bytes: Some(28_000),
        pause_disconnect_bytes: Some(35_000),
        heartbeat_interval_seconds: Some(15),
        heartbeat_timeout_seconds: Some(8),
        queue_capacity: Some(16),
        memory_pool_bytes: Some(120_000),
        status_interval_seconds: Some(60),
        ..Default::default()
    };

    // 2. Load from config file (gateway.conf) if present.
    //    Allow overriding default config file path with CLI arg.
    let cli_args_for_path = Config::parse(); // Parse CLI to get potential config_path override early

    let config_file_path = cli_args_for_path
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("gateway.conf"));

    let mut current_config = default_config;

    if config_file_path.exists() {
        if let Ok(config_str) = fs::read_to_string(&config_file_path) {
            if let Ok(file_config) = serde_json::from_str::<Config>(&config_str) {
                current_config = current_config.merge(file_config);
            } else {
                log::warn!(
                    "Failed to parse config file: {}. Falling back to other sources.",
                    config_file_path.display()
                );
            }
        } else {
            log::warn!(
                "Failed to read config file: {}. Falling back to other sources.",
                config_file_path.display()
            );
        }
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    // 3. Override with environment variables and CLI arguments.
    //    clap::Parser handles env vars and CLI args in one pass.
    let cli_args_final = Config::parse();
    current_config = current_config.merge(cli_args_final);

    // 4. Apply the default identity path if not already set.
    if current_config.key_file.is_none() {
        if let Some(home_dir) = dirs::home_dir() {
            current_config.key_file = Some(home_dir.join(".config/gateway/device.json"));
        } else {
            log::warn!("Could not determine home directory for the default identity path.");
        }
    }

    current_config
}
