use std::env;
use std::time::Duration;

/// Data-message lifetime defaults, taken from the wire protocol:
/// chat messages may be retried for up to five minutes, control
/// commands for one minute.
const DEFAULT_CHAT_LIFETIME_MS: u64 = 300_000;
const DEFAULT_CONTROL_LIFETIME_MS: u64 = 60_000;

pub struct Config {
    pub backend: BackendConfig,
    pub protocol: ProtocolConfig,
}

pub struct BackendConfig {
    pub api_base_url: String,
    pub http_timeout: Duration,
}

pub struct ProtocolConfig {
    pub chat_lifetime_ms: u64,
    pub control_lifetime_ms: u64,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            backend: BackendConfig {
                api_base_url: env::var("EXAMGUARD_API_BASE_URL")
                    .unwrap_or_else(|_| "http://127.0.0.1:8000/api".to_string()),
                http_timeout: Duration::from_secs(
                    env::var("EXAMGUARD_HTTP_TIMEOUT_SECS")
                        .unwrap_or_else(|_| "10".to_string())
                        .parse()
                        .unwrap_or(10),
                ),
            },
            protocol: ProtocolConfig {
                chat_lifetime_ms: env::var("EXAMGUARD_CHAT_LIFETIME_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_CHAT_LIFETIME_MS),
                control_lifetime_ms: env::var("EXAMGUARD_CONTROL_LIFETIME_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_CONTROL_LIFETIME_MS),
            },
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            chat_lifetime_ms: DEFAULT_CHAT_LIFETIME_MS,
            control_lifetime_ms: DEFAULT_CONTROL_LIFETIME_MS,
        }
    }
}
