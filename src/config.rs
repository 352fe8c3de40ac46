use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::error::AppError;

/// APNs provider credentials; absent when iOS push is disabled.
#[derive(Debug, Clone)]
pub struct ApnsConfig {
    pub key_id: String,
    pub team_id: String,
    /// PEM-encoded P-256 private key.
    pub private_key_pem: String,
    pub production: bool,
    pub topic: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: String,

    /// Server-to-device heartbeat interval.
    pub ws_ping_interval: Duration,
    /// Teardown deadline when no pong arrives.
    pub ws_pong_timeout: Duration,
    /// Per-connection outgoing queue capacity.
    pub ws_queue_size: usize,

    pub enable_https: bool,
    pub cert_file: String,
    pub key_file: String,

    /// Housekeeping: messages older than this are swept.
    pub message_ttl: Duration,

    pub apns: Option<ApnsConfig>,
}

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DB_PATH: &str = "./data/pushrelay.db";
const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
const DEFAULT_PONG_TIMEOUT_SECS: u64 = 60;
const DEFAULT_QUEUE_SIZE: usize = 256;
const DEFAULT_MESSAGE_TTL_DAYS: u64 = 7;
const DEFAULT_APNS_TOPIC: &str = "me.fin.bark";

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let host = env::var("PUSHRELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port = env_parse("PUSHRELAY_PORT", DEFAULT_PORT);
        let db_path = env::var("PUSHRELAY_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.into());

        let ws_ping_interval = Duration::from_secs(env_parse(
            "PUSHRELAY_WS_PING_INTERVAL",
            DEFAULT_PING_INTERVAL_SECS,
        ));
        let ws_pong_timeout = Duration::from_secs(env_parse(
            "PUSHRELAY_WS_PONG_TIMEOUT",
            DEFAULT_PONG_TIMEOUT_SECS,
        ));
        let ws_queue_size = env_parse("PUSHRELAY_WS_QUEUE_SIZE", DEFAULT_QUEUE_SIZE);

        let enable_https = env::var("PUSHRELAY_ENABLE_HTTPS")
            .map(|v| v == "true")
            .unwrap_or(false);
        let cert_file = env::var("PUSHRELAY_CERT_FILE").unwrap_or_default();
        let key_file = env::var("PUSHRELAY_KEY_FILE").unwrap_or_default();
        if enable_https && (cert_file.is_empty() || key_file.is_empty()) {
            return Err(AppError::Config(
                "PUSHRELAY_ENABLE_HTTPS requires PUSHRELAY_CERT_FILE and PUSHRELAY_KEY_FILE".into(),
            ));
        }

        let message_ttl = Duration::from_secs(
            env_parse("PUSHRELAY_MESSAGE_TTL_DAYS", DEFAULT_MESSAGE_TTL_DAYS) * 24 * 3600,
        );

        let apns = Self::apns_from_env();

        Ok(Self {
            host,
            port,
            db_path,
            ws_ping_interval,
            ws_pong_timeout,
            ws_queue_size,
            enable_https,
            cert_file,
            key_file,
            message_ttl,
            apns,
        })
    }

    fn apns_from_env() -> Option<ApnsConfig> {
        let key_id = env::var("APNS_KEY_ID").ok()?;
        let team_id = env::var("APNS_TEAM_ID").ok()?;
        // Keys handed over as env values often carry literal \n escapes.
        let private_key_pem = env::var("APNS_PRIVATE_KEY").ok()?.replace("\\n", "\n");
        if key_id.is_empty() || team_id.is_empty() || private_key_pem.is_empty() {
            return None;
        }
        let production = env::var("APNS_PRODUCTION")
            .map(|v| v != "false")
            .unwrap_or(true);
        let topic = env::var("APNS_TOPIC").unwrap_or_else(|_| DEFAULT_APNS_TOPIC.into());
        Some(ApnsConfig {
            key_id,
            team_id,
            private_key_pem,
            production,
            topic,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[cfg(test)]
    pub fn test_defaults() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            db_path: ":memory:".into(),
            ws_ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            ws_pong_timeout: Duration::from_secs(DEFAULT_PONG_TIMEOUT_SECS),
            ws_queue_size: DEFAULT_QUEUE_SIZE,
            enable_https: false,
            cert_file: String::new(),
            key_file: String::new(),
            message_ttl: Duration::from_secs(DEFAULT_MESSAGE_TTL_DAYS * 24 * 3600),
            apns: None,
        }
    }
}
