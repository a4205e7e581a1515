// src/config.rs
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::error::{AmiError, AmiResult};

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: String,
    pub ami: AmiConfig,
    pub monitor: MonitorConfig,
}

/// AMI endpoint and protocol tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct AmiConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    /// Deadline for the Login action, distinct from query timeouts.
    pub auth_timeout: Duration,
    /// Per-action deadline for status queries.
    pub query_timeout: Duration,
    /// Window after a terminal Response during which trailing events
    /// tagged with the same ActionID are still folded in.
    pub grace_period: Duration,
    /// Interval between keepalive pings on an idle connection.
    pub keepalive_interval: Duration,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// Consecutive failed attempts before the client reports itself
    /// permanently failed.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Extensions to monitor when no external provider is wired in.
    pub extensions: Vec<String>,
    /// Dialplan context the extensions live in.
    pub context: String,
    pub poll_interval: Duration,
    pub strategy: QueryStrategy,
}

/// How a synchronization cycle queries extension state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStrategy {
    /// One ExtensionState action per monitored extension, issued in parallel.
    Individual,
    /// A single ExtensionStateList action for the whole context.
    Bulk,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn from_env() -> AmiResult<Self> {
        dotenv::dotenv().ok();

        let ami = AmiConfig {
            host: env::var("AMI_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("AMI_PORT")
                .unwrap_or_else(|_| "5038".to_string())
                .parse()
                .map_err(|e| AmiError::Config(format!("AMI_PORT: {}", e)))?,
            username: required_from_env("AMI_USERNAME")?,
            secret: required_from_env("AMI_SECRET")?,
            auth_timeout: duration_from_env("AMI_AUTH_TIMEOUT_MS", 10_000)?,
            query_timeout: duration_from_env("AMI_QUERY_TIMEOUT_MS", 5_000)?,
            grace_period: duration_from_env("AMI_GRACE_MS", 500)?,
            keepalive_interval: duration_from_env("AMI_KEEPALIVE_MS", 20_000)?,
            reconnect: ReconnectConfig {
                max_attempts: env::var("AMI_RECONNECT_ATTEMPTS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .map_err(|e| AmiError::Config(format!("AMI_RECONNECT_ATTEMPTS: {}", e)))?,
                initial_delay: duration_from_env("AMI_RECONNECT_DELAY_MS", 1_000)?,
                max_delay: duration_from_env("AMI_RECONNECT_MAX_DELAY_MS", 60_000)?,
            },
        };

        let monitor = MonitorConfig {
            extensions: Self::parse_extension_list(
                &env::var("MONITOR_EXTENSIONS").unwrap_or_default(),
            ),
            context: env::var("MONITOR_CONTEXT")
                .unwrap_or_else(|_| "from-internal".to_string()),
            poll_interval: duration_from_env("MONITOR_POLL_INTERVAL_MS", 15_000)?,
            strategy: match env::var("AMI_QUERY_STRATEGY").as_deref() {
                Ok("bulk") => QueryStrategy::Bulk,
                _ => QueryStrategy::Individual,
            },
        };

        Ok(Config {
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "production".to_string()),
            ami,
            monitor,
        })
    }

    fn parse_extension_list(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect()
    }
}

fn required_from_env(key: &str) -> AmiResult<String> {
    env::var(key).map_err(|_| AmiError::Config(format!("{} is not set", key)))
}

fn duration_from_env(key: &str, default_ms: u64) -> AmiResult<Duration> {
    let ms: u64 = match env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|e| AmiError::Config(format!("{}: {}", key, e)))?,
        Err(_) => default_ms,
    };
    Ok(Duration::from_millis(ms))
}
