//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` (default: `"0.0.0.0"`), `PORT` (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `json` for JSON lines, anything else for text
/// - `DATABASE_URL`: Postgres ledger and compensation log when set
/// - `REDIS_URL`: Redis counter store when set
/// - `LOCK_TIMEOUT_MS` (3000), `PAYMENT_TIMEOUT_MS` (5000)
/// - `PAYMENT_FAILURE_RATE` (0.1), `PAYMENT_MIN_LATENCY_MS` (100),
///   `PAYMENT_MAX_LATENCY_MS` (500): mock payment adapter behavior
/// - `QUEUE_ENTRY_TTL_SECS` (600), `QUEUE_TICK_MS` (1000)
/// - `COMPENSATION_RETRY_SECS` (60): pending refund sweep interval
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub lock_timeout: Duration,
    pub payment_timeout: Duration,
    pub payment_failure_rate: f64,
    pub payment_min_latency: Duration,
    pub payment_max_latency: Duration,
    pub queue_entry_ttl: Duration,
    pub queue_tick: Duration,
    pub compensation_retry_interval: Duration,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let log_format = match std::env::var("LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: env_or("PORT", defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format,
            database_url: env_opt("DATABASE_URL"),
            redis_url: env_opt("REDIS_URL"),
            lock_timeout: Duration::from_millis(env_or("LOCK_TIMEOUT_MS", 3000)),
            payment_timeout: Duration::from_millis(env_or("PAYMENT_TIMEOUT_MS", 5000)),
            payment_failure_rate: env_or("PAYMENT_FAILURE_RATE", defaults.payment_failure_rate)
                .clamp(0.0, 1.0),
            payment_min_latency: Duration::from_millis(env_or("PAYMENT_MIN_LATENCY_MS", 100)),
            payment_max_latency: Duration::from_millis(env_or("PAYMENT_MAX_LATENCY_MS", 500)),
            queue_entry_ttl: Duration::from_secs(env_or("QUEUE_ENTRY_TTL_SECS", 600)),
            queue_tick: Duration::from_millis(env_or::<u64>("QUEUE_TICK_MS", 1000).max(1)),
            compensation_retry_interval: Duration::from_secs(
                env_or::<u64>("COMPENSATION_RETRY_SECS", 60).max(1),
            ),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            redis_url: None,
            lock_timeout: Duration::from_millis(3000),
            payment_timeout: Duration::from_millis(5000),
            payment_failure_rate: 0.1,
            payment_min_latency: Duration::from_millis(100),
            payment_max_latency: Duration::from_millis(500),
            queue_entry_ttl: Duration::from_secs(600),
            queue_tick: Duration::from_millis(1000),
            compensation_retry_interval: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.database_url.is_none());
        assert_eq!(config.lock_timeout, Duration::from_secs(3));
        assert_eq!(config.payment_timeout, Duration::from_secs(5));
        assert_eq!(config.queue_entry_ttl, Duration::from_secs(600));
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_addr_default() {
        let config = Config::default();
        assert_eq!(config.addr(), "0.0.0.0:3000");
    }
}
