//! Configuration management for the exit engine.

use crate::{Error, Result};
use chrono_tz::Tz;
use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub engine: EngineConfig,
    pub ticker: TickerConfig,
    pub encryption: EncryptionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Broker REST and streaming endpoints.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub api_base: String,
    /// Streaming endpoint. `None` forces the LTP polling fallback.
    pub ws_url: Option<String>,
    pub http_timeout: Duration,
}

/// Per-user engine loop intervals and failure policy.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub position_poll_interval: Duration,
    pub price_poll_interval: Duration,
    pub rules_refresh_interval: Duration,
    /// Consecutive broker-auth failures before the engine pauses and waits
    /// for a fresh client.
    pub auth_failure_threshold: u32,
    /// Delay between client re-issue attempts while paused.
    pub reconnect_probe_interval: Duration,
    /// Time zone used for all trading-window comparisons.
    pub timezone: Tz,
}

/// WebSocket ticker connection policy.
#[derive(Debug, Clone)]
pub struct TickerConfig {
    pub connect_timeout: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_max_tries: u32,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

/// Credential encryption settings.
#[derive(Debug, Clone)]
pub struct EncryptionConfig {
    pub master_secret: String,
    pub salt: String,
    pub kdf_iterations: u32,
}

/// Hard ceiling on reconnect attempts, regardless of configuration.
pub const RECONNECT_TRIES_CAP: u32 = 300;

const DEFAULT_API_BASE: &str = "https://api.kite.trade";
const DEFAULT_WS_URL: &str = "wss://ws.kite.trade";

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            position_poll_interval: Duration::from_secs(1),
            price_poll_interval: Duration::from_secs(1),
            rules_refresh_interval: Duration::from_secs(1),
            auth_failure_threshold: 3,
            reconnect_probe_interval: Duration::from_secs(5),
            timezone: chrono_tz::Asia::Kolkata,
        }
    }
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_max_tries: 50,
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            ws_url: Some(DEFAULT_WS_URL.to_string()),
            http_timeout: Duration::from_secs(7),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let timezone = match env::var("ENGINE_TIMEZONE") {
            Ok(name) => name
                .parse::<Tz>()
                .map_err(|_| Error::Config(format!("unknown time zone: {name}")))?,
            Err(_) => chrono_tz::Asia::Kolkata,
        };

        Ok(Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .map_err(|_| Error::Config("DATABASE_URL environment variable not set".to_string()))?,
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 5),
            },
            broker: BrokerConfig {
                api_base: env::var("BROKER_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
                ws_url: match env::var("BROKER_WS_URL") {
                    Ok(url) if url.is_empty() => None,
                    Ok(url) => Some(url),
                    Err(_) => Some(DEFAULT_WS_URL.to_string()),
                },
                http_timeout: env_duration("BROKER_HTTP_TIMEOUT_SECS", 7.0),
            },
            engine: EngineConfig {
                position_poll_interval: env_duration("POSITION_POLL_INTERVAL_SECS", 1.0),
                price_poll_interval: env_duration("PRICE_POLL_INTERVAL_SECS", 1.0),
                rules_refresh_interval: env_duration("RULES_REFRESH_INTERVAL_SECS", 1.0),
                auth_failure_threshold: env_parse("AUTH_FAILURE_THRESHOLD", 3),
                reconnect_probe_interval: env_duration("RECONNECT_PROBE_INTERVAL_SECS", 5.0),
                timezone,
            },
            ticker: TickerConfig {
                connect_timeout: env_duration("TICKER_CONNECT_TIMEOUT_SECS", 30.0),
                reconnect_max_delay: env_duration("TICKER_RECONNECT_MAX_DELAY_SECS", 60.0),
                reconnect_max_tries: env_parse::<u32>("TICKER_RECONNECT_MAX_TRIES", 50)
                    .min(RECONNECT_TRIES_CAP),
                ping_interval: env_duration("TICKER_PING_INTERVAL_SECS", 30.0),
                pong_timeout: env_duration("TICKER_PONG_TIMEOUT_SECS", 10.0),
            },
            encryption: EncryptionConfig {
                master_secret: env::var("ENCRYPTION_KEY")
                    .map_err(|_| Error::Config("ENCRYPTION_KEY environment variable not set".to_string()))?,
                salt: env::var("ENCRYPTION_SALT").unwrap_or_else(|_| "trading-api-salt".to_string()),
                kdf_iterations: env_parse("ENCRYPTION_KDF_ITERATIONS", 480_000),
            },
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_duration(key: &str, default_secs: f64) -> Duration {
    Duration::from_secs_f64(env_parse(key, default_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.position_poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.auth_failure_threshold, 3);
        assert_eq!(cfg.timezone, chrono_tz::Asia::Kolkata);
    }

    #[test]
    fn test_ticker_defaults() {
        let cfg = TickerConfig::default();
        assert_eq!(cfg.connect_timeout, Duration::from_secs(30));
        assert_eq!(cfg.reconnect_max_delay, Duration::from_secs(60));
        assert_eq!(cfg.reconnect_max_tries, 50);
        assert!(cfg.reconnect_max_tries <= RECONNECT_TRIES_CAP);
    }
}
