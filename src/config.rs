//! Configuration
//!
//! Client and relay settings. Every field has a default so a client can start
//! with zero configuration against a local relay; the environment or a JSON
//! document can override any of them.

use crate::peer::IceServer;
use rand::Rng;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

// ============================================================================
// RECONNECT POLICY
// ============================================================================

/// Exponential backoff used for the initial connect and for reconnects
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Attempts after a lost connection before the bus gives up (`Closed`)
    pub max_attempts: u32,
    /// Fraction of the delay randomly added or removed (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 15_000,
            max_attempts: 8,
            jitter: 0.2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base == 0 {
            return Duration::from_millis(base);
        }

        let spread = (base as f64 * jitter) as i64;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((base as i64 + offset).max(0) as u64)
    }
}

// ============================================================================
// CLIENT CONFIG
// ============================================================================

/// Settings for one connected client
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the coordinating server (http(s) or ws(s))
    pub signaling_url: String,
    /// Base URL of the REST channel/message store
    pub api_url: String,
    /// Bearer token handed out by the external auth flow
    pub auth_token: Option<String>,
    pub ice_servers: Vec<IceServer>,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_secs: u64,
    /// Frames held while the bus is reconnecting
    pub outbound_queue_limit: usize,
    pub default_channel: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: "http://127.0.0.1:8787".to_string(),
            api_url: "http://127.0.0.1:8001".to_string(),
            auth_token: None,
            ice_servers: IceServer::default_stun(),
            reconnect: ReconnectPolicy::default(),
            heartbeat_secs: 25,
            outbound_queue_limit: 256,
            default_channel: "general".to_string(),
        }
    }
}

impl ClientConfig {
    /// Parses a JSON document; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Defaults overridden by `CONVOTALK_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("CONVOTALK_SIGNALING_URL") {
            config.signaling_url = url;
        }
        if let Ok(url) = std::env::var("CONVOTALK_API_URL") {
            config.api_url = url;
        }
        if let Ok(token) = std::env::var("CONVOTALK_TOKEN") {
            config.auth_token = Some(token);
        }
        if let Ok(channel) = std::env::var("CONVOTALK_DEFAULT_CHANNEL") {
            config.default_channel = channel;
        }
        if let Ok(secs) = std::env::var("CONVOTALK_HEARTBEAT_SECS") {
            config.heartbeat_secs = secs.parse().map_err(|_| ConfigError::InvalidValue {
                key: "CONVOTALK_HEARTBEAT_SECS",
                value: secs,
            })?;
        }

        // Optional TURN server on top of the public STUN defaults
        if let Ok(url) = std::env::var("CONVOTALK_TURN_URL") {
            config.ice_servers.push(IceServer {
                urls: vec![url],
                username: std::env::var("CONVOTALK_TURN_USERNAME").ok(),
                credential: std::env::var("CONVOTALK_TURN_CREDENTIAL").ok(),
            });
        }

        Ok(config)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

// ============================================================================
// RELAY CONFIG
// ============================================================================

/// Settings for the `convotalk-relay` binary
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Env: `RELAY_ADDR`, default `0.0.0.0:8787`
    pub listen_addr: SocketAddr,
    /// Messages returned by a history fetch. Env: `RELAY_HISTORY_LIMIT`
    pub history_limit: usize,
    /// Routed call envelopes kept for inspection, oldest dropped first.
    /// Env: `RELAY_JOURNAL_LIMIT`
    pub journal_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 8787).into(),
            history_limit: 50,
            journal_limit: 256,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("RELAY_ADDR") {
            config.listen_addr = addr.parse().map_err(|_| ConfigError::InvalidValue {
                key: "RELAY_ADDR",
                value: addr,
            })?;
        }
        if let Ok(limit) = std::env::var("RELAY_HISTORY_LIMIT") {
            config.history_limit = limit.parse().map_err(|_| ConfigError::InvalidValue {
                key: "RELAY_HISTORY_LIMIT",
                value: limit,
            })?;
        }
        if let Ok(limit) = std::env::var("RELAY_JOURNAL_LIMIT") {
            config.journal_limit = limit.parse().map_err(|_| ConfigError::InvalidValue {
                key: "RELAY_JOURNAL_LIMIT",
                value: limit,
            })?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            max_attempts: 10,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let policy = ReconnectPolicy {
            initial_delay_ms: 1_000,
            max_delay_ms: 1_000,
            max_attempts: 1,
            jitter: 0.5,
        };
        for _ in 0..50 {
            let delay = policy.delay_for(1).as_millis();
            assert!((500..=1_500).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            ClientConfig::from_json(r#"{"signaling_url": "wss://relay.example", "heartbeat_secs": 5}"#)
                .unwrap();
        assert_eq!(config.signaling_url, "wss://relay.example");
        assert_eq!(config.heartbeat_secs, 5);
        assert_eq!(config.default_channel, "general");
        assert!(!config.ice_servers.is_empty());
    }

    #[test]
    fn test_invalid_json_is_reported() {
        assert!(matches!(
            ClientConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
