//! Worker configuration
//!
//! Read from the JSON file named by `COURIER_CONFIG` when set, otherwise
//! defaults. `COURIER_ADDR` overrides the admin API address either way.

use std::path::Path;

use anyhow::Context;
use courier_types::ConsumerConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Admin API listen address
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Topic exchange the worker binds to
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Queue the worker consumes
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Routing pattern binding the queue to the exchange
    #[serde(default = "default_routing_pattern")]
    pub routing_pattern: String,

    /// Queue collecting replies for requests injected through the API
    #[serde(default = "default_reply_queue")]
    pub reply_queue: String,

    #[serde(default)]
    pub consumer: ConsumerConfig,
}

fn default_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_exchange() -> String {
    "courier".to_string()
}

fn default_queue() -> String {
    "courier.work".to_string()
}

fn default_routing_pattern() -> String {
    "#".to_string()
}

fn default_reply_queue() -> String {
    "courier.replies".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            exchange: default_exchange(),
            queue: default_queue(),
            routing_pattern: default_routing_pattern(),
            reply_queue: default_reply_queue(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from the environment
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = match std::env::var("COURIER_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };

        if let Ok(addr) = std::env::var("COURIER_ADDR") {
            config.addr = addr;
        }

        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"queue": "orders", "consumer": {"max_in_flight": 8}}"#,
        )
        .unwrap();

        assert_eq!(config.queue, "orders");
        assert_eq!(config.exchange, "courier");
        assert_eq!(config.addr, "127.0.0.1:3000");
        assert_eq!(config.consumer.max_in_flight, 8);
        assert_eq!(config.consumer.shutdown_timeout_secs, 30);
    }
}
