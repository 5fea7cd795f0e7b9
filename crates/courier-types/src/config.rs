//! Consumer configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConsumerConfig {
    /// Maximum concurrently running dispatch units (0 = unlimited)
    #[serde(default)]
    pub max_in_flight: usize,

    /// Per-handler deadline in seconds (0 = no deadline)
    #[serde(default)]
    pub handler_timeout_secs: u64,

    /// How long shutdown waits for in-flight dispatch units
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 0,
            handler_timeout_secs: 0,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl ConsumerConfig {
    /// Handler deadline, if one is configured
    pub fn handler_timeout(&self) -> Option<Duration> {
        (self.handler_timeout_secs > 0).then(|| Duration::from_secs(self.handler_timeout_secs))
    }

    /// Drain deadline used by graceful shutdown
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
