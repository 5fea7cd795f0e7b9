//! Binding types for Courier
//!
//! Describes how a queue is declared and bound to an exchange.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Unique identifier for a queue binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct BindingId(pub Uuid);

impl BindingId {
    /// Create a new random BindingId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BindingId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BindingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an exchange routes messages to bound queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Exact routing key match
    Direct,
    /// Dot-separated pattern match with `*` and `#`
    Topic,
    /// Every bound queue receives every message
    Fanout,
}

impl Default for ExchangeKind {
    fn default() -> Self {
        Self::Topic
    }
}

/// Queue declaration options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct QueueOptions {
    /// Survive broker restarts
    #[serde(default)]
    pub durable: bool,

    /// Owned by the declaring connection
    #[serde(default)]
    pub exclusive: bool,

    /// Only check that the queue exists; never create it
    #[serde(default)]
    pub passive: bool,

    /// Delete the queue once its last consumer goes away
    #[serde(default)]
    pub auto_delete: bool,

    /// Broker-specific arguments
    #[serde(default)]
    #[schema(value_type = Object)]
    pub arguments: HashMap<String, serde_json::Value>,
}

impl QueueOptions {
    /// Whether two declarations describe the same queue shape
    ///
    /// `passive` is a declare-time flag and is not part of the queue shape.
    pub fn is_compatible_with(&self, other: &QueueOptions) -> bool {
        self.durable == other.durable
            && self.exclusive == other.exclusive
            && self.auto_delete == other.auto_delete
            && self.arguments == other.arguments
    }
}

/// Everything needed to declare a queue and bind it to an exchange
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BindingSpec {
    /// Queue name; empty asks the transport to generate one
    #[serde(default)]
    pub queue: String,

    /// Exchange to bind to
    pub exchange: String,

    /// Routing pattern used for the binding
    pub routing_pattern: String,

    /// Queue declaration options
    #[serde(default)]
    pub options: QueueOptions,

    /// Deadline for declare + bind, in milliseconds
    #[serde(default)]
    pub declare_timeout_ms: Option<u64>,

    /// Declare on a freshly opened channel instead of the shared one
    #[serde(default)]
    pub dedicated_channel: bool,
}

impl BindingSpec {
    /// Create a binding spec with default options
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_pattern: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_pattern: routing_pattern.into(),
            options: QueueOptions::default(),
            declare_timeout_ms: None,
            dedicated_channel: false,
        }
    }

    /// Replace the queue options
    pub fn with_options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the declare timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.declare_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Declare on a dedicated channel
    pub fn on_dedicated_channel(mut self) -> Self {
        self.dedicated_channel = true;
        self
    }

    /// Declare timeout as a Duration
    pub fn declare_timeout(&self) -> Option<Duration> {
        self.declare_timeout_ms.map(Duration::from_millis)
    }
}

/// Public description of a live binding
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BindingInfo {
    /// Binding identifier
    pub id: BindingId,
    /// Resolved queue name
    pub queue: String,
    /// Exchange the queue is bound to
    pub exchange: String,
    /// Routing pattern of the binding
    pub routing_pattern: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_spec_defaults() {
        let spec = BindingSpec::new("work", "events", "greet.*");
        assert_eq!(spec.queue, "work");
        assert!(!spec.options.durable);
        assert!(!spec.dedicated_channel);
        assert!(spec.declare_timeout().is_none());
    }

    #[test]
    fn test_binding_spec_from_json() {
        let spec: BindingSpec = serde_json::from_str(
            r##"{"exchange": "events", "routing_pattern": "#", "options": {"durable": true}}"##,
        )
        .unwrap();
        assert_eq!(spec.queue, "");
        assert_eq!(spec.routing_pattern, "#");
        assert!(spec.options.durable);
        assert!(!spec.options.passive);
    }

    #[test]
    fn test_passive_flag_does_not_affect_compatibility() {
        let declared = QueueOptions {
            durable: true,
            ..Default::default()
        };
        let passive = QueueOptions {
            durable: true,
            passive: true,
            ..Default::default()
        };
        assert!(declared.is_compatible_with(&passive));

        let other = QueueOptions::default();
        assert!(!declared.is_compatible_with(&other));
    }
}
