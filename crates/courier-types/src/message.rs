//! Message types for Courier
//!
//! Defines the envelope carried by a transport, its properties, and the
//! response a handler hands back for publication.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;
use uuid::Uuid;

/// Unique identifier for a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Create a new random MessageId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport-level properties attached to a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MessageProperties {
    /// Publisher-assigned message identifier
    #[serde(default)]
    pub message_id: Option<MessageId>,

    /// Opaque token matching a reply to its request
    #[serde(default)]
    pub correlation_id: Option<String>,

    /// Queue the sender expects the reply on
    #[serde(default)]
    pub reply_to: Option<String>,

    /// Content type (e.g., "application/json")
    #[serde(default)]
    pub content_type: Option<String>,

    /// Custom headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// When the message was published
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl MessageProperties {
    /// Set the reply destination
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Set the correlation token
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Add a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A message as routed by a transport, before it is tied to a channel
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Envelope {
    /// Exchange the message was published to ("" is the default exchange)
    pub exchange: String,

    /// Routing key the message was published with
    pub routing_key: String,

    /// Message body (opaque bytes)
    #[serde(with = "bytes_serde")]
    #[schema(value_type = String)]
    pub body: Bytes,

    /// Message properties
    #[serde(default)]
    pub properties: MessageProperties,
}

impl Envelope {
    /// Create an envelope for the given exchange and routing key
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body: body.into(),
            properties: MessageProperties::default(),
        }
    }

    /// Replace the properties
    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Get the body as a string (if valid UTF-8)
    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// A response produced by a handler
///
/// Ownership passes to the reply publisher, which transmits and drops it.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OutboundResponse {
    /// Response body (opaque bytes)
    #[serde(with = "bytes_serde")]
    #[schema(value_type = String)]
    pub body: Bytes,

    /// Response properties; the correlation id is overwritten on reply
    #[serde(default)]
    pub properties: MessageProperties,
}

impl OutboundResponse {
    /// Create a new response with the given body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            properties: MessageProperties::default(),
        }
    }

    /// Create a new response with JSON content
    pub fn json<T: Serialize>(data: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(data)?;
        Ok(Self::new(body).with_content_type("application/json"))
    }

    /// Set content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    /// Add a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.headers.insert(key.into(), value.into());
        self
    }

    /// Get the body as a string (if valid UTF-8)
    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Custom serialization for Bytes
///
/// UTF-8 bodies are written as a plain string, anything else as
/// `{"base64": "..."}` so opaque bodies survive a round trip unchanged.
mod bytes_serde {
    use base64::Engine;
    use bytes::Bytes;
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Encoded {
        Text(String),
        Binary { base64: String },
    }

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match std::str::from_utf8(bytes) {
            Ok(s) => s.serialize(serializer),
            Err(_) => Encoded::Binary {
                base64: base64::engine::general_purpose::STANDARD.encode(bytes),
            }
            .serialize(serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Encoded::deserialize(deserializer)? {
            Encoded::Text(s) => Ok(Bytes::from(s)),
            Encoded::Binary { base64 } => base64::engine::general_purpose::STANDARD
                .decode(base64)
                .map(Bytes::from)
                .map_err(de::Error::custom),
        }
    }
}
