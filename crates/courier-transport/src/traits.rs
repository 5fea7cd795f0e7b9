//! Transport trait definitions
//!
//! Defines the narrow interface the dispatcher needs from a broker client.
//! Connection management, reconnection and wire encoding live behind these
//! traits.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_types::{Envelope, MessageProperties, QueueOptions, Result};

/// An open connection to a broker
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a new channel on this connection
    async fn open_channel(&self) -> Result<Arc<dyn Channel>>;

    /// Whether the connection is still usable
    fn is_open(&self) -> bool;
}

/// A channel multiplexed over a connection
///
/// Implementations must accept concurrent `publish` calls; any single-writer
/// discipline the wire protocol needs is enforced here, not by callers.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel number, unique within its connection
    fn id(&self) -> u64;

    /// Whether the channel is still usable
    fn is_open(&self) -> bool;

    /// Declare (or passively check) a queue
    ///
    /// An empty name asks the broker to generate one; the handle reports the
    /// resolved name.
    async fn declare_queue(&self, name: &str, options: &QueueOptions)
        -> Result<Box<dyn QueueHandle>>;

    /// Publish a message; the default exchange is ""
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: MessageProperties,
    ) -> Result<()>;

    /// Close the channel; consumers on it stop receiving
    async fn close(&self) -> Result<()>;
}

/// A declared queue
#[async_trait]
pub trait QueueHandle: Send + Sync {
    /// Resolved queue name
    fn name(&self) -> &str;

    /// Bind the queue to an exchange with a routing pattern
    async fn bind(&self, exchange: &str, routing_pattern: &str) -> Result<()>;

    /// Start a new consumer on the queue
    ///
    /// Each call yields an independent stream.
    async fn consume(&self) -> Result<Box<dyn DeliveryStream>>;
}

/// Lazily produced deliveries from one queue
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery, or `None` once the queue, channel or connection closes
    async fn next(&mut self) -> Option<InboundMessage>;
}

/// One delivered message, tied to the channel it arrived on
#[derive(Clone)]
pub struct InboundMessage {
    envelope: Envelope,
    queue: String,
    delivery_tag: u64,
    channel: Arc<dyn Channel>,
}

impl InboundMessage {
    /// Wrap a routed envelope as a delivery on `channel`
    pub fn new(
        envelope: Envelope,
        queue: impl Into<String>,
        delivery_tag: u64,
        channel: Arc<dyn Channel>,
    ) -> Self {
        Self {
            envelope,
            queue: queue.into(),
            delivery_tag,
            channel,
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.envelope.routing_key
    }

    pub fn exchange(&self) -> &str {
        &self.envelope.exchange
    }

    /// Queue the message was consumed from
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn body(&self) -> &Bytes {
        &self.envelope.body
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.envelope.properties
    }

    /// Reply destination; an empty one counts as absent
    pub fn reply_to(&self) -> Option<&str> {
        self.envelope
            .properties
            .reply_to
            .as_deref()
            .filter(|reply_to| !reply_to.is_empty())
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.envelope.properties.correlation_id.as_deref()
    }

    /// Channel the message arrived on; replies go out on the same one
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Get the body as a string (if valid UTF-8)
    pub fn body_as_str(&self) -> Option<&str> {
        self.envelope.body_as_str()
    }
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("envelope", &self.envelope)
            .field("queue", &self.queue)
            .field("delivery_tag", &self.delivery_tag)
            .field("channel", &self.channel.id())
            .finish()
    }
}
