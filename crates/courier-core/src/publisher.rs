//! Reply publisher
//!
//! Sends a handler's response back to the requester over the channel the
//! request arrived on.

use courier_transport::Channel;
use courier_types::{OutboundResponse, Result};
use tracing::debug;

/// Replies are addressed by queue name through the default exchange
pub const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplyPublisher;

impl ReplyPublisher {
    pub fn new() -> Self {
        Self
    }

    /// Transmit `response` to `destination`
    ///
    /// Transport failures are returned to the caller untouched.
    pub async fn publish(
        &self,
        channel: &dyn Channel,
        response: OutboundResponse,
        destination: &str,
    ) -> Result<()> {
        let OutboundResponse { body, properties } = response;

        debug!(
            channel = channel.id(),
            destination = %destination,
            correlation_id = ?properties.correlation_id,
            size = body.len(),
            "Publishing reply"
        );

        channel
            .publish(DEFAULT_EXCHANGE, destination, body, properties)
            .await
    }
}
