//! Demo message handlers

use async_trait::async_trait;
use courier_core::Handler;
use courier_transport::InboundMessage;
use courier_types::OutboundResponse;
use tracing::info;

/// Replies "hi, <body>"
pub struct GreetHandler;

#[async_trait]
impl Handler for GreetHandler {
    async fn handle(&self, message: &InboundMessage) -> anyhow::Result<Option<OutboundResponse>> {
        let name = message
            .body_as_str()
            .ok_or_else(|| anyhow::anyhow!("greet body is not UTF-8"))?;

        Ok(Some(
            OutboundResponse::new(format!("hi, {}", name)).with_content_type("text/plain"),
        ))
    }
}

/// Logs the body and never replies
pub struct LogHandler;

#[async_trait]
impl Handler for LogHandler {
    async fn handle(&self, message: &InboundMessage) -> anyhow::Result<Option<OutboundResponse>> {
        info!(
            queue = %message.queue(),
            size = message.body().len(),
            body = message.body_as_str().unwrap_or("<binary>"),
            "Log message received"
        );
        Ok(None)
    }
}
