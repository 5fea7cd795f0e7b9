//! Handler trait and closure adapter

use std::future::Future;

use async_trait::async_trait;
use courier_transport::InboundMessage;
use courier_types::OutboundResponse;

/// Processes messages for one routing key
///
/// Returning `Ok(Some(response))` asks for a reply; it is only sent when the
/// inbound message names a reply destination. Handlers are shared across
/// concurrently running dispatch units and must not assume exclusive access
/// to any state.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, message: &InboundMessage) -> anyhow::Result<Option<OutboundResponse>>;
}

/// Adapter turning an async closure into a [`Handler`]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a handler
///
/// The closure receives its own copy of the message; bodies are
/// reference-counted so the copy is cheap.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<OutboundResponse>>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<OutboundResponse>>> + Send + 'static,
{
    async fn handle(&self, message: &InboundMessage) -> anyhow::Result<Option<OutboundResponse>> {
        (self.f)(message.clone()).await
    }
}
