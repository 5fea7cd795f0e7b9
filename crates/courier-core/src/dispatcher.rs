//! Message dispatcher
//!
//! Runs one handler against one message and, when both sides ask for it,
//! routes the response to the reply publisher with the request's correlation
//! id. Everything here executes inside an isolated dispatch unit: errors and
//! panics are logged and counted, never propagated.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_transport::InboundMessage;
use courier_types::{ConsumerConfig, Error, OutboundResponse, Result};
use futures::FutureExt;
use tracing::{debug, error};

use crate::handler::Handler;
use crate::publisher::ReplyPublisher;
use crate::stats::ConsumerStats;

/// What a successful dispatch did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A reply was published to `destination`
    Replied { destination: String },
    /// The handler returned nothing or the message had no reply destination
    NoReply,
}

pub struct Dispatcher {
    publisher: ReplyPublisher,
    handler_timeout: Option<Duration>,
    stats: Arc<ConsumerStats>,
}

impl Dispatcher {
    pub fn new(config: &ConsumerConfig, stats: Arc<ConsumerStats>) -> Self {
        Self {
            publisher: ReplyPublisher::new(),
            handler_timeout: config.handler_timeout(),
            stats,
        }
    }

    /// Body of one dispatch unit: dispatch, then log and count the result
    pub async fn process(&self, handler: Arc<dyn Handler>, message: InboundMessage) {
        let start_time = Instant::now();
        let result = self.dispatch(handler.as_ref(), &message).await;
        let elapsed_ms = start_time.elapsed().as_millis() as u64;

        match result {
            Ok(DispatchOutcome::Replied { destination }) => {
                self.stats.record_reply();
                debug!(
                    queue = %message.queue(),
                    routing_key = %message.routing_key(),
                    reply_to = %destination,
                    correlation_id = ?message.correlation_id(),
                    elapsed_ms = elapsed_ms,
                    "Message handled, reply published"
                );
            }
            Ok(DispatchOutcome::NoReply) => {
                debug!(
                    queue = %message.queue(),
                    routing_key = %message.routing_key(),
                    elapsed_ms = elapsed_ms,
                    "Message handled"
                );
            }
            Err(Error::Handler(reason)) => {
                self.stats.record_handler_failure();
                error!(
                    queue = %message.queue(),
                    routing_key = %message.routing_key(),
                    delivery_tag = message.delivery_tag(),
                    error = %reason,
                    elapsed_ms = elapsed_ms,
                    "Handler failed, message dropped"
                );
            }
            Err(e) => {
                self.stats.record_publish_failure();
                error!(
                    queue = %message.queue(),
                    routing_key = %message.routing_key(),
                    reply_to = ?message.reply_to(),
                    error = %e,
                    "Failed to publish reply"
                );
            }
        }
    }

    /// Invoke `handler` and publish its response if one was requested
    ///
    /// Handler errors, panics and timeouts come back as [`Error::Handler`];
    /// any other error is a publish failure.
    pub async fn dispatch(
        &self,
        handler: &dyn Handler,
        message: &InboundMessage,
    ) -> Result<DispatchOutcome> {
        let Some(mut response) = self.invoke(handler, message).await? else {
            return Ok(DispatchOutcome::NoReply);
        };
        let Some(reply_to) = message.reply_to() else {
            return Ok(DispatchOutcome::NoReply);
        };

        // copied verbatim, absent stays absent
        response.properties.correlation_id = message.properties().correlation_id.clone();

        self.publisher
            .publish(message.channel().as_ref(), response, reply_to)
            .await?;

        Ok(DispatchOutcome::Replied {
            destination: reply_to.to_string(),
        })
    }

    async fn invoke(
        &self,
        handler: &dyn Handler,
        message: &InboundMessage,
    ) -> Result<Option<OutboundResponse>> {
        let call = AssertUnwindSafe(handler.handle(message)).catch_unwind();

        let outcome = match self.handler_timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| Error::Handler(format!("timed out after {:?}", timeout)))?,
            None => call.await,
        };

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(Error::Handler(format!("{e:#}"))),
            Err(panic) => {
                let panic_msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                Err(Error::Handler(format!("panicked: {panic_msg}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use async_trait::async_trait;
    use bytes::Bytes;
    use courier_transport::{Channel, QueueHandle};
    use courier_types::{Envelope, MessageProperties, QueueOptions};
    use parking_lot::Mutex;

    /// Records every publish instead of sending it
    #[derive(Default)]
    struct RecordingChannel {
        published: Mutex<Vec<(String, String, Bytes, MessageProperties)>>,
        reject: bool,
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn id(&self) -> u64 {
            7
        }

        fn is_open(&self) -> bool {
            !self.reject
        }

        async fn declare_queue(
            &self,
            name: &str,
            _options: &QueueOptions,
        ) -> Result<Box<dyn QueueHandle>> {
            Err(Error::Internal(format!("not supported: {name}")))
        }

        async fn publish(
            &self,
            exchange: &str,
            routing_key: &str,
            body: Bytes,
            properties: MessageProperties,
        ) -> Result<()> {
            if self.reject {
                return Err(Error::ChannelClosed("channel 7".to_string()));
            }
            self.published.lock().push((
                exchange.to_string(),
                routing_key.to_string(),
                body,
                properties,
            ));
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn message(
        channel: &Arc<RecordingChannel>,
        routing_key: &str,
        properties: MessageProperties,
    ) -> InboundMessage {
        let envelope = Envelope::new("events", routing_key, "hello").with_properties(properties);
        let channel: Arc<dyn Channel> = channel.clone();
        InboundMessage::new(envelope, "work", 1, channel)
    }

    fn dispatcher(config: &ConsumerConfig) -> (Dispatcher, Arc<ConsumerStats>) {
        let stats = Arc::new(ConsumerStats::default());
        (Dispatcher::new(config, Arc::clone(&stats)), stats)
    }

    fn greet() -> impl Handler {
        handler_fn(|_msg| async { anyhow::Ok(Some(OutboundResponse::new("hi"))) })
    }

    #[tokio::test]
    async fn test_reply_inherits_correlation_id() {
        let channel = Arc::new(RecordingChannel::default());
        let (dispatcher, _) = dispatcher(&ConsumerConfig::default());
        let msg = message(
            &channel,
            "greet",
            MessageProperties::default()
                .with_reply_to("client-1")
                .with_correlation_id("abc"),
        );

        let outcome = dispatcher.dispatch(&greet(), &msg).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Replied {
                destination: "client-1".to_string()
            }
        );

        let published = channel.published.lock();
        assert_eq!(published.len(), 1);
        let (exchange, routing_key, body, properties) = &published[0];
        assert_eq!(exchange, "");
        assert_eq!(routing_key, "client-1");
        assert_eq!(body.as_ref(), b"hi");
        assert_eq!(properties.correlation_id.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_handler_correlation_id_is_overwritten() {
        let channel = Arc::new(RecordingChannel::default());
        let (dispatcher, _) = dispatcher(&ConsumerConfig::default());
        let handler = handler_fn(|_msg| async {
            let mut response = OutboundResponse::new("hi");
            response.properties.correlation_id = Some("made-up".to_string());
            anyhow::Ok(Some(response))
        });
        let msg = message(
            &channel,
            "greet",
            MessageProperties::default()
                .with_reply_to("client-1")
                .with_correlation_id("\u{1F600}-abc"),
        );

        dispatcher.dispatch(&handler, &msg).await.unwrap();

        let published = channel.published.lock();
        assert_eq!(
            published[0].3.correlation_id.as_deref(),
            Some("\u{1F600}-abc")
        );
    }

    #[tokio::test]
    async fn test_no_reply_destination_means_no_publish() {
        let channel = Arc::new(RecordingChannel::default());
        let (dispatcher, _) = dispatcher(&ConsumerConfig::default());
        let msg = message(
            &channel,
            "greet",
            MessageProperties::default().with_correlation_id("abc"),
        );

        let outcome = dispatcher.dispatch(&greet(), &msg).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::NoReply);
        assert!(channel.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_empty_reply_destination_means_no_publish() {
        let channel = Arc::new(RecordingChannel::default());
        let (dispatcher, stats) = dispatcher(&ConsumerConfig::default());
        let msg = message(
            &channel,
            "greet",
            MessageProperties::default()
                .with_reply_to("")
                .with_correlation_id("abc"),
        );

        let outcome = dispatcher.dispatch(&greet(), &msg).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::NoReply);
        assert!(channel.published.lock().is_empty());

        dispatcher.process(Arc::new(greet()), msg).await;
        assert_eq!(stats.snapshot(0).replies_published, 0);
        assert!(channel.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_handler_without_response_means_no_publish() {
        let channel = Arc::new(RecordingChannel::default());
        let (dispatcher, _) = dispatcher(&ConsumerConfig::default());
        let handler = handler_fn(|_msg| async { anyhow::Ok(None) });
        let msg = message(
            &channel,
            "log",
            MessageProperties::default().with_reply_to("client-1"),
        );

        let outcome = dispatcher.dispatch(&handler, &msg).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::NoReply);
        assert!(channel.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_is_reported() {
        let channel = Arc::new(RecordingChannel::default());
        let (dispatcher, stats) = dispatcher(&ConsumerConfig::default());
        let handler = handler_fn(|_msg| async {
            Err::<Option<OutboundResponse>, _>(anyhow::anyhow!("database unavailable"))
        });
        let msg = message(
            &channel,
            "greet",
            MessageProperties::default().with_reply_to("client-1"),
        );

        let result = dispatcher.dispatch(&handler, &msg).await;
        assert!(matches!(result, Err(Error::Handler(reason)) if reason.contains("database unavailable")));

        dispatcher.process(Arc::new(handler), msg).await;
        assert_eq!(stats.snapshot(0).handler_failures, 1);
        assert!(channel.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_handler_panic_is_caught() {
        let channel = Arc::new(RecordingChannel::default());
        let (dispatcher, stats) = dispatcher(&ConsumerConfig::default());
        let handler: Arc<dyn Handler> = Arc::new(handler_fn(|_msg| async {
            if true {
                panic!("boom");
            }
            anyhow::Ok(None)
        }));
        let msg = message(&channel, "greet", MessageProperties::default());

        let result = dispatcher.dispatch(handler.as_ref(), &msg).await;
        assert!(matches!(result, Err(Error::Handler(reason)) if reason.contains("boom")));

        dispatcher.process(handler, msg).await;
        assert_eq!(stats.snapshot(0).handler_failures, 1);
    }

    #[tokio::test]
    async fn test_handler_timeout() {
        let channel = Arc::new(RecordingChannel::default());
        let config = ConsumerConfig {
            handler_timeout_secs: 1,
            ..Default::default()
        };
        let (dispatcher, _) = dispatcher(&config);
        let handler = handler_fn(|_msg| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            anyhow::Ok(None)
        });
        let msg = message(&channel, "slow", MessageProperties::default());

        tokio::time::pause();
        let result = dispatcher.dispatch(&handler, &msg).await;
        assert!(matches!(result, Err(Error::Handler(reason)) if reason.contains("timed out")));
    }

    #[tokio::test]
    async fn test_publish_failure_is_counted() {
        let channel = Arc::new(RecordingChannel {
            reject: true,
            ..Default::default()
        });
        let (dispatcher, stats) = dispatcher(&ConsumerConfig::default());
        let msg = message(
            &channel,
            "greet",
            MessageProperties::default().with_reply_to("client-1"),
        );

        let result = dispatcher.dispatch(&greet(), &msg).await;
        assert!(matches!(result, Err(Error::ChannelClosed(_))));

        dispatcher.process(Arc::new(greet()), msg).await;
        let snapshot = stats.snapshot(0);
        assert_eq!(snapshot.publish_failures, 1);
        assert_eq!(snapshot.replies_published, 0);
        assert_eq!(snapshot.handler_failures, 0);
    }
}
