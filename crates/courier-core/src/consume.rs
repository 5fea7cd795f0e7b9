//! Consume loop
//!
//! One loop per bound queue. The loop pulls the next delivery, looks up its
//! handler and spawns an independent dispatch unit for it, then goes straight
//! back to waiting. It never awaits a unit it spawned, so a slow or failing
//! handler cannot hold up later deliveries on the same queue.

use std::sync::Arc;

use courier_transport::DeliveryStream;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::registry::HandlerRegistry;
use crate::stats::ConsumerStats;
use crate::tracker::InFlightTracker;

/// Why a consume loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The delivery stream ended (queue deleted, channel or connection closed)
    Closed,
    /// Shutdown was requested
    Cancelled,
    /// The transport refused to start a consumer on the queue
    ConsumeFailed,
}

/// Everything one loop shares with its siblings
#[derive(Clone)]
pub struct LoopContext {
    pub registry: Arc<HandlerRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub tracker: InFlightTracker,
    pub limiter: Option<Arc<Semaphore>>,
    pub stats: Arc<ConsumerStats>,
}

pub struct ConsumeLoop {
    queue: String,
    context: LoopContext,
    shutdown: watch::Receiver<bool>,
}

impl ConsumeLoop {
    pub fn new(queue: impl Into<String>, context: LoopContext, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            queue: queue.into(),
            context,
            shutdown,
        }
    }

    /// Pull deliveries until the stream ends or shutdown is signalled
    pub async fn run(mut self, mut stream: Box<dyn DeliveryStream>) -> LoopExit {
        info!(queue = %self.queue, "Consume loop started");

        loop {
            let next = tokio::select! {
                biased;
                _ = stop_requested(&mut self.shutdown) => {
                    info!(queue = %self.queue, "Consume loop cancelled");
                    return LoopExit::Cancelled;
                }
                next = stream.next() => next,
            };

            let Some(message) = next else {
                info!(queue = %self.queue, "Delivery stream closed, consume loop stopped");
                return LoopExit::Closed;
            };
            self.context.stats.record_received();

            let Some(handler) = self.context.registry.lookup(message.routing_key()) else {
                self.context.stats.record_unrouted();
                debug!(
                    queue = %self.queue,
                    routing_key = %message.routing_key(),
                    delivery_tag = message.delivery_tag(),
                    "No handler for routing key, message dropped"
                );
                continue;
            };

            // A message pulled before shutdown is still dispatched, over the
            // limit if capacity never frees up.
            let (permit, stopping) = match &self.context.limiter {
                Some(limiter) => tokio::select! {
                    biased;
                    permit = Arc::clone(limiter).acquire_owned() => (permit.ok(), false),
                    _ = stop_requested(&mut self.shutdown) => {
                        warn!(
                            queue = %self.queue,
                            routing_key = %message.routing_key(),
                            delivery_tag = message.delivery_tag(),
                            "Shutdown while waiting for capacity, dispatching pulled message"
                        );
                        (None, true)
                    }
                },
                None => (None, false),
            };

            debug!(
                queue = %self.queue,
                routing_key = %message.routing_key(),
                delivery_tag = message.delivery_tag(),
                "Dispatching message"
            );
            self.context.stats.record_dispatched();

            let guard = self.context.tracker.track();
            let dispatcher = Arc::clone(&self.context.dispatcher);
            tokio::spawn(async move {
                let _guard = guard;
                let _permit = permit;
                dispatcher.process(handler, message).await;
            });

            if stopping {
                info!(queue = %self.queue, "Consume loop cancelled");
                return LoopExit::Cancelled;
            }
        }
    }
}

/// Resolves once shutdown is signalled; never resolves if the sender is gone
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use async_trait::async_trait;
    use courier_transport::{Channel, Connection, InboundMessage, MemoryBroker};
    use courier_types::{ConsumerConfig, Envelope, OutboundResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Stream fed directly by the test
    struct ScriptedStream {
        receiver: mpsc::UnboundedReceiver<InboundMessage>,
    }

    #[async_trait]
    impl DeliveryStream for ScriptedStream {
        async fn next(&mut self) -> Option<InboundMessage> {
            self.receiver.recv().await
        }
    }

    fn context(registry: HandlerRegistry, max_in_flight: usize) -> LoopContext {
        let config = ConsumerConfig {
            max_in_flight,
            ..Default::default()
        };
        let stats = Arc::new(ConsumerStats::default());
        LoopContext {
            registry: Arc::new(registry),
            dispatcher: Arc::new(Dispatcher::new(&config, Arc::clone(&stats))),
            tracker: InFlightTracker::new(),
            limiter: (max_in_flight > 0).then(|| Arc::new(Semaphore::new(max_in_flight))),
            stats,
        }
    }

    async fn channel() -> Arc<dyn Channel> {
        let broker = Arc::new(MemoryBroker::new());
        broker.connect().open_channel().await.unwrap()
    }

    #[tokio::test]
    async fn test_unrouted_messages_are_dropped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "greet",
                handler_fn(move |_msg| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        anyhow::Ok(None)
                    }
                }),
            )
            .unwrap();

        let ctx = context(registry, 0);
        let (sender, receiver) = mpsc::unbounded_channel();
        let (_stop, shutdown) = watch::channel(false);
        let channel = channel().await;

        sender
            .send(InboundMessage::new(
                Envelope::new("events", "unknown", "x"),
                "work",
                1,
                Arc::clone(&channel),
            ))
            .unwrap();
        drop(sender);

        let exit = ConsumeLoop::new("work", ctx.clone(), shutdown)
            .run(Box::new(ScriptedStream { receiver }))
            .await;

        assert_eq!(exit, LoopExit::Closed);
        let snapshot = ctx.stats.snapshot(ctx.tracker.count());
        assert_eq!(snapshot.received, 1);
        assert_eq!(snapshot.unrouted, 1);
        assert_eq!(snapshot.dispatched, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_loop_does_not_wait_for_dispatch() {
        let release = Arc::new(tokio::sync::Notify::new());
        let gate = Arc::clone(&release);
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "slow",
                handler_fn(move |_msg| {
                    let gate = Arc::clone(&gate);
                    async move {
                        gate.notified().await;
                        anyhow::Ok(Some(OutboundResponse::new("late")))
                    }
                }),
            )
            .unwrap();

        let ctx = context(registry, 0);
        let (sender, receiver) = mpsc::unbounded_channel();
        let (_stop, shutdown) = watch::channel(false);
        let channel = channel().await;

        for tag in 1..=3 {
            sender
                .send(InboundMessage::new(
                    Envelope::new("events", "slow", "x"),
                    "work",
                    tag,
                    Arc::clone(&channel),
                ))
                .unwrap();
        }
        drop(sender);

        // all three blocked handlers are in flight when the loop returns
        let exit = ConsumeLoop::new("work", ctx.clone(), shutdown)
            .run(Box::new(ScriptedStream { receiver }))
            .await;
        assert_eq!(exit, LoopExit::Closed);
        assert_eq!(ctx.stats.snapshot(0).dispatched, 3);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ctx.tracker.count(), 3);

        release.notify_waiters();
        assert!(ctx.tracker.wait_idle(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_idle_loop() {
        let ctx = context(HandlerRegistry::new(), 0);
        let (_sender, receiver) = mpsc::unbounded_channel();
        let (stop, shutdown) = watch::channel(false);

        let handle = tokio::spawn(
            ConsumeLoop::new("work", ctx, shutdown).run(Box::new(ScriptedStream { receiver })),
        );
        stop.send_replace(true);

        let exit = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, LoopExit::Cancelled);
    }

    #[tokio::test]
    async fn test_limiter_bounds_concurrent_units() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (running_h, peak_h) = (Arc::clone(&running), Arc::clone(&peak));
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "work",
                handler_fn(move |_msg| {
                    let running = Arc::clone(&running_h);
                    let peak = Arc::clone(&peak_h);
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        anyhow::Ok(None)
                    }
                }),
            )
            .unwrap();

        let ctx = context(registry, 2);
        let (sender, receiver) = mpsc::unbounded_channel();
        let (_stop, shutdown) = watch::channel(false);
        let channel = channel().await;

        for tag in 1..=8 {
            sender
                .send(InboundMessage::new(
                    Envelope::new("events", "work", "x"),
                    "work",
                    tag,
                    Arc::clone(&channel),
                ))
                .unwrap();
        }
        drop(sender);

        ConsumeLoop::new("work", ctx.clone(), shutdown)
            .run(Box::new(ScriptedStream { receiver }))
            .await;
        assert!(ctx.tracker.wait_idle(Duration::from_secs(2)).await);

        assert_eq!(ctx.stats.snapshot(0).dispatched, 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting_for_capacity() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "stuck",
                handler_fn(|_msg| async {
                    std::future::pending::<()>().await;
                    anyhow::Ok(None)
                }),
            )
            .unwrap();

        let ctx = context(registry, 1);
        let (sender, receiver) = mpsc::unbounded_channel();
        let (stop, shutdown) = watch::channel(false);
        let channel = channel().await;

        for tag in 1..=2 {
            sender
                .send(InboundMessage::new(
                    Envelope::new("events", "stuck", "x"),
                    "work",
                    tag,
                    Arc::clone(&channel),
                ))
                .unwrap();
        }

        let handle = tokio::spawn(
            ConsumeLoop::new("work", ctx.clone(), shutdown).run(Box::new(ScriptedStream { receiver })),
        );

        // second message pulled, loop parked on the limiter
        while ctx.stats.snapshot(0).received < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(ctx.stats.snapshot(0).dispatched, 1);

        stop.send_replace(true);
        let exit = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(exit, LoopExit::Cancelled);
        assert_eq!(ctx.stats.snapshot(0).dispatched, 2);
        assert_eq!(ctx.tracker.count(), 2);
        drop(sender);
    }
}
