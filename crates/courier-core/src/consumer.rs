//! Consumer - owns the handler registry and the bound queues
//!
//! The Consumer is the central component the embedder drives: register
//! handlers, declare and bind queues, then start one consume loop per queue.

use std::sync::Arc;
use std::time::Duration;

use courier_transport::{Channel, Connection, InboundMessage, QueueHandle};
use courier_types::{
    BindingId, BindingInfo, BindingSpec, ConsumerConfig, ConsumerStatsSnapshot, DrainReport, Error,
    OutboundResponse, Result,
};
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::consume::{ConsumeLoop, LoopContext, LoopExit};
use crate::dispatcher::Dispatcher;
use crate::handler::{handler_fn, Handler};
use crate::registry::HandlerRegistry;
use crate::stats::ConsumerStats;
use crate::tracker::InFlightTracker;

/// Opaque handle to a declared and bound queue
#[derive(Clone)]
pub struct QueueBinding {
    id: BindingId,
    spec: BindingSpec,
    queue: Arc<dyn QueueHandle>,
}

impl QueueBinding {
    pub fn id(&self) -> BindingId {
        self.id
    }

    /// Queue name as resolved by the transport
    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn spec(&self) -> &BindingSpec {
        &self.spec
    }

    pub fn info(&self) -> BindingInfo {
        BindingInfo {
            id: self.id,
            queue: self.queue.name().to_string(),
            exchange: self.spec.exchange.clone(),
            routing_pattern: self.spec.routing_pattern.clone(),
        }
    }
}

impl std::fmt::Debug for QueueBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueBinding")
            .field("id", &self.id)
            .field("queue", &self.queue.name())
            .field("spec", &self.spec)
            .finish()
    }
}

/// Message consumer
pub struct Consumer {
    config: ConsumerConfig,
    /// Shared with the loops once started; `Arc::get_mut` fails from then on
    registry: Arc<HandlerRegistry>,
    bindings: Vec<QueueBinding>,
    /// Shared channel for bindings that do not ask for their own
    default_channel: Option<Arc<dyn Channel>>,
    dispatcher: Arc<Dispatcher>,
    limiter: Option<Arc<Semaphore>>,
    stats: Arc<ConsumerStats>,
    tracker: InFlightTracker,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<LoopExit>>>,
    started: bool,
}

impl Consumer {
    /// Create a new consumer
    pub fn new(config: ConsumerConfig) -> Self {
        let stats = Arc::new(ConsumerStats::default());
        let dispatcher = Arc::new(Dispatcher::new(&config, Arc::clone(&stats)));
        let limiter = (config.max_in_flight > 0).then(|| Arc::new(Semaphore::new(config.max_in_flight)));
        let (shutdown, _) = watch::channel(false);

        info!(
            max_in_flight = config.max_in_flight,
            handler_timeout_secs = config.handler_timeout_secs,
            "Initializing consumer"
        );

        Self {
            config,
            registry: Arc::new(HandlerRegistry::new()),
            bindings: Vec::new(),
            default_channel: None,
            dispatcher,
            limiter,
            stats,
            tracker: InFlightTracker::new(),
            shutdown,
            loops: Mutex::new(Vec::new()),
            started: false,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    // ==================== Registration ====================

    /// Register a handler for a routing key
    pub fn register<H: Handler>(&mut self, routing_key: impl Into<String>, handler: H) -> Result<()> {
        let routing_key = routing_key.into();
        if self.started {
            return Err(Error::RegistryFrozen(routing_key));
        }
        let registry = Arc::get_mut(&mut self.registry)
            .ok_or_else(|| Error::RegistryFrozen(routing_key.clone()))?;
        registry.register(routing_key, handler)
    }

    /// Register an async closure for a routing key
    pub fn register_fn<F, Fut>(&mut self, routing_key: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Option<OutboundResponse>>> + Send + 'static,
    {
        self.register(routing_key, handler_fn(f))
    }

    /// All registered routing keys, sorted
    pub fn routes(&self) -> Vec<String> {
        self.registry.routes()
    }

    // ==================== Setup ====================

    /// Declare a queue and bind it to an exchange
    ///
    /// Failures leave the consumer unchanged. Must be called before `start`.
    /// A queue whose declaration succeeded stays declared on the broker when
    /// the bind or the declare deadline fails afterwards.
    pub async fn declare_and_bind(
        &mut self,
        connection: &dyn Connection,
        spec: BindingSpec,
    ) -> Result<QueueBinding> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }

        let queue = match spec.declare_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, self.declare(connection, &spec))
                .await
                .map_err(|_| {
                    Error::Timeout(format!(
                        "declaring queue '{}' after {:?}",
                        spec.queue, timeout
                    ))
                })??,
            None => self.declare(connection, &spec).await?,
        };

        let binding = QueueBinding {
            id: BindingId::new(),
            spec,
            queue,
        };
        info!(
            binding = %binding.id,
            queue = %binding.queue_name(),
            exchange = %binding.spec.exchange,
            routing_pattern = %binding.spec.routing_pattern,
            "Queue bound"
        );

        self.bindings.push(binding.clone());
        Ok(binding)
    }

    async fn declare(
        &mut self,
        connection: &dyn Connection,
        spec: &BindingSpec,
    ) -> Result<Arc<dyn QueueHandle>> {
        let channel = if spec.dedicated_channel {
            connection.open_channel().await?
        } else {
            self.default_channel(connection).await?
        };

        let queue: Arc<dyn QueueHandle> =
            Arc::from(channel.declare_queue(&spec.queue, &spec.options).await?);
        queue.bind(&spec.exchange, &spec.routing_pattern).await?;
        Ok(queue)
    }

    async fn default_channel(&mut self, connection: &dyn Connection) -> Result<Arc<dyn Channel>> {
        if let Some(channel) = &self.default_channel {
            if channel.is_open() {
                return Ok(Arc::clone(channel));
            }
        }

        let channel = connection.open_channel().await?;
        debug!(channel = channel.id(), "Default channel opened");
        self.default_channel = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// Live bindings
    pub fn bindings(&self) -> Vec<BindingInfo> {
        self.bindings.iter().map(QueueBinding::info).collect()
    }

    // ==================== Lifecycle ====================

    /// Spawn one consume loop per binding and return
    ///
    /// Freezes the registry. Starting with no bindings is allowed and does
    /// nothing; starting twice is an error.
    pub fn start(&mut self, connection: &dyn Connection) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        if !connection.is_open() {
            return Err(Error::ConnectionClosed);
        }
        self.started = true;

        if self.bindings.is_empty() {
            warn!("Consumer started with no bindings");
            return Ok(());
        }

        let context = LoopContext {
            registry: Arc::clone(&self.registry),
            dispatcher: Arc::clone(&self.dispatcher),
            tracker: self.tracker.clone(),
            limiter: self.limiter.clone(),
            stats: Arc::clone(&self.stats),
        };

        let mut loops = self.loops.lock();
        for binding in &self.bindings {
            let queue = Arc::clone(&binding.queue);
            let consume_loop =
                ConsumeLoop::new(binding.queue_name(), context.clone(), self.shutdown.subscribe());
            let stats = Arc::clone(&self.stats);

            loops.push(tokio::spawn(async move {
                let stream = match queue.consume().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!(queue = %queue.name(), error = %e, "Failed to start consumer");
                        return LoopExit::ConsumeFailed;
                    }
                };

                let _active = stats.loop_started();
                consume_loop.run(stream).await
            }));
        }

        info!(
            queues = self.bindings.len(),
            routes = self.registry.len(),
            "Consumer started"
        );
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Stop accepting messages and wait for in-flight dispatch units
    ///
    /// Loops stop first; running units are never cancelled, only waited for
    /// until `timeout` elapses.
    pub async fn shutdown(&self, timeout: Duration) -> DrainReport {
        info!(
            in_flight = self.tracker.count(),
            timeout_ms = timeout.as_millis() as u64,
            "Consumer shutting down"
        );
        self.shutdown.send_replace(true);

        let deadline = tokio::time::Instant::now() + timeout;
        let loops = std::mem::take(&mut *self.loops.lock());
        for mut handle in loops {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(exit)) => debug!(exit = ?exit, "Consume loop joined"),
                Ok(Err(e)) => error!(error = %e, "Consume loop task failed"),
                Err(_) => {
                    warn!("Consume loop did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        let remaining_time = deadline.saturating_duration_since(tokio::time::Instant::now());
        let drained = self.tracker.wait_idle(remaining_time).await;
        let remaining = self.tracker.count() as u64;

        if drained {
            info!("Consumer drained");
        } else {
            warn!(remaining = remaining, "Shutdown deadline reached with units in flight");
        }

        DrainReport { drained, remaining }
    }

    /// Shutdown using the configured drain deadline
    pub async fn graceful_shutdown(&self) -> DrainReport {
        self.shutdown(self.config.shutdown_timeout()).await
    }

    // ==================== Observability ====================

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot(self.tracker.count())
    }
}
