//! In-memory transport backend
//!
//! A small AMQP-shaped broker living in the process: exchanges route to
//! queues through bindings, queues buffer envelopes until a consumer pulls
//! them. Nothing is persisted; all data is lost when the process exits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use courier_types::{Envelope, Error, ExchangeKind, MessageProperties, QueueOptions, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::traits::{Channel, Connection, DeliveryStream, InboundMessage, QueueHandle};

type SharedReceiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<Envelope>>>;

/// Internal queue data structure
struct QueueData {
    /// Options the queue was declared with
    options: QueueOptions,
    /// Owning connection for exclusive queues
    owner: Option<u64>,
    /// Producer side of the buffer
    sender: mpsc::UnboundedSender<Envelope>,
    /// Consumer side, shared by every stream on this queue
    receiver: SharedReceiver,
    /// Messages buffered and not yet pulled
    depth: Arc<AtomicU64>,
    /// Live consumer streams
    consumers: Arc<AtomicU64>,
}

impl QueueData {
    fn new(options: QueueOptions, owner: Option<u64>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            options,
            owner,
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
            depth: Arc::new(AtomicU64::new(0)),
            consumers: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Internal exchange data structure
struct ExchangeData {
    kind: ExchangeKind,
    /// (routing pattern, queue name)
    bindings: Vec<(String, String)>,
}

/// In-memory broker shared by every connection made from it
pub struct MemoryBroker {
    /// Queues stored by name
    queues: DashMap<String, QueueData>,
    /// Exchanges stored by name; the default exchange "" is implicit
    exchanges: DashMap<String, ExchangeData>,
    next_connection_id: AtomicU64,
}

impl MemoryBroker {
    /// Create a new in-memory broker
    pub fn new() -> Self {
        info!("Initializing in-memory broker");
        Self {
            queues: DashMap::new(),
            exchanges: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Open a connection to this broker
    pub fn connect(self: &Arc<Self>) -> MemoryConnection {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        debug!(connection = id, "Connection opened");
        MemoryConnection {
            id,
            broker: Arc::clone(self),
            open: AtomicBool::new(true),
            channels: Mutex::new(Vec::new()),
            next_channel_id: AtomicU64::new(1),
        }
    }

    // ==================== Exchange Operations ====================

    /// Declare an exchange; redeclaring with another kind is a conflict
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Transport(
                "access refused: the default exchange cannot be redeclared".to_string(),
            ));
        }

        let entry = self
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| ExchangeData {
                kind,
                bindings: Vec::new(),
            });

        if entry.kind != kind {
            return Err(Error::DeclarationConflict(format!(
                "exchange '{}' already declared as {:?}",
                name, entry.kind
            )));
        }

        debug!(exchange = %name, kind = ?kind, "Exchange declared");
        Ok(())
    }

    // ==================== Queue Operations ====================

    fn declare_queue(&self, connection_id: u64, name: &str, options: &QueueOptions) -> Result<String> {
        if options.passive {
            return match self.queues.get(name) {
                Some(_) => Ok(name.to_string()),
                None => Err(Error::QueueNotFound(name.to_string())),
            };
        }

        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        if let Some(existing) = self.queues.get(&name) {
            if let Some(owner) = existing.owner {
                if owner != connection_id {
                    return Err(Error::DeclarationConflict(format!(
                        "queue '{}' is exclusive to another connection",
                        name
                    )));
                }
            }
            if !existing.options.is_compatible_with(options) {
                return Err(Error::DeclarationConflict(format!(
                    "queue '{}' already declared with different options",
                    name
                )));
            }
            return Ok(name);
        }

        let owner = options.exclusive.then_some(connection_id);
        self.queues
            .entry(name.clone())
            .or_insert_with(|| QueueData::new(options.clone(), owner));
        info!(queue = %name, durable = options.durable, "Queue declared");

        Ok(name)
    }

    fn bind_queue(&self, queue: &str, exchange: &str, routing_pattern: &str) -> Result<()> {
        if exchange.is_empty() {
            return Err(Error::Transport(
                "access refused: cannot bind to the default exchange".to_string(),
            ));
        }
        if !self.queues.contains_key(queue) {
            return Err(Error::QueueNotFound(queue.to_string()));
        }

        let mut exchange_data = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| Error::ExchangeNotFound(exchange.to_string()))?;

        let binding = (routing_pattern.to_string(), queue.to_string());
        if !exchange_data.bindings.contains(&binding) {
            exchange_data.bindings.push(binding);
        }

        info!(
            queue = %queue,
            exchange = %exchange,
            routing_pattern = %routing_pattern,
            "Queue bound"
        );
        Ok(())
    }

    /// Delete a queue; its consumers see the end of their stream
    pub fn delete_queue(&self, name: &str) -> Result<()> {
        match self.queues.remove(name) {
            Some(_) => {
                self.unbind_all(name);
                info!(queue = %name, "Queue deleted");
                Ok(())
            }
            None => Err(Error::QueueNotFound(name.to_string())),
        }
    }

    fn unbind_all(&self, queue: &str) {
        for mut exchange in self.exchanges.iter_mut() {
            exchange.bindings.retain(|(_, bound)| bound != queue);
        }
    }

    /// Number of messages waiting in a queue
    pub fn queue_depth(&self, name: &str) -> Result<u64> {
        self.queues
            .get(name)
            .map(|q| q.depth.load(Ordering::Acquire))
            .ok_or_else(|| Error::QueueNotFound(name.to_string()))
    }

    /// Names of all declared queues
    pub fn list_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|q| q.key().clone()).collect();
        names.sort();
        names
    }

    /// Drop every queue; all consumer streams end once drained
    pub fn close(&self) {
        let count = self.queues.len();
        self.queues.clear();
        for mut exchange in self.exchanges.iter_mut() {
            exchange.bindings.clear();
        }
        info!(count = count, "Broker closed");
    }

    fn drop_exclusive_queues(&self, connection_id: u64) {
        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|q| q.owner == Some(connection_id))
            .map(|q| q.key().clone())
            .collect();

        for name in owned {
            if self.queues.remove(&name).is_some() {
                self.unbind_all(&name);
                debug!(queue = %name, connection = connection_id, "Exclusive queue dropped");
            }
        }
    }

    // ==================== Message Operations ====================

    /// Route an envelope to every matching queue
    ///
    /// Returns how many queues received a copy. Unroutable messages are
    /// dropped.
    pub fn publish(&self, envelope: Envelope) -> Result<usize> {
        let targets: Vec<String> = if envelope.exchange.is_empty() {
            vec![envelope.routing_key.clone()]
        } else {
            let exchange = self
                .exchanges
                .get(&envelope.exchange)
                .ok_or_else(|| Error::ExchangeNotFound(envelope.exchange.clone()))?;

            let mut targets: Vec<String> = exchange
                .bindings
                .iter()
                .filter(|(pattern, _)| route_matches(exchange.kind, pattern, &envelope.routing_key))
                .map(|(_, queue)| queue.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        let mut delivered = 0;
        for target in &targets {
            if let Some(queue) = self.queues.get(target) {
                queue.depth.fetch_add(1, Ordering::AcqRel);
                if queue.sender.send(envelope.clone()).is_ok() {
                    delivered += 1;
                } else {
                    queue.depth.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        if delivered == 0 {
            debug!(
                exchange = %envelope.exchange,
                routing_key = %envelope.routing_key,
                "Unroutable message dropped"
            );
        } else {
            debug!(
                exchange = %envelope.exchange,
                routing_key = %envelope.routing_key,
                queues = delivered,
                "Message routed"
            );
        }

        Ok(delivered)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn route_matches(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => pattern == routing_key,
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => topic_matches(pattern, routing_key),
    }
}

/// Match a dot-separated routing key against a topic pattern
///
/// `*` matches exactly one word, `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            match_words(rest, key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => match_words(rest, key_rest),
        (Some((word, rest)), Some((part, key_rest))) => word == part && match_words(rest, key_rest),
        _ => false,
    }
}

// ==================== Connection ====================

/// Connection to a [`MemoryBroker`]
pub struct MemoryConnection {
    id: u64,
    broker: Arc<MemoryBroker>,
    open: AtomicBool,
    channels: Mutex<Vec<MemoryChannel>>,
    next_channel_id: AtomicU64,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Broker this connection talks to
    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }

    /// Close the connection, its channels and its exclusive queues
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        for channel in self.channels.lock().drain(..) {
            channel.shutdown();
        }
        self.broker.drop_exclusive_queues(self.id);
        info!(connection = self.id, "Connection closed");
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        if !self.open.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }

        let (closed, _) = watch::channel(false);
        let channel = MemoryChannel {
            inner: Arc::new(ChannelInner {
                id: self.next_channel_id.fetch_add(1, Ordering::Relaxed),
                connection_id: self.id,
                broker: Arc::clone(&self.broker),
                closed,
                next_delivery_tag: AtomicU64::new(1),
            }),
        };
        self.channels.lock().push(channel.clone());
        debug!(connection = self.id, channel = channel.id(), "Channel opened");

        Ok(Arc::new(channel))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

// ==================== Channel ====================

struct ChannelInner {
    id: u64,
    connection_id: u64,
    broker: Arc<MemoryBroker>,
    closed: watch::Sender<bool>,
    next_delivery_tag: AtomicU64,
}

/// Channel on a [`MemoryConnection`]
#[derive(Clone)]
pub struct MemoryChannel {
    inner: Arc<ChannelInner>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if *self.inner.closed.borrow() {
            return Err(Error::ChannelClosed(format!("channel {}", self.inner.id)));
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.inner.closed.send_replace(true);
        debug!(channel = self.inner.id, "Channel closed");
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn id(&self) -> u64 {
        self.inner.id
    }

    fn is_open(&self) -> bool {
        !*self.inner.closed.borrow()
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<Box<dyn QueueHandle>> {
        self.ensure_open()?;
        let name = self
            .inner
            .broker
            .declare_queue(self.inner.connection_id, name, options)?;

        Ok(Box::new(MemoryQueue {
            name,
            auto_delete: options.auto_delete,
            channel: self.clone(),
        }))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        mut properties: MessageProperties,
    ) -> Result<()> {
        self.ensure_open()?;
        if properties.timestamp.is_none() {
            properties.timestamp = Some(Utc::now());
        }

        let envelope = Envelope::new(exchange, routing_key, body).with_properties(properties);
        self.inner.broker.publish(envelope)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}

// ==================== Queue ====================

/// Queue declared on a [`MemoryChannel`]
pub struct MemoryQueue {
    name: String,
    auto_delete: bool,
    channel: MemoryChannel,
}

#[async_trait]
impl QueueHandle for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn bind(&self, exchange: &str, routing_pattern: &str) -> Result<()> {
        self.channel.ensure_open()?;
        self.channel
            .inner
            .broker
            .bind_queue(&self.name, exchange, routing_pattern)
    }

    async fn consume(&self) -> Result<Box<dyn DeliveryStream>> {
        self.channel.ensure_open()?;

        let (receiver, depth, consumers) = {
            let queue = self
                .channel
                .inner
                .broker
                .queues
                .get(&self.name)
                .ok_or_else(|| Error::QueueNotFound(self.name.clone()))?;
            (
                Arc::clone(&queue.receiver),
                Arc::clone(&queue.depth),
                Arc::clone(&queue.consumers),
            )
        };
        consumers.fetch_add(1, Ordering::AcqRel);
        debug!(queue = %self.name, channel = self.channel.id(), "Consumer started");

        Ok(Box::new(MemoryDeliveryStream {
            queue: self.name.clone(),
            auto_delete: self.auto_delete,
            receiver,
            depth,
            consumers,
            closed: self.channel.inner.closed.subscribe(),
            channel: self.channel.clone(),
        }))
    }
}

/// Consumer stream on a memory queue
struct MemoryDeliveryStream {
    queue: String,
    auto_delete: bool,
    receiver: SharedReceiver,
    depth: Arc<AtomicU64>,
    consumers: Arc<AtomicU64>,
    closed: watch::Receiver<bool>,
    channel: MemoryChannel,
}

/// Resolves once the channel's closed flag is set
async fn channel_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            // Sender gone without closing; deliveries end when the queue does
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next(&mut self) -> Option<InboundMessage> {
        if *self.closed.borrow() {
            return None;
        }

        let receiver = Arc::clone(&self.receiver);
        let envelope = tokio::select! {
            _ = channel_closed(&mut self.closed) => None,
            envelope = async move { receiver.lock().await.recv().await } => envelope,
        }?;
        self.depth.fetch_sub(1, Ordering::AcqRel);

        let delivery_tag = self
            .channel
            .inner
            .next_delivery_tag
            .fetch_add(1, Ordering::Relaxed);
        let channel: Arc<dyn Channel> = Arc::new(self.channel.clone());

        Some(InboundMessage::new(envelope, self.queue.clone(), delivery_tag, channel))
    }
}

impl Drop for MemoryDeliveryStream {
    fn drop(&mut self) {
        let remaining = self.consumers.fetch_sub(1, Ordering::AcqRel) - 1;
        if self.auto_delete && remaining == 0 {
            let receiver = &self.receiver;
            let removed = self
                .channel
                .inner
                .broker
                .queues
                .remove_if(&self.queue, |_, q| Arc::ptr_eq(&q.receiver, receiver));
            if removed.is_some() {
                self.channel.inner.broker.unbind_all(&self.queue);
                debug!(queue = %self.queue, "Auto-delete queue removed");
            }
        }
    }
}
