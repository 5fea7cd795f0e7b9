//! Courier Core - Message dispatch for pub/sub consumers
//!
//! This crate contains the consumer implementation including:
//! - Consumer: owns the registry and bindings, starts the consume loops
//! - Handler registry keyed by routing key
//! - Consume loops that spawn one dispatch unit per message
//! - Dispatcher and reply publisher preserving correlation ids

pub mod consume;
pub mod consumer;
pub mod dispatcher;
pub mod handler;
pub mod publisher;
pub mod registry;
pub mod stats;
pub mod tracker;

// Re-exports
pub use consume::LoopExit;
pub use consumer::{Consumer, QueueBinding};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use handler::{handler_fn, FnHandler, Handler};
pub use publisher::ReplyPublisher;
pub use registry::HandlerRegistry;
pub use tracker::InFlightTracker;
