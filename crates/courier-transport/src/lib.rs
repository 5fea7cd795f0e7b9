//! Courier Transport - Broker interfaces for the message dispatcher
//!
//! This crate defines the collaborator traits the dispatcher talks to and
//! ships the backends that implement them.
//! Currently supports:
//! - In-memory broker (default, for development/testing)

pub mod traits;

#[cfg(feature = "memory")]
pub mod memory;

// Re-exports
pub use traits::{Channel, Connection, DeliveryStream, InboundMessage, QueueHandle};

#[cfg(feature = "memory")]
pub use memory::{topic_matches, MemoryBroker, MemoryChannel, MemoryConnection, MemoryQueue};
