//! Courier Types - Core domain types for the message dispatcher
//!
//! This crate contains all shared types used across Courier components.

pub mod binding;
pub mod config;
pub mod error;
pub mod message;
pub mod stats;

// Re-export commonly used types
pub use binding::{BindingId, BindingInfo, BindingSpec, ExchangeKind, QueueOptions};
pub use config::ConsumerConfig;
pub use error::{Error, Result};
pub use message::{Envelope, MessageId, MessageProperties, OutboundResponse};
pub use stats::{ConsumerStatsSnapshot, DrainReport};
