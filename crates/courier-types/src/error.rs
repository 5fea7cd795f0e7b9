//! Error types for Courier
//!
//! Defines all error types used throughout the dispatcher and its transports.

use thiserror::Error;

/// Main error type for Courier operations
#[derive(Error, Debug)]
pub enum Error {
    /// Queue not found (passive declare or publish to a missing queue)
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Exchange not found
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// Queue or exchange redeclared with different options
    #[error("Declaration conflict: {0}")]
    DeclarationConflict(String),

    /// Channel is closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Connection is closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Setup operation exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Routing key is not usable for registration
    #[error("Invalid routing key: {0:?}")]
    InvalidRoutingKey(String),

    /// A handler is already registered for the routing key
    #[error("Handler already registered for routing key: {0}")]
    HandlerAlreadyRegistered(String),

    /// Registration attempted after the consumer started
    #[error("Handler registry is frozen; register before start: {0}")]
    RegistryFrozen(String),

    /// Consumer was started twice
    #[error("Consumer already started")]
    AlreadyStarted,

    /// Handler failed while processing a message
    #[error("Handler error: {0}")]
    Handler(String),

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Courier operations
pub type Result<T> = std::result::Result<T, Error>;
