//! Dispatch statistics

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Point-in-time view of a consumer's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ConsumerStatsSnapshot {
    /// Messages pulled off any bound queue
    pub received: u64,

    /// Messages handed to a dispatch unit
    pub dispatched: u64,

    /// Messages dropped because no handler matched their routing key
    pub unrouted: u64,

    /// Dispatch units whose handler returned an error, panicked or timed out
    pub handler_failures: u64,

    /// Replies transmitted
    pub replies_published: u64,

    /// Replies the transport rejected
    pub publish_failures: u64,

    /// Dispatch units currently running
    pub in_flight: u64,

    /// Consume loops currently running
    pub active_loops: u64,
}

/// Result of a graceful shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DrainReport {
    /// Whether every in-flight unit finished before the deadline
    pub drained: bool,

    /// Units still running when shutdown returned
    pub remaining: u64,
}
