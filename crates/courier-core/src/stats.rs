//! Dispatch counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use courier_types::ConsumerStatsSnapshot;

/// Lock-free counters shared by the consume loops and their dispatch units
#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    dispatched: AtomicU64,
    unrouted: AtomicU64,
    handler_failures: AtomicU64,
    replies_published: AtomicU64,
    publish_failures: AtomicU64,
    active_loops: AtomicU64,
}

impl ConsumerStats {
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unrouted(&self) {
        self.unrouted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reply(&self) {
        self.replies_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a running consume loop until the guard drops
    pub fn loop_started(self: &Arc<Self>) -> ActiveLoopGuard {
        self.active_loops.fetch_add(1, Ordering::Relaxed);
        ActiveLoopGuard {
            stats: Arc::clone(self),
        }
    }

    /// Copy the counters; `in_flight` comes from the tracker
    pub fn snapshot(&self, in_flight: usize) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            replies_published: self.replies_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            in_flight: in_flight as u64,
            active_loops: self.active_loops.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the active loop count on drop, including when the loop task
/// is aborted
pub struct ActiveLoopGuard {
    stats: Arc<ConsumerStats>,
}

impl Drop for ActiveLoopGuard {
    fn drop(&mut self) {
        self.stats.active_loops.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_loop_guard() {
        let stats = Arc::new(ConsumerStats::default());
        let first = stats.loop_started();
        let second = stats.loop_started();
        assert_eq!(stats.snapshot(0).active_loops, 2);

        drop(first);
        assert_eq!(stats.snapshot(0).active_loops, 1);
        drop(second);
        assert_eq!(stats.snapshot(0).active_loops, 0);
    }

    #[tokio::test]
    async fn test_aborted_loop_is_no_longer_active() {
        let stats = Arc::new(ConsumerStats::default());
        let task_stats = Arc::clone(&stats);
        let handle = tokio::spawn(async move {
            let _active = task_stats.loop_started();
            std::future::pending::<()>().await;
        });

        while stats.snapshot(0).active_loops == 0 {
            tokio::task::yield_now().await;
        }
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(stats.snapshot(0).active_loops, 0);
    }
}
