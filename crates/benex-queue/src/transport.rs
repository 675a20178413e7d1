//! The queue-transport contract shared by all backends.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::QueueError;

/// Errors handlers report back to the transport. The transport only needs
/// to know "retry me"; the concrete type is the handler's business.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// One leased queue message, as seen by a handler.
#[derive(Debug, Clone)]
pub struct QueueJob {
    /// Transport-assigned message id, stable across redeliveries.
    pub id: i64,
    pub kind: String,
    pub args: Value,
    /// Number of previous failed attempts for this message.
    pub error_count: i32,
    /// Lower values dequeue first.
    pub priority: i16,
}

/// Work callback for one message kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Processes one message. `Ok` acknowledges; `Err` requests a retry
    /// (or discard, once the transport's attempt budget is spent).
    async fn work(&self, job: QueueJob) -> Result<(), HandlerError>;
}

/// Abstract work-queue transport.
///
/// Delivery is at-least-once: handlers must be idempotent with respect to
/// redelivery. Registration happens before [`start`](QueueTransport::start);
/// messages whose kind has no handler are discarded with an error log.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Persists a message and returns its transport-assigned id.
    async fn enqueue(&self, kind: &str, args: Value, priority: i16) -> Result<i64, QueueError>;

    /// Registers the handler for a message kind, replacing any previous
    /// registration.
    fn register(&self, kind: &str, handler: Arc<dyn JobHandler>);

    /// Spawns the worker pool. Returns immediately; workers run until
    /// [`stop`](QueueTransport::stop).
    async fn start(&self, num_workers: usize) -> Result<(), QueueError>;

    /// Stops the worker pool and waits for in-flight work to finish.
    async fn stop(&self);
}

/// Kind-to-handler registry shared by the transports.
#[derive(Default, Clone)]
pub struct HandlerMap {
    inner: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
}

impl HandlerMap {
    pub fn insert(&self, kind: &str, handler: Arc<dyn JobHandler>) {
        self.inner
            .write()
            .unwrap()
            .insert(kind.to_string(), handler);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn JobHandler>> {
        self.inner.read().unwrap().get(kind).cloned()
    }
}

/// Delay before the next delivery attempt: `error_count^4 + 3` seconds.
///
/// The quartic curve gives later retries enough headroom that a parent job
/// which is merely replication-lagged will have become visible long before
/// the attempt budget runs out.
pub fn retry_backoff(error_count: i32) -> Duration {
    let n = u64::try_from(error_count.max(0)).unwrap_or(0);
    Duration::from_secs(n.pow(4) + 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_curve() {
        assert_eq!(retry_backoff(0), Duration::from_secs(3));
        assert_eq!(retry_backoff(1), Duration::from_secs(4));
        assert_eq!(retry_backoff(2), Duration::from_secs(19));
        assert_eq!(retry_backoff(3), Duration::from_secs(84));
        // Negative counts clamp instead of panicking.
        assert_eq!(retry_backoff(-1), Duration::from_secs(3));
    }
}
