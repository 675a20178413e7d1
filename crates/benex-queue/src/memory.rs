//! In-process implementation of the [`QueueTransport`] trait.
//!
//! Same contract as the PostgreSQL backend: priority ordering, per-message
//! error counts, backoff rescheduling and a bounded attempt budget. Used by
//! tests and single-node local runs.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::transport::{HandlerMap, QueueJob, QueueTransport, retry_backoff};

#[derive(Debug, Clone)]
pub struct MemoryQueueConfig {
    /// Delivery attempts before a message is discarded.
    pub max_attempts: i32,
    /// Multiplier applied to the backoff curve, in milliseconds per
    /// second. Production keeps the default 1000; tests shrink it so retry
    /// paths run in milliseconds.
    pub backoff_scale_ms: u64,
    /// Idle dequeue poll interval.
    pub poll_interval: Duration,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_scale_ms: 1000,
            poll_interval: Duration::from_millis(20),
        }
    }
}

struct Message {
    id: i64,
    kind: String,
    args: Value,
    priority: i16,
    error_count: i32,
    ready_at: Instant,
}

/// In-process work queue.
pub struct MemoryQueue {
    config: MemoryQueueConfig,
    handlers: HandlerMap,
    messages: Arc<Mutex<Vec<Message>>>,
    in_flight: Arc<AtomicUsize>,
    next_id: AtomicI64,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MemoryQueue {
    #[must_use]
    pub fn new(config: MemoryQueueConfig) -> Self {
        Self {
            config,
            handlers: HandlerMap::default(),
            messages: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicI64::new(1),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// True when no message is queued or being worked.
    pub fn is_idle(&self) -> bool {
        self.messages.lock().unwrap().is_empty() && self.in_flight.load(Ordering::SeqCst) == 0
    }

    /// Waits until the queue is idle. Test convenience; production code
    /// stops the pool instead.
    pub async fn drain(&self) {
        while !self.is_idle() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn pop_ready(messages: &Mutex<Vec<Message>>) -> Option<Message> {
        let now = Instant::now();
        let mut queue = messages.lock().unwrap();
        let index = queue
            .iter()
            .enumerate()
            .filter(|(_, m)| m.ready_at <= now)
            .min_by_key(|(_, m)| (m.priority, m.id))
            .map(|(i, _)| i)?;
        Some(queue.swap_remove(index))
    }
}

/// The shared backoff curve compressed by the configured scale, so test
/// configurations retry in milliseconds rather than seconds.
fn scaled_backoff(error_count: i32, backoff_scale_ms: u64) -> Duration {
    Duration::from_millis(retry_backoff(error_count).as_secs() * backoff_scale_ms)
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn enqueue(&self, kind: &str, args: Value, priority: i16) -> Result<i64, QueueError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.messages.lock().unwrap().push(Message {
            id,
            kind: kind.to_string(),
            args,
            priority,
            error_count: 0,
            ready_at: Instant::now(),
        });
        Ok(id)
    }

    fn register(&self, kind: &str, handler: Arc<dyn crate::JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    async fn start(&self, num_workers: usize) -> Result<(), QueueError> {
        let mut workers = self.workers.lock().unwrap();
        for _ in 0..num_workers {
            let messages = Arc::clone(&self.messages);
            let in_flight = Arc::clone(&self.in_flight);
            let handlers = self.handlers.clone();
            let shutdown = self.shutdown.clone();
            let config = self.config.clone();
            let backoff_scale = self.config.backoff_scale_ms;

            workers.push(tokio::spawn(async move {
                loop {
                    if shutdown.is_cancelled() {
                        return;
                    }

                    let Some(mut message) = Self::pop_ready(&messages) else {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = tokio::time::sleep(config.poll_interval) => continue,
                        }
                    };

                    in_flight.fetch_add(1, Ordering::SeqCst);

                    let Some(handler) = handlers.get(&message.kind) else {
                        tracing::error!(
                            queue_job_id = message.id,
                            kind = %message.kind,
                            "no handler registered for kind, discarding message"
                        );
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    };

                    let outcome = handler
                        .work(QueueJob {
                            id: message.id,
                            kind: message.kind.clone(),
                            args: message.args.clone(),
                            error_count: message.error_count,
                            priority: message.priority,
                        })
                        .await;

                    if let Err(err) = outcome {
                        message.error_count += 1;
                        if message.error_count >= config.max_attempts {
                            tracing::error!(
                                queue_job_id = message.id,
                                kind = %message.kind,
                                error = %err,
                                attempts = message.error_count,
                                "message exhausted retries, discarding"
                            );
                        } else {
                            let delay = scaled_backoff(message.error_count, backoff_scale);
                            tracing::warn!(
                                queue_job_id = message.id,
                                kind = %message.kind,
                                error = %err,
                                retry_in_ms = delay.as_millis() as u64,
                                "message failed, rescheduling"
                            );
                            message.ready_at = Instant::now() + delay;
                            messages.lock().unwrap().push(message);
                        }
                    }

                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HandlerError, JobHandler};
    use std::sync::atomic::AtomicI32;

    struct Recorder {
        calls: AtomicI32,
        fail_first: i32,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn work(&self, _job: QueueJob) -> Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err("induced failure".into());
            }
            Ok(())
        }
    }

    #[test]
    fn test_backoff_scaling() {
        // error_count^4 + 3 seconds, scaled down to milliseconds.
        assert_eq!(scaled_backoff(1, 1000), Duration::from_secs(4));
        assert_eq!(scaled_backoff(1, 1), Duration::from_millis(4));
        assert_eq!(scaled_backoff(2, 1), Duration::from_millis(19));
    }

    fn fast_config() -> MemoryQueueConfig {
        MemoryQueueConfig {
            max_attempts: 3,
            backoff_scale_ms: 1,
            poll_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_delivers_to_registered_handler() {
        let queue = MemoryQueue::new(fast_config());
        let recorder = Arc::new(Recorder {
            calls: AtomicI32::new(0),
            fail_first: 0,
        });
        queue.register("test_kind", recorder.clone());
        queue.start(2).await.unwrap();

        queue
            .enqueue("test_kind", serde_json::json!({"n": 1}), 1)
            .await
            .unwrap();
        queue.drain().await;
        queue.stop().await;

        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let queue = MemoryQueue::new(fast_config());
        let recorder = Arc::new(Recorder {
            calls: AtomicI32::new(0),
            fail_first: 2,
        });
        queue.register("test_kind", recorder.clone());
        queue.start(1).await.unwrap();

        queue
            .enqueue("test_kind", serde_json::json!({}), 1)
            .await
            .unwrap();
        queue.drain().await;
        queue.stop().await;

        assert_eq!(recorder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_discards_after_max_attempts() {
        let queue = MemoryQueue::new(fast_config());
        let recorder = Arc::new(Recorder {
            calls: AtomicI32::new(0),
            fail_first: i32::MAX,
        });
        queue.register("test_kind", recorder.clone());
        queue.start(1).await.unwrap();

        queue
            .enqueue("test_kind", serde_json::json!({}), 1)
            .await
            .unwrap();
        queue.drain().await;
        queue.stop().await;

        assert_eq!(recorder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_priority_orders_dequeue() {
        let queue = MemoryQueue::new(fast_config());

        // Record the order in which payloads are seen.
        struct OrderRecorder {
            seen: Mutex<Vec<i64>>,
        }

        #[async_trait]
        impl JobHandler for OrderRecorder {
            async fn work(&self, job: QueueJob) -> Result<(), HandlerError> {
                self.seen
                    .lock()
                    .unwrap()
                    .push(job.args.get("n").and_then(Value::as_i64).unwrap_or(-1));
                Ok(())
            }
        }

        let recorder = Arc::new(OrderRecorder {
            seen: Mutex::new(Vec::new()),
        });
        queue.register("ordered", recorder.clone());

        queue
            .enqueue("ordered", serde_json::json!({"n": 3}), 30)
            .await
            .unwrap();
        queue
            .enqueue("ordered", serde_json::json!({"n": 1}), 10)
            .await
            .unwrap();
        queue
            .enqueue("ordered", serde_json::json!({"n": 2}), 20)
            .await
            .unwrap();

        // Single worker so completion order mirrors dequeue order.
        queue.start(1).await.unwrap();
        queue.drain().await;
        queue.stop().await;

        assert_eq!(*recorder.seen.lock().unwrap(), vec![1, 2, 3]);
    }
}
