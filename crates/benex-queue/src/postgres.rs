//! PostgreSQL implementation of the [`QueueTransport`] trait.
//!
//! Messages live in a `queue_jobs` table. Workers lease one row at a time
//! with `FOR UPDATE SKIP LOCKED`, so concurrent workers never double-claim;
//! an acknowledged message is deleted, a failed one is rescheduled with the
//! shared backoff curve until its attempt budget runs out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx_core::query::query;
use sqlx_core::row::Row;
use sqlx_postgres::{PgPool, PgPoolOptions};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::transport::{HandlerMap, QueueJob, QueueTransport, retry_backoff};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresQueueConfig {
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Delivery attempts before a message is discarded.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    /// Idle dequeue poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Create the queue table on startup.
    #[serde(default = "default_true")]
    pub ensure_schema: bool,
}

fn default_pool_size() -> u32 {
    5
}

fn default_max_attempts() -> i32 {
    10
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

impl Default for PostgresQueueConfig {
    fn default() -> Self {
        Self {
            url: "postgres://postgres@localhost/benex".into(),
            pool_size: default_pool_size(),
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            ensure_schema: true,
        }
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_jobs (
    id BIGSERIAL PRIMARY KEY,
    kind TEXT NOT NULL,
    args JSONB NOT NULL,
    priority SMALLINT NOT NULL DEFAULT 0,
    state TEXT NOT NULL DEFAULT 'available',
    error_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    scheduled_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Durable work queue on PostgreSQL.
pub struct PostgresQueue {
    pool: PgPool,
    config: PostgresQueueConfig,
    handlers: HandlerMap,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PostgresQueue {
    /// Connects a pool and optionally bootstraps the queue table.
    pub async fn new(config: PostgresQueueConfig) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect(&config.url)
            .await?;

        if config.ensure_schema {
            query(SCHEMA).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            config,
            handlers: HandlerMap::default(),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Wraps an existing pool. The queue table is assumed to exist.
    pub fn from_pool(pool: PgPool, config: PostgresQueueConfig) -> Self {
        Self {
            pool,
            config,
            handlers: HandlerMap::default(),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Leases the next available message, if any.
    async fn claim(pool: &PgPool) -> Result<Option<QueueJob>, QueueError> {
        let row = query(
            r#"
            UPDATE queue_jobs
            SET state = 'running'
            WHERE id = (
                SELECT id FROM queue_jobs
                WHERE state = 'available' AND scheduled_at <= NOW()
                ORDER BY priority, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, kind, args, priority, error_count
            "#,
        )
        .fetch_optional(pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(QueueJob {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            args: row.try_get("args")?,
            error_count: row.try_get("error_count")?,
            priority: row.try_get("priority")?,
        }))
    }

    /// Acknowledges a message by deleting its row.
    async fn complete(pool: &PgPool, id: i64) -> Result<(), QueueError> {
        query("DELETE FROM queue_jobs WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Records a failed attempt: reschedule with backoff, or discard once
    /// the attempt budget is spent.
    async fn fail(
        pool: &PgPool,
        job: &QueueJob,
        max_attempts: i32,
        error: &str,
    ) -> Result<(), QueueError> {
        let attempts = job.error_count + 1;
        if attempts >= max_attempts {
            tracing::error!(
                queue_job_id = job.id,
                kind = %job.kind,
                attempts,
                error,
                "message exhausted retries, discarding"
            );
            query(
                "UPDATE queue_jobs SET state = 'discarded', error_count = $1, last_error = $2 \
                 WHERE id = $3",
            )
            .bind(attempts)
            .bind(error)
            .bind(job.id)
            .execute(pool)
            .await?;
            return Ok(());
        }

        let delay_secs = retry_backoff(attempts).as_secs() as i64;
        tracing::warn!(
            queue_job_id = job.id,
            kind = %job.kind,
            attempts,
            retry_in_secs = delay_secs,
            error,
            "message failed, rescheduling"
        );
        query(
            r#"
            UPDATE queue_jobs
            SET state = 'available',
                error_count = $1,
                last_error = $2,
                scheduled_at = NOW() + make_interval(secs => $3)
            WHERE id = $4
            "#,
        )
        .bind(attempts)
        .bind(error)
        .bind(delay_secs as f64)
        .bind(job.id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Messages not yet finished, used for queue-depth telemetry.
    pub async fn pending_count(&self) -> Result<i64, QueueError> {
        let row = query(
            "SELECT COUNT(1) AS count FROM queue_jobs WHERE state IN ('available', 'running')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("count")?)
    }
}

#[async_trait]
impl QueueTransport for PostgresQueue {
    async fn enqueue(&self, kind: &str, args: Value, priority: i16) -> Result<i64, QueueError> {
        let row = query(
            "INSERT INTO queue_jobs (kind, args, priority) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(kind)
        .bind(args)
        .bind(priority)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    fn register(&self, kind: &str, handler: Arc<dyn crate::JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    async fn start(&self, num_workers: usize) -> Result<(), QueueError> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut workers = self.workers.lock().unwrap();

        for _ in 0..num_workers {
            let pool = self.pool.clone();
            let handlers = self.handlers.clone();
            let shutdown = self.shutdown.clone();
            let max_attempts = self.config.max_attempts;

            workers.push(tokio::spawn(async move {
                loop {
                    if shutdown.is_cancelled() {
                        return;
                    }

                    let claimed = match Self::claim(&pool).await {
                        Ok(claimed) => claimed,
                        Err(err) => {
                            tracing::error!(error = %err, "failed to claim queue message");
                            None
                        }
                    };

                    let Some(job) = claimed else {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = tokio::time::sleep(poll_interval) => continue,
                        }
                    };

                    let Some(handler) = handlers.get(&job.kind) else {
                        tracing::error!(
                            queue_job_id = job.id,
                            kind = %job.kind,
                            "no handler registered for kind, discarding message"
                        );
                        if let Err(err) = Self::complete(&pool, job.id).await {
                            tracing::error!(error = %err, "failed to discard unhandled message");
                        }
                        continue;
                    };

                    let result = handler.work(job.clone()).await;
                    let outcome = match result {
                        Ok(()) => Self::complete(&pool, job.id).await,
                        Err(err) => {
                            Self::fail(&pool, &job, max_attempts, &err.to_string()).await
                        }
                    };
                    if let Err(err) = outcome {
                        // The lease stays 'running'; operator tooling can
                        // requeue stuck rows.
                        tracing::error!(
                            queue_job_id = job.id,
                            error = %err,
                            "failed to settle queue message"
                        );
                    }
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
