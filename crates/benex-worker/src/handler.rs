//! Queue-facing handler for the `process_job` message kind.
//!
//! Translates [`WorkerError`] variants into the two signals the transport
//! understands: `Ok` acknowledges the message, `Err` asks for a retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use benex_core::ExportJobArgs;
use benex_queue::{HandlerError, JobHandler, QueueJob};
use benex_store::JobStore;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::watch::watch_for_cancellation;
use crate::worker::ExportWorker;

/// Handler for `process_job` messages.
pub struct ProcessJobHandler {
    worker: Arc<ExportWorker>,
    store: Arc<dyn JobStore>,
    config: WorkerConfig,
}

impl ProcessJobHandler {
    pub fn new(worker: Arc<ExportWorker>, store: Arc<dyn JobStore>, config: WorkerConfig) -> Self {
        Self {
            worker,
            store,
            config,
        }
    }

    /// Runs the completion detector, logging rather than propagating
    /// failures; the next sub-job or redelivery will try again.
    async fn detect_completion(&self, job_id: i64) {
        if let Err(err) = self.worker.check_job_complete_and_cleanup(job_id).await {
            tracing::error!(job_id, error = %err, "completion check failed");
        }
    }
}

#[async_trait]
impl JobHandler for ProcessJobHandler {
    async fn work(&self, message: QueueJob) -> Result<(), HandlerError> {
        let args: ExportJobArgs = match serde_json::from_value(message.args.clone()) {
            Ok(args) => args,
            Err(err) => {
                // Poison message: retrying cannot fix it.
                tracing::error!(
                    queue_job_id = message.id,
                    error = %err,
                    "undeserializable process_job payload, dropping"
                );
                return Ok(());
            }
        };

        match self.worker.validate_job(&args, message.id).await {
            Ok(_) => {}
            Err(WorkerError::NoBasePath) => {
                tracing::error!(
                    job_id = args.job_id,
                    queue_job_id = message.id,
                    "message has no data-provider base path, dropping"
                );
                return Ok(());
            }
            Err(err @ WorkerError::ParentJobNotFound(_)) => {
                if message.error_count < self.config.max_not_found_retries {
                    tracing::warn!(
                        job_id = args.job_id,
                        queue_job_id = message.id,
                        error_count = message.error_count,
                        "parent job not visible yet, retrying"
                    );
                    return Err(err.into());
                }
                tracing::error!(
                    job_id = args.job_id,
                    queue_job_id = message.id,
                    "parent job never appeared, dropping"
                );
                return Ok(());
            }
            Err(WorkerError::ParentJobCancelled(_)) | Err(WorkerError::ParentJobFailed(_)) => {
                tracing::info!(
                    job_id = args.job_id,
                    queue_job_id = message.id,
                    "parent job already terminal, dropping sub-job"
                );
                return Ok(());
            }
            Err(WorkerError::AlreadyProcessed(_)) => {
                tracing::info!(
                    job_id = args.job_id,
                    queue_job_id = message.id,
                    "redelivered message, job key already exists"
                );
                // The previous delivery may have died between its job key
                // and the completion check.
                self.detect_completion(args.job_id).await;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(watch_for_cancellation(
            self.store.clone(),
            args.job_id,
            cancel.clone(),
            Duration::from_secs(self.config.cancellation_poll_secs),
        ));

        let result = self.worker.process_job(&args, message.id, &cancel).await;
        cancel.cancel();
        let _ = watcher.await;

        // Run the detector even after a failure: this sub-job may have been
        // the only missing key, or a sibling may have failed the job and
        // the detector's terminal fast path keeps it that way.
        self.detect_completion(args.job_id).await;

        result.map_err(Into::into)
    }
}
