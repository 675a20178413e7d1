//! Time-based archival and expiry of terminal jobs.
//!
//! Triggered by `cleanup_job` messages from an external scheduler. Four
//! sweeps run per pass, each independent: a failing sweep is logged,
//! alerted and skipped, and the handler returns an error afterwards so the
//! queue retries the whole pass.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use benex_core::{CleanupJobArgs, Job, JobStatus};
use benex_queue::{HandlerError, JobHandler, QueueJob};
use benex_store::JobStore;

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::notify::Alerter;

/// Handler for `cleanup_job` messages.
pub struct CleanupWorker {
    store: Arc<dyn JobStore>,
    config: WorkerConfig,
    alerter: Arc<dyn Alerter>,
}

impl CleanupWorker {
    pub fn new(store: Arc<dyn JobStore>, config: WorkerConfig, alerter: Arc<dyn Alerter>) -> Self {
        Self {
            store,
            config,
            alerter,
        }
    }

    fn job_dir(&self, root: &Path, job_id: i64) -> PathBuf {
        root.join(job_id.to_string())
    }

    /// Runs all four sweeps with one shared cutoff, returning how many
    /// sweeps failed.
    pub async fn run_sweeps(&self) -> Result<(), WorkerError> {
        let cutoff = Utc::now() - Duration::hours(self.config.archive_threshold_hours);
        let mut failed_sweeps = 0u32;

        let sweeps: [(&str, JobStatus); 4] = [
            ("expire archived jobs", JobStatus::Archived),
            ("expire failed jobs", JobStatus::Failed),
            ("expire cancelled jobs", JobStatus::Cancelled),
            ("archive completed jobs", JobStatus::Completed),
        ];
        for (name, status) in sweeps {
            let result = match status {
                JobStatus::Archived => self.expire(cutoff, status, JobStatus::Expired).await,
                JobStatus::Failed => self.expire(cutoff, status, JobStatus::FailedExpired).await,
                JobStatus::Cancelled => {
                    self.expire(cutoff, status, JobStatus::CancelledExpired).await
                }
                _ => self.archive_completed(cutoff).await,
            };
            if let Err(err) = result {
                failed_sweeps += 1;
                tracing::error!(sweep = name, error = %err, "cleanup sweep failed");
                self.alerter.alert(name, &err.to_string()).await;
            }
        }

        if failed_sweeps > 0 {
            return Err(WorkerError::Io(std::io::Error::other(format!(
                "{failed_sweeps} cleanup sweep(s) failed"
            ))));
        }
        Ok(())
    }

    /// Deletes a stale job's remaining artifact trees and moves it to its
    /// expired status.
    async fn expire(
        &self,
        cutoff: chrono::DateTime<Utc>,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<(), WorkerError> {
        let jobs = self.store.jobs_updated_before(cutoff, from).await?;
        let mut failures = 0u32;
        for job in &jobs {
            if let Err(err) = self.expire_one(job, from, to).await {
                failures += 1;
                tracing::error!(job_id = job.id, error = %err, "failed to expire job");
            }
        }
        if failures > 0 {
            return Err(WorkerError::Io(std::io::Error::other(format!(
                "{failures} of {} job(s) failed to expire",
                jobs.len()
            ))));
        }
        Ok(())
    }

    async fn expire_one(&self, job: &Job, from: JobStatus, to: JobStatus) -> Result<(), WorkerError> {
        // Archived jobs live in the archive tree; failed and cancelled jobs
        // may have output stranded in either working tree.
        if from == JobStatus::Archived {
            remove_if_exists(&self.job_dir(&self.config.archive_dir, job.id)).await?;
        } else {
            remove_if_exists(&self.job_dir(&self.config.payload_dir, job.id)).await?;
        }
        remove_if_exists(&self.job_dir(&self.config.staging_dir, job.id)).await?;

        self.store.update_job_status(job.id, to).await?;
        tracing::info!(job_id = job.id, from = %from, to = %to, "job expired");
        Ok(())
    }

    /// Moves stale completed jobs' payload into the archive tree.
    async fn archive_completed(&self, cutoff: chrono::DateTime<Utc>) -> Result<(), WorkerError> {
        let jobs = self
            .store
            .jobs_updated_before(cutoff, JobStatus::Completed)
            .await?;
        let mut failures = 0u32;
        for job in &jobs {
            if let Err(err) = self.archive_one(job).await {
                failures += 1;
                tracing::error!(job_id = job.id, error = %err, "failed to archive job");
            }
        }
        if failures > 0 {
            return Err(WorkerError::Io(std::io::Error::other(format!(
                "{failures} of {} job(s) failed to archive",
                jobs.len()
            ))));
        }
        Ok(())
    }

    async fn archive_one(&self, job: &Job) -> Result<(), WorkerError> {
        let payload = self.job_dir(&self.config.payload_dir, job.id);
        let archive = self.job_dir(&self.config.archive_dir, job.id);

        if payload.exists() {
            tokio::fs::create_dir_all(&self.config.archive_dir).await?;
            tokio::fs::rename(&payload, &archive).await?;
        }

        self.store
            .update_job_status(job.id, JobStatus::Archived)
            .await?;
        tracing::info!(job_id = job.id, "job archived");
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), WorkerError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl JobHandler for CleanupWorker {
    async fn work(&self, message: QueueJob) -> Result<(), HandlerError> {
        if let Err(err) = serde_json::from_value::<CleanupJobArgs>(message.args.clone()) {
            tracing::error!(
                queue_job_id = message.id,
                error = %err,
                "undeserializable cleanup_job payload, dropping"
            );
            return Ok(());
        }

        self.run_sweeps().await.map_err(Into::into)
    }
}
