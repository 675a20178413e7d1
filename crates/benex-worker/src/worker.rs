//! Export sub-job execution: validation, beneficiary streaming, and
//! completion detection.
//!
//! One sub-job exports one resource type for one batch of beneficiaries.
//! Output accumulates in a per-attempt scratch directory and is moved into
//! `{staging}/{job_id}/{uuid}.ndjson` only once the attempt succeeds;
//! per-beneficiary failures go to the `{uuid}-error.ndjson` sibling as
//! OperationOutcome lines. The job key written at the end is the only
//! durable success signal, which makes redelivered messages safe to drop
//! once their key exists.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use benex_core::{
    BLANK_FILE_NAME, Beneficiary, ExportJobArgs, Job, JobKey, JobStatus, ResourceType,
};
use benex_provider::{Bundle, BundleClient, FetchContext, ProviderError};
use benex_store::{JobStore, StoreError};

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::outcome::{append_outcome, operation_outcome};
use crate::writer::NdjsonWriter;

/// Builds a provider client rooted at one sub-job's base path.
pub type ClientFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn BundleClient>, ProviderError> + Send + Sync>;

/// True once the failed share of a sub-job's beneficiaries reaches the
/// threshold percentage.
pub fn threshold_exceeded(failed: usize, total: usize, threshold_pct: f64) -> bool {
    if total == 0 {
        return false;
    }
    (failed as f64 / total as f64) * 100.0 >= threshold_pct
}

/// Executes export sub-jobs against a [`JobStore`] and a provider client.
pub struct ExportWorker {
    store: Arc<dyn JobStore>,
    clients: ClientFactory,
    config: WorkerConfig,
}

impl ExportWorker {
    pub fn new(store: Arc<dyn JobStore>, clients: ClientFactory, config: WorkerConfig) -> Self {
        Self {
            store,
            clients,
            config,
        }
    }

    fn staging_dir(&self, job_id: i64) -> PathBuf {
        self.config.staging_dir.join(job_id.to_string())
    }

    fn payload_dir(&self, job_id: i64) -> PathBuf {
        self.config.payload_dir.join(job_id.to_string())
    }

    /// Classifies a delivered message before any provider I/O happens.
    ///
    /// The distinction between the error variants matters to the
    /// queue-facing handler: some mean "drop", one means "retry for a
    /// while", and the rest are faults.
    pub async fn validate_job(
        &self,
        args: &ExportJobArgs,
        queue_job_id: i64,
    ) -> Result<Job, WorkerError> {
        if args.base_path.is_empty() {
            return Err(WorkerError::NoBasePath);
        }

        let job = match self.store.get_job(args.job_id).await {
            Ok(job) => job,
            Err(err) if err.is_not_found() => {
                return Err(WorkerError::ParentJobNotFound(args.job_id));
            }
            Err(err) => return Err(err.into()),
        };

        match job.status {
            JobStatus::Cancelled => return Err(WorkerError::ParentJobCancelled(job.id)),
            JobStatus::Failed => return Err(WorkerError::ParentJobFailed(job.id)),
            _ => {}
        }

        if self
            .store
            .job_key_for_queue_job(args.job_id, queue_job_id)
            .await?
            .is_some()
        {
            return Err(WorkerError::AlreadyProcessed(job.id));
        }

        Ok(job)
    }

    /// Runs one validated sub-job to its job key.
    ///
    /// Beneficiaries are fetched strictly sequentially; the cancellation
    /// token is observed at each beneficiary boundary.
    pub async fn process_job(
        &self,
        args: &ExportJobArgs,
        queue_job_id: i64,
        cancel: &CancellationToken,
    ) -> Result<(), WorkerError> {
        match self
            .store
            .update_job_status_checked(args.job_id, JobStatus::Pending, JobStatus::InProgress)
            .await
        {
            Ok(()) => {}
            // A sibling sub-job made the transition first.
            Err(StoreError::JobNotUpdated) => {
                tracing::debug!(job_id = args.job_id, "job already in progress");
            }
            Err(err) => return Err(err.into()),
        }

        let staging = self.staging_dir(args.job_id);
        tokio::fs::create_dir_all(&staging).await?;
        tokio::fs::create_dir_all(self.payload_dir(args.job_id)).await?;

        // Each delivery writes into its own scratch directory and the output
        // moves into the shared staging tree only once the attempt succeeds,
        // so a failed attempt leaves nothing for the completion move to pick
        // up and a redelivery starts from a clean slate.
        let file_id = Uuid::new_v4();
        let attempt_dir = self.config.staging_dir.join(format!("tmp-{file_id}"));
        tokio::fs::create_dir_all(&attempt_dir).await?;

        let result = self
            .run_attempt(args, queue_job_id, cancel, &staging, &attempt_dir, file_id)
            .await;

        if let Err(err) = tokio::fs::remove_dir_all(&attempt_dir).await {
            tracing::warn!(
                job_id = args.job_id,
                queue_job_id,
                error = %err,
                "failed to remove attempt scratch directory"
            );
        }
        result
    }

    async fn run_attempt(
        &self,
        args: &ExportJobArgs,
        queue_job_id: i64,
        cancel: &CancellationToken,
        staging: &Path,
        attempt_dir: &Path,
        file_id: Uuid,
    ) -> Result<(), WorkerError> {
        let client = (self.clients)(&args.base_path)?;
        let ctx = FetchContext::from(args);
        let output_name = format!("{file_id}.ndjson");
        let error_name = format!("{file_id}-error.ndjson");
        let output_path = attempt_dir.join(&output_name);
        let error_path = attempt_dir.join(&error_name);

        let mut writer = NdjsonWriter::create(&output_path).await?;
        let threshold = self.config.effective_failure_threshold();
        let total = args.beneficiary_ids.len();
        let mut failed = 0usize;

        for &beneficiary_id in &args.beneficiary_ids {
            if cancel.is_cancelled() {
                append_outcome(
                    &error_path,
                    &operation_outcome(None, "export cancelled before completion"),
                )
                .await?;
                return Err(WorkerError::Cancelled(args.job_id));
            }

            match self.store.get_beneficiary(beneficiary_id).await {
                Ok(beneficiary) => {
                    match fetch_bundle(client.as_ref(), &ctx, args.resource_type, &beneficiary)
                        .await
                    {
                        Ok(bundle) => {
                            for resource in &bundle.entries {
                                writer.write_resource(resource).await?;
                            }
                        }
                        Err(err) => {
                            failed += 1;
                            tracing::warn!(
                                job_id = args.job_id,
                                queue_job_id,
                                beneficiary_id,
                                resource_type = %args.resource_type,
                                transaction_id = %args.transaction_id,
                                error = %err,
                                "beneficiary export failed"
                            );
                            append_outcome(
                                &error_path,
                                &operation_outcome(
                                    Some(&beneficiary.mbi),
                                    &format!("error retrieving {}", args.resource_type),
                                ),
                            )
                            .await?;
                        }
                    }
                }
                Err(err) if matches!(err, StoreError::BeneficiaryNotFound) => {
                    failed += 1;
                    tracing::warn!(
                        job_id = args.job_id,
                        beneficiary_id,
                        "beneficiary missing from roster"
                    );
                    append_outcome(
                        &error_path,
                        &operation_outcome(None, "beneficiary missing from attribution roster"),
                    )
                    .await?;
                }
                Err(err) => return Err(err.into()),
            }

            if threshold_exceeded(failed, total, threshold) {
                tracing::error!(
                    job_id = args.job_id,
                    queue_job_id,
                    failed,
                    total,
                    threshold_pct = threshold,
                    "failure threshold exceeded, failing job"
                );
                match self
                    .store
                    .update_job_status_checked(args.job_id, JobStatus::InProgress, JobStatus::Failed)
                    .await
                {
                    Ok(()) | Err(StoreError::JobNotUpdated) => {}
                    Err(err) => return Err(err.into()),
                }
                return Err(WorkerError::ThresholdExceeded { failed, total });
            }
        }

        let bytes_written = writer.finish().await?;
        let mut staged = Vec::new();
        let file_name = if bytes_written == 0 {
            // No output at all: the empty scratch file is discarded with the
            // attempt directory and the sentinel name recorded instead.
            BLANK_FILE_NAME.to_string()
        } else {
            let target = staging.join(&output_name);
            tokio::fs::rename(&output_path, &target).await?;
            staged.push(target);
            output_name
        };
        if failed > 0 {
            let target = staging.join(&error_name);
            tokio::fs::rename(&error_path, &target).await?;
            staged.push(target);
        }

        let mut keys = vec![JobKey {
            job_id: args.job_id,
            que_job_id: Some(queue_job_id),
            file_name,
            resource_type: args.resource_type,
        }];
        if failed > 0 {
            keys.push(JobKey {
                job_id: args.job_id,
                que_job_id: Some(queue_job_id),
                file_name: error_name,
                resource_type: args.resource_type,
            });
        }
        if let Err(err) = self.store.create_job_keys(&keys).await {
            // Unkeyed staged files would be published as orphans once the
            // retried delivery completes the job, so pull them back out.
            for path in &staged {
                if let Err(rm_err) = tokio::fs::remove_file(path).await {
                    tracing::warn!(
                        job_id = args.job_id,
                        path = %path.display(),
                        error = %rm_err,
                        "failed to unstage file"
                    );
                }
            }
            return Err(err.into());
        }

        // Advisory progress counter; drift is tolerated.
        if let Err(err) = self.store.increment_completed_job_count(args.job_id).await {
            tracing::warn!(
                job_id = args.job_id,
                error = %err,
                "failed to bump completed sub-job counter"
            );
        }

        tracing::info!(
            job_id = args.job_id,
            queue_job_id,
            resource_type = %args.resource_type,
            transaction_id = %args.transaction_id,
            beneficiaries = total,
            failed,
            "sub-job finished"
        );
        Ok(())
    }

    /// Completes the parent job once every expected job key exists.
    ///
    /// Returns `Ok(true)` when the job is in (or has just reached) a
    /// terminal state, `Ok(false)` when sub-jobs are still outstanding.
    /// Safe to call speculatively and after redeliveries.
    pub async fn check_job_complete_and_cleanup(&self, job_id: i64) -> Result<bool, WorkerError> {
        let job = self.store.get_job(job_id).await?;

        if job.status == JobStatus::Completed {
            return Ok(true);
        }
        if job.status.is_terminal() {
            tracing::warn!(job_id, status = %job.status, "job already terminal, skipping completion");
            return Ok(true);
        }

        let key_count = self.store.job_key_count(job_id).await?;
        if job.job_count <= 0 || key_count < i64::from(job.job_count) {
            return Ok(false);
        }

        // All sub-jobs accounted for: publish the staged output.
        let staging = self.staging_dir(job_id);
        let payload = self.payload_dir(job_id);
        tokio::fs::create_dir_all(&payload).await?;

        match tokio::fs::read_dir(&staging).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let target = payload.join(entry.file_name());
                    match tokio::fs::rename(entry.path(), target).await {
                        Ok(()) => {}
                        // A concurrent detector pass won the move.
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                match tokio::fs::remove_dir(&staging).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
            // Already published by an earlier pass.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        match self
            .store
            .update_job_status_checked(job_id, JobStatus::InProgress, JobStatus::Completed)
            .await
        {
            Ok(()) => {
                tracing::info!(job_id, key_count, "job completed");
            }
            // An external transition (a cancel, or a sibling detector pass)
            // landed between the key-count check and the write; it wins.
            Err(StoreError::JobNotUpdated) => {
                tracing::warn!(job_id, "status changed during completion, leaving it");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(true)
    }
}

async fn resolve_patient_id(
    client: &dyn BundleClient,
    beneficiary: &Beneficiary,
) -> Result<String, WorkerError> {
    match &beneficiary.patient_id {
        Some(id) => Ok(id.clone()),
        None => Ok(client.lookup_patient_id(&beneficiary.mbi).await?),
    }
}

async fn fetch_bundle(
    client: &dyn BundleClient,
    ctx: &FetchContext,
    resource_type: ResourceType,
    beneficiary: &Beneficiary,
) -> Result<Bundle, WorkerError> {
    let bundle = match resource_type {
        ResourceType::Patient => {
            let patient_id = resolve_patient_id(client, beneficiary).await?;
            client.fetch_patient(ctx, &patient_id).await?
        }
        ResourceType::Coverage => {
            let patient_id = resolve_patient_id(client, beneficiary).await?;
            client.fetch_coverage(ctx, &patient_id).await?
        }
        ResourceType::ExplanationOfBenefit => {
            let patient_id = resolve_patient_id(client, beneficiary).await?;
            client.fetch_explanation_of_benefit(ctx, &patient_id).await?
        }
        ResourceType::Claim => client.fetch_claim(ctx, &beneficiary.mbi).await?,
        ResourceType::ClaimResponse => client.fetch_claim_response(ctx, &beneficiary.mbi).await?,
    };
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use benex_core::ClaimsWindow;
    use benex_store::{MemoryStore, NewJob};
    use chrono::Utc;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> WorkerConfig {
        WorkerConfig {
            staging_dir: dir.path().join("staging"),
            payload_dir: dir.path().join("payload"),
            archive_dir: dir.path().join("archive"),
            ..WorkerConfig::default()
        }
    }

    fn unused_clients() -> ClientFactory {
        Arc::new(|_| Err(ProviderError::PatientNotFound))
    }

    fn worker_with(store: Arc<MemoryStore>, dir: &TempDir) -> ExportWorker {
        ExportWorker::new(store, unused_clients(), test_config(dir))
    }

    async fn pending_job(store: &MemoryStore, job_count: i32) -> Job {
        store
            .create_job(NewJob {
                aco_id: Uuid::new_v4(),
                request_url: "/api/v2/Group/all/$export".into(),
                status: JobStatus::Pending,
                transaction_time: Utc::now(),
                job_count,
            })
            .await
            .unwrap()
    }

    fn args_for(job: &Job) -> ExportJobArgs {
        ExportJobArgs {
            job_id: job.id,
            aco_id: job.aco_id,
            cms_id: "A0001".into(),
            beneficiary_ids: vec![],
            resource_type: ResourceType::Patient,
            since: None,
            transaction_time: job.transaction_time,
            claims_window: ClaimsWindow::default(),
            base_path: "/v2/fhir".into(),
            transaction_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_threshold_boundary() {
        // 2 of 3 failed is 66.6%.
        assert!(threshold_exceeded(2, 3, 60.0));
        assert!(!threshold_exceeded(2, 3, 70.0));
        assert!(threshold_exceeded(3, 3, 70.0));
        assert!(!threshold_exceeded(0, 3, 50.0));
        // Empty batches never trip the threshold.
        assert!(!threshold_exceeded(0, 0, 0.0));
    }

    #[tokio::test]
    async fn test_validate_rejects_empty_base_path() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let job = pending_job(&store, 1).await;
        let worker = worker_with(store, &dir);

        let mut args = args_for(&job);
        args.base_path.clear();
        let err = worker.validate_job(&args, 1).await.unwrap_err();
        assert!(matches!(err, WorkerError::NoBasePath));
    }

    #[tokio::test]
    async fn test_validate_reports_missing_parent() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let job = pending_job(&store, 1).await;
        let worker = worker_with(store, &dir);

        let mut args = args_for(&job);
        args.job_id = 9999;
        let err = worker.validate_job(&args, 1).await.unwrap_err();
        assert!(matches!(err, WorkerError::ParentJobNotFound(9999)));
    }

    #[tokio::test]
    async fn test_validate_classifies_terminal_parents() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let job = pending_job(&store, 1).await;
        store
            .update_job_status(job.id, JobStatus::Cancelled)
            .await
            .unwrap();
        let worker = worker_with(store.clone(), &dir);

        let err = worker.validate_job(&args_for(&job), 1).await.unwrap_err();
        assert!(matches!(err, WorkerError::ParentJobCancelled(_)));

        store
            .update_job_status(job.id, JobStatus::Failed)
            .await
            .unwrap();
        let err = worker.validate_job(&args_for(&job), 1).await.unwrap_err();
        assert!(matches!(err, WorkerError::ParentJobFailed(_)));
    }

    #[tokio::test]
    async fn test_validate_detects_redelivery() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let job = pending_job(&store, 1).await;
        store
            .create_job_keys(&[JobKey {
                job_id: job.id,
                que_job_id: Some(42),
                file_name: "done.ndjson".into(),
                resource_type: ResourceType::Patient,
            }])
            .await
            .unwrap();
        let worker = worker_with(store, &dir);

        let err = worker.validate_job(&args_for(&job), 42).await.unwrap_err();
        assert!(matches!(err, WorkerError::AlreadyProcessed(_)));

        // A different queue message for the same job is still fresh work.
        let dir2 = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let job = pending_job(&store, 1).await;
        let worker = worker_with(store, &dir2);
        assert!(worker.validate_job(&args_for(&job), 43).await.is_ok());
    }

    #[tokio::test]
    async fn test_detector_is_idempotent_on_completed() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let job = pending_job(&store, 1).await;
        store
            .update_job_status(job.id, JobStatus::Completed)
            .await
            .unwrap();
        let worker = worker_with(store, &dir);

        assert!(worker.check_job_complete_and_cleanup(job.id).await.unwrap());
        // No staging or payload tree was ever created.
        assert!(!dir.path().join("staging").exists());
    }

    #[tokio::test]
    async fn test_detector_waits_for_outstanding_keys() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let job = pending_job(&store, 2).await;
        store
            .create_job_keys(&[JobKey {
                job_id: job.id,
                que_job_id: Some(1),
                file_name: "a.ndjson".into(),
                resource_type: ResourceType::Patient,
            }])
            .await
            .unwrap();
        let worker = worker_with(store.clone(), &dir);

        assert!(!worker.check_job_complete_and_cleanup(job.id).await.unwrap());
        assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_detector_publishes_staging_and_completes() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let job = pending_job(&store, 1).await;
        store
            .update_job_status(job.id, JobStatus::InProgress)
            .await
            .unwrap();
        store
            .create_job_keys(&[JobKey {
                job_id: job.id,
                que_job_id: Some(1),
                file_name: "a.ndjson".into(),
                resource_type: ResourceType::Patient,
            }])
            .await
            .unwrap();

        let staging = dir.path().join("staging").join(job.id.to_string());
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("a.ndjson"), "{}\n").unwrap();

        let worker = worker_with(store.clone(), &dir);
        assert!(worker.check_job_complete_and_cleanup(job.id).await.unwrap());

        assert!(!staging.exists());
        let payload = dir.path().join("payload").join(job.id.to_string());
        assert!(payload.join("a.ndjson").exists());
        assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_detector_skips_failed_jobs_without_touching_files() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let job = pending_job(&store, 1).await;
        store
            .update_job_status(job.id, JobStatus::Failed)
            .await
            .unwrap();

        let staging = dir.path().join("staging").join(job.id.to_string());
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("a.ndjson"), "{}\n").unwrap();

        let worker = worker_with(store, &dir);
        assert!(worker.check_job_complete_and_cleanup(job.id).await.unwrap());
        assert!(staging.join("a.ndjson").exists());
    }

    /// Flips the job to Cancelled while the detector is counting keys,
    /// simulating an external cancel landing inside the completion window.
    struct CancelMidCount {
        inner: Arc<MemoryStore>,
    }

    #[async_trait::async_trait]
    impl JobStore for CancelMidCount {
        async fn create_job(&self, new: benex_store::NewJob) -> Result<Job, StoreError> {
            self.inner.create_job(new).await
        }
        async fn get_job(&self, job_id: i64) -> Result<Job, StoreError> {
            self.inner.get_job(job_id).await
        }
        async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
            self.inner.update_job(job).await
        }
        async fn update_job_status(&self, job_id: i64, new: JobStatus) -> Result<(), StoreError> {
            self.inner.update_job_status(job_id, new).await
        }
        async fn update_job_status_checked(
            &self,
            job_id: i64,
            current: JobStatus,
            new: JobStatus,
        ) -> Result<(), StoreError> {
            self.inner
                .update_job_status_checked(job_id, current, new)
                .await
        }
        async fn increment_completed_job_count(&self, job_id: i64) -> Result<(), StoreError> {
            self.inner.increment_completed_job_count(job_id).await
        }
        async fn jobs_updated_before(
            &self,
            cutoff: chrono::DateTime<Utc>,
            status: JobStatus,
        ) -> Result<Vec<Job>, StoreError> {
            self.inner.jobs_updated_before(cutoff, status).await
        }
        async fn create_job_keys(&self, keys: &[JobKey]) -> Result<(), StoreError> {
            self.inner.create_job_keys(keys).await
        }
        async fn job_key_count(&self, job_id: i64) -> Result<i64, StoreError> {
            self.inner
                .update_job_status(job_id, JobStatus::Cancelled)
                .await?;
            self.inner.job_key_count(job_id).await
        }
        async fn job_key_for_queue_job(
            &self,
            job_id: i64,
            que_job_id: i64,
        ) -> Result<Option<JobKey>, StoreError> {
            self.inner.job_key_for_queue_job(job_id, que_job_id).await
        }
        async fn get_beneficiary(&self, id: i64) -> Result<Beneficiary, StoreError> {
            self.inner.get_beneficiary(id).await
        }
        async fn beneficiary_ids_for_aco(&self, aco_id: Uuid) -> Result<Vec<i64>, StoreError> {
            self.inner.beneficiary_ids_for_aco(aco_id).await
        }
    }

    #[tokio::test]
    async fn test_detector_yields_to_concurrent_cancel() {
        let dir = TempDir::new().unwrap();
        let inner = Arc::new(MemoryStore::new());
        let job = pending_job(&inner, 1).await;
        inner
            .update_job_status(job.id, JobStatus::InProgress)
            .await
            .unwrap();
        inner
            .create_job_keys(&[JobKey {
                job_id: job.id,
                que_job_id: Some(1),
                file_name: "a.ndjson".into(),
                resource_type: ResourceType::Patient,
            }])
            .await
            .unwrap();

        let store = Arc::new(CancelMidCount {
            inner: inner.clone(),
        });
        let worker = ExportWorker::new(store, unused_clients(), test_config(&dir));

        // The detector still reports the job terminal, but the concurrent
        // cancel is not overwritten with Completed.
        assert!(worker.check_job_complete_and_cleanup(job.id).await.unwrap());
        assert_eq!(
            inner.get_job(job.id).await.unwrap().status,
            JobStatus::Cancelled
        );
    }
}
