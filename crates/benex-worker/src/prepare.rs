//! Job preparation: fan a top-level export request out into sub-jobs.
//!
//! Preparation pins the job to one provider snapshot, resolves the
//! attribution roster, and persists the expected sub-job count *before*
//! anything is enqueued, so the completion detector can never observe a
//! job whose expected count is still unset.

use std::sync::Arc;

use async_trait::async_trait;

use benex_core::{ExportJobArgs, JobStatus, PrepareJobArgs, ResourceType};
use benex_queue::{HandlerError, JobHandler, QueueJob, QueueTransport};
use benex_store::JobStore;

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::worker::ClientFactory;

/// Dequeue priority for one sub-job; lower values run first.
///
/// Patient exports unblock callers fastest and incremental pulls are
/// cheap, so both rank ahead of full-history fetches.
pub fn job_priority(resource_type: ResourceType, has_since: bool) -> i16 {
    if resource_type == ResourceType::Patient {
        10
    } else if has_since {
        20
    } else {
        30
    }
}

/// Handler for `prepare_job` messages.
pub struct PrepareWorker {
    store: Arc<dyn JobStore>,
    clients: ClientFactory,
    queue: Arc<dyn QueueTransport>,
    config: WorkerConfig,
}

impl PrepareWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        clients: ClientFactory,
        queue: Arc<dyn QueueTransport>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            clients,
            queue,
            config,
        }
    }

    async fn run(&self, args: &PrepareJobArgs) -> Result<(), WorkerError> {
        if args.base_path.is_empty() {
            return Err(WorkerError::NoBasePath);
        }
        if args.resource_types.is_empty() {
            return Err(WorkerError::NoResourceTypes);
        }

        let mut job = self.store.get_job(args.job_id).await?;
        if job.status.is_terminal() {
            tracing::info!(
                job_id = job.id,
                status = %job.status,
                "job already terminal, skipping preparation"
            );
            return Ok(());
        }

        let client = (self.clients)(&args.base_path)?;
        let transaction_time = client.bundle_last_updated().await?;

        let roster = self.store.beneficiary_ids_for_aco(args.aco_id).await?;
        if roster.is_empty() {
            return Err(WorkerError::EmptyRoster(args.aco_id));
        }

        let mut sub_jobs = Vec::new();
        for &resource_type in &args.resource_types {
            for batch in roster.chunks(self.config.max_beneficiaries_per_job) {
                sub_jobs.push(ExportJobArgs {
                    job_id: args.job_id,
                    aco_id: args.aco_id,
                    cms_id: args.cms_id.clone(),
                    beneficiary_ids: batch.to_vec(),
                    resource_type,
                    since: args.since,
                    transaction_time,
                    claims_window: args.claims_window,
                    base_path: args.base_path.clone(),
                    transaction_id: args.transaction_id,
                });
            }
        }

        // The expected count must be durable before the first sub-job can
        // possibly finish.
        job.transaction_time = transaction_time;
        job.job_count = sub_jobs.len() as i32;
        self.store.update_job(&job).await?;

        for sub_job in &sub_jobs {
            let priority = job_priority(sub_job.resource_type, sub_job.since.is_some());
            self.queue
                .enqueue("process_job", serde_json::to_value(sub_job)?, priority)
                .await?;
        }

        tracing::info!(
            job_id = job.id,
            cms_id = %args.cms_id,
            transaction_id = %args.transaction_id,
            sub_jobs = sub_jobs.len(),
            beneficiaries = roster.len(),
            "job prepared"
        );
        Ok(())
    }
}

#[async_trait]
impl JobHandler for PrepareWorker {
    async fn work(&self, message: QueueJob) -> Result<(), HandlerError> {
        let args: PrepareJobArgs = match serde_json::from_value(message.args.clone()) {
            Ok(args) => args,
            Err(err) => {
                tracing::error!(
                    queue_job_id = message.id,
                    error = %err,
                    "undeserializable prepare_job payload, dropping"
                );
                return Ok(());
            }
        };

        match self.run(&args).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!(
                    job_id = args.job_id,
                    queue_job_id = message.id,
                    transaction_id = %args.transaction_id,
                    error = %err,
                    "job preparation failed"
                );
                if let Err(update_err) = self
                    .store
                    .update_job_status(args.job_id, JobStatus::Failed)
                    .await
                {
                    tracing::error!(
                        job_id = args.job_id,
                        error = %update_err,
                        "failed to mark unprepared job failed"
                    );
                }
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use benex_core::ClaimsWindow;
    use benex_provider::{Bundle, BundleClient, FetchContext, ProviderError};
    use benex_queue::QueueError;
    use benex_store::{MemoryStore, NewJob};
    use chrono::{TimeZone, Utc};
    use serde_json::Value;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct SnapshotOnlyClient;

    #[async_trait]
    impl BundleClient for SnapshotOnlyClient {
        async fn fetch_patient(&self, _: &FetchContext, _: &str) -> Result<Bundle, ProviderError> {
            unreachable!("preparation never fetches bundles")
        }
        async fn fetch_coverage(&self, _: &FetchContext, _: &str) -> Result<Bundle, ProviderError> {
            unreachable!("preparation never fetches bundles")
        }
        async fn fetch_explanation_of_benefit(
            &self,
            _: &FetchContext,
            _: &str,
        ) -> Result<Bundle, ProviderError> {
            unreachable!("preparation never fetches bundles")
        }
        async fn fetch_claim(&self, _: &FetchContext, _: &str) -> Result<Bundle, ProviderError> {
            unreachable!("preparation never fetches bundles")
        }
        async fn fetch_claim_response(
            &self,
            _: &FetchContext,
            _: &str,
        ) -> Result<Bundle, ProviderError> {
            unreachable!("preparation never fetches bundles")
        }
        async fn lookup_patient_id(&self, _: &str) -> Result<String, ProviderError> {
            unreachable!("preparation never fetches bundles")
        }
        async fn bundle_last_updated(&self) -> Result<chrono::DateTime<Utc>, ProviderError> {
            Ok(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap())
        }
    }

    /// Records enqueued messages instead of delivering them.
    #[derive(Default)]
    struct RecordingQueue {
        enqueued: Mutex<Vec<(String, Value, i16)>>,
    }

    #[async_trait]
    impl QueueTransport for RecordingQueue {
        async fn enqueue(&self, kind: &str, args: Value, priority: i16) -> Result<i64, QueueError> {
            let mut enqueued = self.enqueued.lock().unwrap();
            enqueued.push((kind.to_string(), args, priority));
            Ok(enqueued.len() as i64)
        }
        fn register(&self, _: &str, _: Arc<dyn benex_queue::JobHandler>) {}
        async fn start(&self, _: usize) -> Result<(), QueueError> {
            Ok(())
        }
        async fn stop(&self) {}
    }

    fn snapshot_clients() -> ClientFactory {
        Arc::new(|_| Ok(Arc::new(SnapshotOnlyClient) as Arc<dyn BundleClient>))
    }

    fn prepare_args(job_id: i64, aco_id: Uuid, resource_types: Vec<ResourceType>) -> PrepareJobArgs {
        PrepareJobArgs {
            job_id,
            aco_id,
            cms_id: "A0001".into(),
            resource_types,
            since: None,
            claims_window: ClaimsWindow::default(),
            base_path: "/v2/fhir".into(),
            transaction_id: Uuid::new_v4(),
        }
    }

    async fn seeded_job(store: &MemoryStore, aco_id: Uuid) -> i64 {
        store
            .create_job(NewJob {
                aco_id,
                request_url: "/api/v2/Group/all/$export".into(),
                status: JobStatus::Pending,
                transaction_time: Utc::now(),
                job_count: 0,
            })
            .await
            .unwrap()
            .id
    }

    #[test]
    fn test_priority_favors_patient_and_incremental() {
        assert!(job_priority(ResourceType::Patient, false) < job_priority(ResourceType::Coverage, true));
        assert!(
            job_priority(ResourceType::Coverage, true)
                < job_priority(ResourceType::Coverage, false)
        );
        assert_eq!(
            job_priority(ResourceType::ExplanationOfBenefit, false),
            job_priority(ResourceType::Claim, false)
        );
    }

    #[tokio::test]
    async fn test_fan_out_batches_and_persists_count_first() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(RecordingQueue::default());
        let aco_id = Uuid::new_v4();
        for n in 0..3 {
            store.seed_beneficiary(aco_id, &format!("1S00A00AA0{n}"), None);
        }
        let job_id = seeded_job(&store, aco_id).await;

        let mut config = WorkerConfig::default();
        config.max_beneficiaries_per_job = 2;
        let preparer = PrepareWorker::new(store.clone(), snapshot_clients(), queue.clone(), config);

        preparer
            .run(&prepare_args(
                job_id,
                aco_id,
                vec![ResourceType::Patient, ResourceType::Coverage],
            ))
            .await
            .unwrap();

        // 3 beneficiaries in batches of 2 is 2 batches per resource type.
        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.job_count, 4);
        assert_eq!(
            job.transaction_time,
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
        );

        let enqueued = queue.enqueued.lock().unwrap();
        assert_eq!(enqueued.len(), 4);
        for (kind, args, _) in enqueued.iter() {
            assert_eq!(kind, "process_job");
            let sub: ExportJobArgs = serde_json::from_value(args.clone()).unwrap();
            assert_eq!(sub.job_id, job_id);
            assert_eq!(sub.transaction_time, job.transaction_time);
        }
    }

    #[tokio::test]
    async fn test_empty_roster_fails_without_fan_out() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(RecordingQueue::default());
        let aco_id = Uuid::new_v4();
        let job_id = seeded_job(&store, aco_id).await;

        let preparer = PrepareWorker::new(
            store.clone(),
            snapshot_clients(),
            queue.clone(),
            WorkerConfig::default(),
        );

        let err = preparer
            .run(&prepare_args(job_id, aco_id, vec![ResourceType::Patient]))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::EmptyRoster(_)));
        assert!(queue.enqueued.lock().unwrap().is_empty());
        assert_eq!(store.get_job(job_id).await.unwrap().job_count, 0);
    }

    #[tokio::test]
    async fn test_handler_marks_parent_failed_on_error() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(RecordingQueue::default());
        let aco_id = Uuid::new_v4();
        let job_id = seeded_job(&store, aco_id).await;

        let preparer = PrepareWorker::new(
            store.clone(),
            snapshot_clients(),
            queue,
            WorkerConfig::default(),
        );

        // Empty roster: the handler surfaces the error and fails the job.
        let message = QueueJob {
            id: 1,
            kind: "prepare_job".into(),
            args: serde_json::to_value(prepare_args(job_id, aco_id, vec![ResourceType::Patient]))
                .unwrap(),
            error_count: 0,
            priority: 0,
        };
        assert!(preparer.work(message).await.is_err());
        assert_eq!(store.get_job(job_id).await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_redelivered_prepare_for_terminal_job_acks() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(RecordingQueue::default());
        let aco_id = Uuid::new_v4();
        let job_id = seeded_job(&store, aco_id).await;
        store
            .update_job_status(job_id, JobStatus::Failed)
            .await
            .unwrap();

        let preparer = PrepareWorker::new(
            store,
            snapshot_clients(),
            queue.clone(),
            WorkerConfig::default(),
        );
        preparer
            .run(&prepare_args(job_id, aco_id, vec![ResourceType::Patient]))
            .await
            .unwrap();
        assert!(queue.enqueued.lock().unwrap().is_empty());
    }
}
