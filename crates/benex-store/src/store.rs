//! The persistence contract for export jobs, job keys and the attribution
//! roster.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use benex_core::{Beneficiary, Job, JobKey, JobStatus};

use crate::error::StoreError;

/// Fields required to insert a new export job. The store assigns the id
/// and both timestamps.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub aco_id: Uuid,
    pub request_url: String,
    pub status: JobStatus,
    pub transaction_time: DateTime<Utc>,
    pub job_count: i32,
}

/// Persistence contract the orchestration core is written against.
///
/// Implementations must be thread-safe (`Send + Sync`). Status transitions
/// go through [`update_job_status_checked`](JobStore::update_job_status_checked)
/// wherever two workers may race on the same job; a failed guard surfaces
/// as [`StoreError::JobNotUpdated`] and is not treated as a fault by
/// callers.
#[async_trait]
pub trait JobStore: Send + Sync {
    // ==================== Jobs ====================

    /// Inserts a new export job and returns it with its assigned id.
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError>;

    /// Fetches a job by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::JobNotFound`] when no row exists.
    async fn get_job(&self, job_id: i64) -> Result<Job, StoreError>;

    /// Writes back a job's mutable fields (`status`, `transaction_time`,
    /// `job_count`) and bumps `updated_at`.
    async fn update_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Unconditionally sets a job's status.
    async fn update_job_status(&self, job_id: i64, new: JobStatus) -> Result<(), StoreError>;

    /// Sets a job's status iff its current status matches `current`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::JobNotUpdated`] when the guard matched no row,
    /// which callers treat as an already-made transition.
    async fn update_job_status_checked(
        &self,
        job_id: i64,
        current: JobStatus,
        new: JobStatus,
    ) -> Result<(), StoreError>;

    /// Bumps the advisory completed sub-job counter. Best-effort telemetry;
    /// completion decisions never read it.
    async fn increment_completed_job_count(&self, job_id: i64) -> Result<(), StoreError>;

    /// Jobs in `status` whose `updated_at` is strictly before `cutoff`.
    /// Used by the cleanup sweep.
    async fn jobs_updated_before(
        &self,
        cutoff: DateTime<Utc>,
        status: JobStatus,
    ) -> Result<Vec<Job>, StoreError>;

    // ==================== Job keys ====================

    /// Inserts the given job keys. Append-only; keys are never updated.
    async fn create_job_keys(&self, keys: &[JobKey]) -> Result<(), StoreError>;

    /// Number of job keys recorded for a job. Error-file siblings are not
    /// counted: completion compares this against the job's expected
    /// sub-job count.
    async fn job_key_count(&self, job_id: i64) -> Result<i64, StoreError>;

    /// The job key (if any) already produced by the given queue message.
    /// A hit means the message is a redelivery.
    async fn job_key_for_queue_job(
        &self,
        job_id: i64,
        que_job_id: i64,
    ) -> Result<Option<JobKey>, StoreError>;

    // ==================== Attribution roster ====================

    /// Fetches one attributed beneficiary.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BeneficiaryNotFound`] when no row exists.
    async fn get_beneficiary(&self, id: i64) -> Result<Beneficiary, StoreError>;

    /// Identifiers of every beneficiary attributed to the given ACO, in
    /// stable id order.
    async fn beneficiary_ids_for_aco(&self, aco_id: Uuid) -> Result<Vec<i64>, StoreError>;
}
