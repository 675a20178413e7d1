//! In-memory implementation of the [`JobStore`] trait.
//!
//! Backs tests and local runs. Semantics mirror the PostgreSQL backend,
//! including the conditional-update guard and the error-file exclusion in
//! the job-key count.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use benex_core::{Beneficiary, Job, JobKey, JobStatus};

use crate::error::StoreError;
use crate::store::{JobStore, NewJob};

#[derive(Default)]
struct Inner {
    jobs: HashMap<i64, Job>,
    job_keys: Vec<JobKey>,
    beneficiaries: HashMap<i64, (Uuid, Beneficiary)>,
    next_job_id: i64,
    next_beneficiary_id: i64,
}

/// In-process job store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds one attributed beneficiary and returns its id. Test helper;
    /// production rosters are ingested out of band.
    pub fn seed_beneficiary(&self, aco_id: Uuid, mbi: &str, patient_id: Option<&str>) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_beneficiary_id += 1;
        let id = inner.next_beneficiary_id;
        inner.beneficiaries.insert(
            id,
            (
                aco_id,
                Beneficiary {
                    id,
                    mbi: mbi.to_string(),
                    patient_id: patient_id.map(str::to_string),
                },
            ),
        );
        id
    }

    /// Snapshot of every job key recorded so far, in insertion order.
    pub fn job_keys(&self, job_id: i64) -> Vec<JobKey> {
        let inner = self.inner.lock().unwrap();
        inner
            .job_keys
            .iter()
            .filter(|k| k.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Rewinds a job's `updated_at`, letting tests age jobs past the
    /// cleanup cutoff.
    pub fn backdate_job(&self, job_id: i64, updated_at: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.updated_at = updated_at;
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_job_id += 1;
        let now = Utc::now();
        let job = Job {
            id: inner.next_job_id,
            aco_id: new.aco_id,
            request_url: new.request_url,
            status: new.status,
            transaction_time: new.transaction_time,
            job_count: new.job_count,
            completed_job_count: 0,
            created_at: now,
            updated_at: now,
        };
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: i64) -> Result<Job, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner.jobs.get(&job_id).cloned().ok_or(StoreError::JobNotFound)
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let stored = inner.jobs.get_mut(&job.id).ok_or(StoreError::JobNotFound)?;
        stored.status = job.status;
        stored.transaction_time = job.transaction_time;
        stored.job_count = job.job_count;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn update_job_status(&self, job_id: i64, new: JobStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let stored = inner.jobs.get_mut(&job_id).ok_or(StoreError::JobNotFound)?;
        stored.status = new;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn update_job_status_checked(
        &self,
        job_id: i64,
        current: JobStatus,
        new: JobStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(&job_id) {
            Some(stored) if stored.status == current => {
                stored.status = new;
                stored.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(StoreError::JobNotUpdated),
        }
    }

    async fn increment_completed_job_count(&self, job_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(stored) = inner.jobs.get_mut(&job_id) {
            stored.completed_job_count += 1;
            stored.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn jobs_updated_before(
        &self,
        cutoff: DateTime<Utc>,
        status: JobStatus,
    ) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == status && j.updated_at < cutoff)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn create_job_keys(&self, keys: &[JobKey]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.job_keys.extend_from_slice(keys);
        Ok(())
    }

    async fn job_key_count(&self, job_id: i64) -> Result<i64, StoreError> {
        let inner = self.inner.lock().unwrap();
        let count = inner
            .job_keys
            .iter()
            .filter(|k| k.job_id == job_id && !k.file_name.ends_with("-error.ndjson"))
            .count();
        Ok(count as i64)
    }

    async fn job_key_for_queue_job(
        &self,
        job_id: i64,
        que_job_id: i64,
    ) -> Result<Option<JobKey>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .job_keys
            .iter()
            .find(|k| k.job_id == job_id && k.que_job_id == Some(que_job_id))
            .cloned())
    }

    async fn get_beneficiary(&self, id: i64) -> Result<Beneficiary, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .beneficiaries
            .get(&id)
            .map(|(_, bene)| bene.clone())
            .ok_or(StoreError::BeneficiaryNotFound)
    }

    async fn beneficiary_ids_for_aco(&self, aco_id: Uuid) -> Result<Vec<i64>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<i64> = inner
            .beneficiaries
            .iter()
            .filter(|(_, (owner, _))| *owner == aco_id)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}
