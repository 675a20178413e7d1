//! PostgreSQL implementation of the [`JobStore`] trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx_core::query::query;
use sqlx_core::row::Row;
use sqlx_postgres::{PgPool, PgPoolOptions, PgRow};
use uuid::Uuid;

use benex_core::{Beneficiary, Job, JobKey, JobStatus};

use crate::error::StoreError;
use crate::schema;
use crate::store::{JobStore, NewJob};

/// Connection settings for the PostgreSQL backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Create missing tables on startup.
    #[serde(default = "default_true")]
    pub ensure_schema: bool,
}

fn default_pool_size() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: "postgres://postgres@localhost/benex".into(),
            pool_size: default_pool_size(),
            ensure_schema: true,
        }
    }
}

/// Production job store backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connects a pool and optionally bootstraps the schema.
    pub async fn new(config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect(&config.url)
            .await?;

        if config.ensure_schema {
            schema::ensure_schema(&pool).await?;
        }

        Ok(Self { pool })
    }

    /// Wraps an existing pool. The schema is assumed to exist.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
        let status_str: String = row.try_get("status")?;
        let status = JobStatus::parse(&status_str).ok_or_else(|| {
            StoreError::Database(sqlx_core::Error::Decode(
                format!("unknown job status {status_str:?}").into(),
            ))
        })?;

        Ok(Job {
            id: row.try_get("id")?,
            aco_id: row.try_get("aco_id")?,
            request_url: row.try_get("request_url")?,
            status,
            transaction_time: row.try_get("transaction_time")?,
            job_count: row.try_get("job_count")?,
            completed_job_count: row.try_get("completed_job_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

const JOB_COLUMNS: &str = "id, aco_id, request_url, status, transaction_time, \
     job_count, completed_job_count, created_at, updated_at";

#[async_trait]
impl JobStore for PostgresStore {
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError> {
        let row = query(&format!(
            r#"
            INSERT INTO jobs (aco_id, request_url, status, transaction_time, job_count)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(new.aco_id)
        .bind(&new.request_url)
        .bind(new.status.as_str())
        .bind(new.transaction_time)
        .bind(new.job_count)
        .fetch_one(&self.pool)
        .await?;

        Self::job_from_row(&row)
    }

    async fn get_job(&self, job_id: i64) -> Result<Job, StoreError> {
        let row = query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::JobNotFound)?;

        Self::job_from_row(&row)
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let result = query(
            r#"
            UPDATE jobs
            SET status = $1,
                transaction_time = $2,
                job_count = $3,
                updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(job.status.as_str())
        .bind(job.transaction_time)
        .bind(job.job_count)
        .bind(job.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound);
        }
        Ok(())
    }

    async fn update_job_status(&self, job_id: i64, new: JobStatus) -> Result<(), StoreError> {
        let result = query("UPDATE jobs SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(new.as_str())
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound);
        }

        tracing::debug!(job_id, status = %new, "job status updated");
        Ok(())
    }

    async fn update_job_status_checked(
        &self,
        job_id: i64,
        current: JobStatus,
        new: JobStatus,
    ) -> Result<(), StoreError> {
        let result = query(
            "UPDATE jobs SET status = $1, updated_at = NOW() WHERE id = $2 AND status = $3",
        )
        .bind(new.as_str())
        .bind(job_id)
        .bind(current.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotUpdated);
        }

        tracing::debug!(job_id, from = %current, to = %new, "job status transitioned");
        Ok(())
    }

    async fn increment_completed_job_count(&self, job_id: i64) -> Result<(), StoreError> {
        query(
            r#"
            UPDATE jobs
            SET completed_job_count = completed_job_count + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn jobs_updated_before(
        &self,
        cutoff: DateTime<Utc>,
        status: JobStatus,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = $1 AND updated_at < $2 ORDER BY id",
        ))
        .bind(status.as_str())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::job_from_row).collect()
    }

    async fn create_job_keys(&self, keys: &[JobKey]) -> Result<(), StoreError> {
        for key in keys {
            query(
                r#"
                INSERT INTO job_keys (job_id, que_job_id, file_name, resource_type)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(key.job_id)
            .bind(key.que_job_id)
            .bind(&key.file_name)
            .bind(key.resource_type.as_str())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn job_key_count(&self, job_id: i64) -> Result<i64, StoreError> {
        // Error-file siblings are progress artifacts, not completed units
        // of work.
        let row = query(
            r#"
            SELECT COUNT(1) AS count FROM job_keys
            WHERE job_id = $1 AND file_name NOT LIKE '%-error.ndjson'
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("count")?)
    }

    async fn job_key_for_queue_job(
        &self,
        job_id: i64,
        que_job_id: i64,
    ) -> Result<Option<JobKey>, StoreError> {
        let row = query(
            r#"
            SELECT job_id, que_job_id, file_name, resource_type
            FROM job_keys
            WHERE job_id = $1 AND que_job_id = $2
            LIMIT 1
            "#,
        )
        .bind(job_id)
        .bind(que_job_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let resource_str: String = row.try_get("resource_type")?;
                let resource_type = resource_str.parse().map_err(|_| {
                    StoreError::Database(sqlx_core::Error::Decode(
                        format!("unknown resource type {resource_str:?}").into(),
                    ))
                })?;
                Ok(Some(JobKey {
                    job_id: row.try_get("job_id")?,
                    que_job_id: row.try_get("que_job_id")?,
                    file_name: row.try_get("file_name")?,
                    resource_type,
                }))
            }
        }
    }

    async fn get_beneficiary(&self, id: i64) -> Result<Beneficiary, StoreError> {
        let row = query("SELECT id, mbi, patient_id FROM beneficiaries WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::BeneficiaryNotFound)?;

        Ok(Beneficiary {
            id: row.try_get("id")?,
            mbi: row.try_get("mbi")?,
            patient_id: row.try_get("patient_id")?,
        })
    }

    async fn beneficiary_ids_for_aco(&self, aco_id: Uuid) -> Result<Vec<i64>, StoreError> {
        let rows = query("SELECT id FROM beneficiaries WHERE aco_id = $1 ORDER BY id")
            .bind(aco_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| row.try_get("id").map_err(StoreError::from))
            .collect()
    }
}
