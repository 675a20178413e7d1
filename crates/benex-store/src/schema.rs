//! Schema bootstrap for the PostgreSQL backend.

use sqlx_core::query::query;
use sqlx_postgres::PgPool;

use crate::error::StoreError;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id BIGSERIAL PRIMARY KEY,
        aco_id UUID NOT NULL,
        request_url TEXT NOT NULL,
        status TEXT NOT NULL,
        transaction_time TIMESTAMPTZ NOT NULL,
        job_count INTEGER NOT NULL DEFAULT 0,
        completed_job_count INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_keys (
        id BIGSERIAL PRIMARY KEY,
        job_id BIGINT NOT NULL REFERENCES jobs (id),
        que_job_id BIGINT,
        file_name VARCHAR(127) NOT NULL,
        resource_type TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_job_keys_job_id ON job_keys (job_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS beneficiaries (
        id BIGSERIAL PRIMARY KEY,
        aco_id UUID NOT NULL,
        mbi TEXT NOT NULL,
        patient_id TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_beneficiaries_aco_id ON beneficiaries (aco_id)
    "#,
];

/// Creates the job, job-key and roster tables when absent.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    for statement in STATEMENTS {
        query(statement).execute(pool).await?;
    }
    Ok(())
}
