//! Cancellation watcher for in-flight sub-jobs.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use benex_core::JobStatus;
use benex_store::JobStore;

/// Polls the parent job and cancels the shared token once an external actor
/// has marked it `Cancelled`.
///
/// Runs until the token completes for any reason; the processing loop
/// observes the token at beneficiary boundaries, so cancellation is
/// cooperative and in-flight fetches finish on their own.
pub async fn watch_for_cancellation(
    store: Arc<dyn JobStore>,
    job_id: i64,
    token: CancellationToken,
    poll_interval: Duration,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(poll_interval) => {}
        }

        match store.get_job(job_id).await {
            Ok(job) if job.status == JobStatus::Cancelled => {
                tracing::info!(job_id, "parent job cancelled, stopping sub-job");
                token.cancel();
                return;
            }
            Ok(_) => {}
            Err(err) => {
                // Transient; the next tick retries.
                tracing::warn!(job_id, error = %err, "cancellation poll failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use benex_store::{MemoryStore, NewJob};
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_cancels_token_when_job_is_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let job = store
            .create_job(NewJob {
                aco_id: Uuid::new_v4(),
                request_url: "/export".into(),
                status: JobStatus::InProgress,
                transaction_time: Utc::now(),
                job_count: 1,
            })
            .await
            .unwrap();

        let token = CancellationToken::new();
        let watcher = tokio::spawn(watch_for_cancellation(
            store.clone(),
            job.id,
            token.clone(),
            Duration::from_millis(5),
        ));

        store
            .update_job_status(job.id, JobStatus::Cancelled)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("token should cancel within the poll interval");
        watcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_exits_when_token_is_cancelled_externally() {
        let store = Arc::new(MemoryStore::new());
        let job = store
            .create_job(NewJob {
                aco_id: Uuid::new_v4(),
                request_url: "/export".into(),
                status: JobStatus::InProgress,
                transaction_time: Utc::now(),
                job_count: 1,
            })
            .await
            .unwrap();

        let token = CancellationToken::new();
        let watcher = tokio::spawn(watch_for_cancellation(
            store,
            job.id,
            token.clone(),
            Duration::from_millis(5),
        ));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .expect("watcher should exit once the token completes")
            .unwrap();
    }
}
