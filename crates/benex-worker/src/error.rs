use thiserror::Error;
use uuid::Uuid;

use benex_provider::ProviderError;
use benex_queue::QueueError;
use benex_store::StoreError;

/// Errors raised while orchestrating export jobs.
///
/// The queue-facing handlers translate these into the only two signals the
/// transport understands: `Ok` (acknowledge) or `Err` (retry until the
/// attempt budget runs out). The variant determines which.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Unprocessable message: no data-provider base path to fetch against.
    #[error("job has no data-provider base path")]
    NoBasePath,

    /// The parent job row is not visible yet. Retried a bounded number of
    /// times to ride out replication lag, then dropped.
    #[error("parent job {0} not found")]
    ParentJobNotFound(i64),

    #[error("parent job {0} is cancelled")]
    ParentJobCancelled(i64),

    #[error("parent job {0} is failed")]
    ParentJobFailed(i64),

    /// A job key already exists for this queue message: the work was done
    /// by a previous delivery.
    #[error("queue message already produced a job key for job {0}")]
    AlreadyProcessed(i64),

    #[error("failure threshold exceeded: {failed} of {total} beneficiaries failed")]
    ThresholdExceeded { failed: usize, total: usize },

    #[error("job {0} was cancelled during processing")]
    Cancelled(i64),

    #[error("no beneficiaries attributed to aco {0}")]
    EmptyRoster(Uuid),

    #[error("prepare request names no resource types")]
    NoResourceTypes,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}
