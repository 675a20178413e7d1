use thiserror::Error;

/// Errors surfaced by [`crate::QueueTransport`] backends.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx_core::Error),
}
