use thiserror::Error;

/// Errors surfaced by [`crate::JobStore`] backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no job found for given id")]
    JobNotFound,

    /// A guarded (compare-and-swap) update matched no row. Callers treat
    /// this as "someone else already made this transition".
    #[error("job was not updated, no match found")]
    JobNotUpdated,

    #[error("no beneficiary found for given id")]
    BeneficiaryNotFound,

    #[error("database error: {0}")]
    Database(#[from] sqlx_core::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::JobNotFound)
    }
}
