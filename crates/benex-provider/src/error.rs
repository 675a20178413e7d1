use thiserror::Error;

/// Errors from the upstream data provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider returned status {status} for {resource}")]
    UnexpectedStatus { status: u16, resource: String },

    #[error("malformed bundle: {0}")]
    MalformedBundle(String),

    /// The identifier lookup matched no Patient resource. The identifier
    /// itself is deliberately not part of the error.
    #[error("no patient found for identifier")]
    PatientNotFound,

    #[error("provider metadata has no lastUpdated timestamp")]
    MissingLastUpdated,

    #[error("invalid provider base URL: {0}")]
    InvalidBaseUrl(String),
}
