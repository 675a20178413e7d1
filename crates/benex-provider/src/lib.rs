//! Client for the upstream FHIR data provider.
//!
//! Export sub-jobs pull resource bundles from the provider one beneficiary
//! at a time. The [`BundleClient`] trait is the seam the worker depends on;
//! [`HttpBundleClient`] is the production implementation.

pub mod client;
pub mod error;
pub mod http;
pub mod types;

pub use client::{BundleClient, FetchContext};
pub use error::ProviderError;
pub use http::{HttpBundleClient, ProviderConfig};
pub use types::Bundle;
