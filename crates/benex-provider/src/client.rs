//! The provider-client contract the export worker depends on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use benex_core::{ClaimsWindow, ExportJobArgs};

use crate::error::ProviderError;
use crate::types::Bundle;

/// Time bounds shared by every fetch within one sub-job.
#[derive(Debug, Clone, Copy)]
pub struct FetchContext {
    /// Incremental lower bound on `_lastUpdated`, when the caller asked for
    /// one.
    pub since: Option<DateTime<Utc>>,
    /// Upper bound on `_lastUpdated`; pins every fetch to the job's
    /// snapshot.
    pub transaction_time: DateTime<Utc>,
    /// Service-date bounds for the window-honoring resource types.
    pub claims_window: ClaimsWindow,
}

impl From<&ExportJobArgs> for FetchContext {
    fn from(args: &ExportJobArgs) -> Self {
        Self {
            since: args.since,
            transaction_time: args.transaction_time,
            claims_window: args.claims_window,
        }
    }
}

/// Upstream FHIR data-provider client.
///
/// Every fetch returns the fully-paginated bundle: implementations follow
/// `next` links until exhausted, so callers see one bundle per beneficiary
/// regardless of provider page size.
#[async_trait]
pub trait BundleClient: Send + Sync {
    /// The beneficiary's Patient resource, by provider-side patient id.
    async fn fetch_patient(
        &self,
        ctx: &FetchContext,
        patient_id: &str,
    ) -> Result<Bundle, ProviderError>;

    /// Coverage resources for one beneficiary, by provider-side patient id.
    async fn fetch_coverage(
        &self,
        ctx: &FetchContext,
        patient_id: &str,
    ) -> Result<Bundle, ProviderError>;

    /// Adjudicated ExplanationOfBenefit resources for one beneficiary.
    async fn fetch_explanation_of_benefit(
        &self,
        ctx: &FetchContext,
        patient_id: &str,
    ) -> Result<Bundle, ProviderError>;

    /// Partially-adjudicated Claim resources, fetched by MBI.
    async fn fetch_claim(&self, ctx: &FetchContext, mbi: &str) -> Result<Bundle, ProviderError>;

    /// Partially-adjudicated ClaimResponse resources, fetched by MBI.
    async fn fetch_claim_response(
        &self,
        ctx: &FetchContext,
        mbi: &str,
    ) -> Result<Bundle, ProviderError>;

    /// Resolves a beneficiary's provider-side patient id from their MBI.
    async fn lookup_patient_id(&self, mbi: &str) -> Result<String, ProviderError>;

    /// The provider's data "as-of" timestamp, used to pin a new job's
    /// transaction time.
    async fn bundle_last_updated(&self) -> Result<DateTime<Utc>, ProviderError>;
}
