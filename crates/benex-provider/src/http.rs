//! `reqwest` implementation of [`BundleClient`].
//!
//! One client instance serves one data-provider base path (providers
//! version their FHIR APIs by path). Every fetch follows `next` links until
//! the searchset is exhausted, and transient failures are retried a bounded
//! number of times before surfacing to the caller.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use benex_core::ClaimsWindow;

use crate::client::{BundleClient, FetchContext};
use crate::error::ProviderError;
use crate::types::Bundle;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Scheme and authority of the data provider, e.g. `https://bfd.example.com`.
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempts per request before a transient failure is surfaced.
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Requested `_count` page size.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_tries() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_page_size() -> u32 {
    50
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4010".into(),
            timeout_secs: default_timeout_secs(),
            max_tries: default_max_tries(),
            retry_interval_ms: default_retry_interval_ms(),
            page_size: default_page_size(),
        }
    }
}

const MBI_SYSTEM: &str = "http://hl7.org/fhir/sid/us-mbi";

type Params = Vec<(&'static str, String)>;

/// HTTP client for the upstream FHIR data provider.
pub struct HttpBundleClient {
    http: reqwest::Client,
    /// `{base_url}{base_path}`, with no trailing slash.
    root: String,
    config: ProviderConfig,
}

impl HttpBundleClient {
    /// Builds a client rooted at `base_path` under the configured provider.
    pub fn new(config: ProviderConfig, base_path: &str) -> Result<Self, ProviderError> {
        let base = config.base_url.trim_end_matches('/');
        reqwest::Url::parse(base)
            .map_err(|err| ProviderError::InvalidBaseUrl(format!("{base}: {err}")))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let path = base_path.trim_matches('/');
        let root = if path.is_empty() {
            base.to_string()
        } else {
            format!("{base}/{path}")
        };

        Ok(Self { http, root, config })
    }

    /// Sends one request, retrying transport errors and 5xx responses up to
    /// the attempt budget. 4xx responses surface immediately.
    async fn execute<F>(&self, build: F, resource: &str) -> Result<Value, ProviderError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match build().send().await {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.json().await?);
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_server_error() && attempt < self.config.max_tries {
                        tracing::warn!(resource, status, attempt, "provider request failed, retrying");
                    } else {
                        return Err(ProviderError::UnexpectedStatus {
                            status,
                            resource: resource.to_string(),
                        });
                    }
                }
                Err(err) if attempt < self.config.max_tries => {
                    tracing::warn!(resource, error = %err, attempt, "provider request failed, retrying");
                }
                Err(err) => return Err(err.into()),
            }
            tokio::time::sleep(Duration::from_millis(self.config.retry_interval_ms)).await;
        }
    }

    /// GET search, following `next` links until the searchset is exhausted.
    async fn get_all(&self, resource: &str, mut params: Params) -> Result<Bundle, ProviderError> {
        params.push(("_count", self.config.page_size.to_string()));
        let url = format!("{}/{resource}", self.root);
        let body = self
            .execute(|| self.http.get(&url).query(&params), resource)
            .await?;
        let mut bundle = Bundle::from_value(&body)?;
        self.follow_pages(resource, &mut bundle).await?;
        Ok(bundle)
    }

    /// POST `_search`, for queries whose parameters must stay out of URLs.
    async fn search_all(&self, resource: &str, mut form: Params) -> Result<Bundle, ProviderError> {
        form.push(("_count", self.config.page_size.to_string()));
        let url = format!("{}/{resource}/_search", self.root);
        let body = self
            .execute(|| self.http.post(&url).form(&form), resource)
            .await?;
        let mut bundle = Bundle::from_value(&body)?;
        self.follow_pages(resource, &mut bundle).await?;
        Ok(bundle)
    }

    async fn follow_pages(&self, resource: &str, bundle: &mut Bundle) -> Result<(), ProviderError> {
        while let Some(next) = bundle.next_url.clone() {
            let body = self.execute(|| self.http.get(&next), resource).await?;
            bundle.absorb(Bundle::from_value(&body)?);
        }
        Ok(())
    }
}

fn last_updated_params(ctx: &FetchContext, params: &mut Params) {
    if let Some(since) = ctx.since {
        params.push(("_lastUpdated", format!("ge{}", instant(since))));
    }
    params.push(("_lastUpdated", format!("le{}", instant(ctx.transaction_time))));
}

fn service_date_params(window: &ClaimsWindow, params: &mut Params) {
    if let Some(lower) = window.lower_bound {
        params.push(("service-date", format!("ge{}", lower.format("%Y-%m-%d"))));
    }
    if let Some(upper) = window.upper_bound {
        params.push(("service-date", format!("le{}", upper.format("%Y-%m-%d"))));
    }
}

fn instant(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[async_trait]
impl BundleClient for HttpBundleClient {
    async fn fetch_patient(
        &self,
        ctx: &FetchContext,
        patient_id: &str,
    ) -> Result<Bundle, ProviderError> {
        let mut params: Params = vec![("_id", patient_id.to_string())];
        last_updated_params(ctx, &mut params);
        self.get_all("Patient", params).await
    }

    async fn fetch_coverage(
        &self,
        ctx: &FetchContext,
        patient_id: &str,
    ) -> Result<Bundle, ProviderError> {
        let mut params: Params = vec![("beneficiary", patient_id.to_string())];
        last_updated_params(ctx, &mut params);
        self.get_all("Coverage", params).await
    }

    async fn fetch_explanation_of_benefit(
        &self,
        ctx: &FetchContext,
        patient_id: &str,
    ) -> Result<Bundle, ProviderError> {
        let mut params: Params = vec![
            ("patient", patient_id.to_string()),
            ("excludeSAMHSA", "true".to_string()),
        ];
        last_updated_params(ctx, &mut params);
        service_date_params(&ctx.claims_window, &mut params);
        self.get_all("ExplanationOfBenefit", params).await
    }

    async fn fetch_claim(&self, ctx: &FetchContext, mbi: &str) -> Result<Bundle, ProviderError> {
        let mut form: Params = vec![
            ("mbi", mbi.to_string()),
            ("excludeSAMHSA", "true".to_string()),
        ];
        last_updated_params(ctx, &mut form);
        service_date_params(&ctx.claims_window, &mut form);
        self.search_all("Claim", form).await
    }

    async fn fetch_claim_response(
        &self,
        ctx: &FetchContext,
        mbi: &str,
    ) -> Result<Bundle, ProviderError> {
        let mut form: Params = vec![
            ("mbi", mbi.to_string()),
            ("excludeSAMHSA", "true".to_string()),
        ];
        last_updated_params(ctx, &mut form);
        service_date_params(&ctx.claims_window, &mut form);
        self.search_all("ClaimResponse", form).await
    }

    async fn lookup_patient_id(&self, mbi: &str) -> Result<String, ProviderError> {
        let form: Params = vec![("identifier", format!("{MBI_SYSTEM}|{mbi}"))];
        let bundle = self.search_all("Patient", form).await?;

        bundle
            .entries
            .first()
            .and_then(|resource| resource.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(ProviderError::PatientNotFound)
    }

    async fn bundle_last_updated(&self) -> Result<DateTime<Utc>, ProviderError> {
        let url = format!("{}/metadata", self.root);
        let body = self.execute(|| self.http.get(&url), "metadata").await?;

        let raw = body
            .get("meta")
            .and_then(|meta| meta.get("lastUpdated"))
            .and_then(Value::as_str)
            .ok_or(ProviderError::MissingLastUpdated)?;

        DateTime::parse_from_rfc3339(raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|err| ProviderError::MalformedBundle(format!("bad lastUpdated: {err}")))
    }
}
