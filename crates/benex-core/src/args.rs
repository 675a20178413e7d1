//! Queue message payloads.
//!
//! These are the only types that cross the queue boundary. They are plain
//! serde structs; the queue transports store them as JSON and know nothing
//! about their contents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::ResourceType;

/// Optional bounds on claims data, applied to the window-honoring resource
/// types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimsWindow {
    pub lower_bound: Option<DateTime<Utc>>,
    pub upper_bound: Option<DateTime<Utc>>,
}

/// One unit of queued export work: a single resource type for a batch of
/// beneficiaries belonging to one parent job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJobArgs {
    /// Parent job identifier.
    pub job_id: i64,
    pub aco_id: Uuid,
    /// Caller's CMS identifier, attached to log context.
    pub cms_id: String,
    pub beneficiary_ids: Vec<i64>,
    pub resource_type: ResourceType,
    /// Incremental export lower bound, when the caller supplied one.
    pub since: Option<DateTime<Utc>>,
    /// Snapshot time all fetches are pinned to.
    pub transaction_time: DateTime<Utc>,
    #[serde(default)]
    pub claims_window: ClaimsWindow,
    /// Data-provider base path. Empty means the message is unprocessable.
    pub base_path: String,
    /// Correlates every sub-job of one export request in logs.
    pub transaction_id: Uuid,
}

/// Payload for the preparation step that fans a parent job out into
/// [`ExportJobArgs`] sub-jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareJobArgs {
    pub job_id: i64,
    pub aco_id: Uuid,
    pub cms_id: String,
    pub resource_types: Vec<ResourceType>,
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub claims_window: ClaimsWindow,
    pub base_path: String,
    pub transaction_id: Uuid,
}

/// Payload for the periodic archive/cleanup sweep. Carries nothing; the
/// cutoff comes from worker configuration at execution time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupJobArgs {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_args_round_trip() {
        let args = ExportJobArgs {
            job_id: 42,
            aco_id: Uuid::new_v4(),
            cms_id: "A0001".into(),
            beneficiary_ids: vec![1, 2, 3],
            resource_type: ResourceType::Coverage,
            since: None,
            transaction_time: Utc::now(),
            claims_window: ClaimsWindow::default(),
            base_path: "/v2/fhir".into(),
            transaction_id: Uuid::new_v4(),
        };

        let json = serde_json::to_value(&args).unwrap();
        let back: ExportJobArgs = serde_json::from_value(json).unwrap();
        assert_eq!(back.job_id, 42);
        assert_eq!(back.resource_type, ResourceType::Coverage);
        assert_eq!(back.beneficiary_ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_claims_window_defaults_when_absent() {
        // Older producers may omit the window entirely.
        let json = serde_json::json!({
            "job_id": 7,
            "aco_id": Uuid::new_v4(),
            "cms_id": "A0001",
            "beneficiary_ids": [9],
            "resource_type": "Patient",
            "since": null,
            "transaction_time": Utc::now(),
            "base_path": "/v2/fhir",
            "transaction_id": Uuid::new_v4(),
        });
        let args: ExportJobArgs = serde_json::from_value(json).unwrap();
        assert_eq!(args.claims_window, ClaimsWindow::default());
    }
}
