//! Persistent export-job records and the job lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// File name recorded in a [`JobKey`] when a sub-job produced no output.
///
/// Keeps empty NDJSON files out of the payload directory while still
/// counting the sub-job as done.
pub const BLANK_FILE_NAME: &str = "blank.ndjson";

/// Lifecycle state of an export [`Job`].
///
/// Transitions are monotonic: `Pending → InProgress → {Completed | Failed}`,
/// with `Cancelled` reachable from either non-terminal state by an external
/// actor. The cleanup sweep moves terminal jobs to their expired variants
/// (`Completed → Archived → Expired`, `Failed → FailedExpired`,
/// `Cancelled → CancelledExpired`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Archived,
    Expired,
    FailedExpired,
    CancelledExpired,
}

impl JobStatus {
    /// Terminal states never transition again except through the cleanup
    /// sweep's expiry variants.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Archived => "archived",
            JobStatus::Expired => "expired",
            JobStatus::FailedExpired => "failed_expired",
            JobStatus::CancelledExpired => "cancelled_expired",
        }
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "in_progress" => Some(JobStatus::InProgress),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            "archived" => Some(JobStatus::Archived),
            "expired" => Some(JobStatus::Expired),
            "failed_expired" => Some(JobStatus::FailedExpired),
            "cancelled_expired" => Some(JobStatus::CancelledExpired),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// FHIR resource types the pipeline knows how to export.
///
/// `Claim` and `ClaimResponse` carry partially-adjudicated data: they are
/// fetched by MBI and skip the provider-side patient id lookup the
/// adjudicated types require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Patient,
    Coverage,
    ExplanationOfBenefit,
    Claim,
    ClaimResponse,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Patient => "Patient",
            ResourceType::Coverage => "Coverage",
            ResourceType::ExplanationOfBenefit => "ExplanationOfBenefit",
            ResourceType::Claim => "Claim",
            ResourceType::ClaimResponse => "ClaimResponse",
        }
    }

    /// Whether exporting this type needs the provider-side patient id
    /// resolved first. Partially-adjudicated data has no Patient resources
    /// to resolve against.
    pub fn requires_patient_id(&self) -> bool {
        !matches!(self, ResourceType::Claim | ResourceType::ClaimResponse)
    }

    /// Whether fetches for this type are bounded by the claims window.
    pub fn honors_claims_window(&self) -> bool {
        matches!(
            self,
            ResourceType::ExplanationOfBenefit | ResourceType::Claim | ResourceType::ClaimResponse
        )
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unsupported resource type: {0}")]
pub struct InvalidResourceType(pub String);

impl std::str::FromStr for ResourceType {
    type Err = InvalidResourceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Patient" => Ok(ResourceType::Patient),
            "Coverage" => Ok(ResourceType::Coverage),
            "ExplanationOfBenefit" => Ok(ResourceType::ExplanationOfBenefit),
            "Claim" => Ok(ResourceType::Claim),
            "ClaimResponse" => Ok(ResourceType::ClaimResponse),
            other => Err(InvalidResourceType(other.to_string())),
        }
    }
}

/// One top-level bulk-export request and its overall lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Store-assigned identifier.
    pub id: i64,
    /// Owning ACO.
    pub aco_id: Uuid,
    /// Original request URL, echoed back to status callers.
    pub request_url: String,
    pub status: JobStatus,
    /// Logical "as-of" time for the export; every sub-job fetches against
    /// this snapshot.
    pub transaction_time: DateTime<Utc>,
    /// Expected number of sub-jobs, persisted by the preparer before any
    /// sub-job is enqueued.
    pub job_count: i32,
    /// Best-effort progress telemetry. Allowed to drift; completion
    /// decisions use the job-key count, never this field.
    pub completed_job_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Manifest row proving one sub-job's output was produced.
///
/// The set of job keys for a job is the authoritative completion signal:
/// once their count reaches the job's `job_count`, the job is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobKey {
    pub job_id: i64,
    /// Queue message that produced this key; used to detect redelivery.
    pub que_job_id: Option<i64>,
    /// `{uuid}.ndjson`, `{uuid}-error.ndjson`, or [`BLANK_FILE_NAME`].
    pub file_name: String,
    pub resource_type: ResourceType,
}

/// One attributed beneficiary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beneficiary {
    pub id: i64,
    /// Medicare Beneficiary Identifier. Never logged; it only appears
    /// inside error files shipped back to the caller.
    pub mbi: String,
    /// Provider-side patient id, resolved lazily when absent.
    pub patient_id: Option<String>,
}
