//! FHIR OperationOutcome records for per-beneficiary failures.
//!
//! Failures are reported back to the caller inside the job's
//! `-error.ndjson` file, one OperationOutcome per line. The beneficiary's
//! MBI appears only here, never in logs.

use std::path::Path;

use serde_json::{Value, json};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::error::WorkerError;

/// Builds one OperationOutcome resource for a failed beneficiary fetch.
/// The MBI is attached as diagnostics when the beneficiary is known.
pub fn operation_outcome(mbi: Option<&str>, detail: &str) -> Value {
    let mut issue = json!({
        "severity": "error",
        "code": "exception",
        "details": {"text": detail},
    });
    if let Some(mbi) = mbi {
        issue["diagnostics"] = Value::String(format!("beneficiary MBI {mbi}"));
    }
    json!({
        "resourceType": "OperationOutcome",
        "issue": [issue]
    })
}

/// Appends one outcome record as a line to the sub-job's error file,
/// creating it on first use.
pub async fn append_outcome(path: &Path, outcome: &Value) -> Result<(), WorkerError> {
    let mut line = serde_json::to_vec(outcome)?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}
