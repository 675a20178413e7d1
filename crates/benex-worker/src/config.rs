//! Runtime configuration for the worker daemon.
//!
//! Every crate-level config struct deserializes with per-field defaults so a
//! minimal config file (or none at all) yields a runnable local setup.
//! [`AppConfig::load`] layers a TOML file under `BENEX_`-prefixed
//! environment overrides.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use benex_provider::ProviderConfig;
use benex_queue::PostgresQueueConfig;
use benex_store::PostgresConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// In-progress sub-job output lands here, one directory per job.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Completed job output, served to status callers.
    #[serde(default = "default_payload_dir")]
    pub payload_dir: PathBuf,
    /// Near-expiry job output, moved out of the serving tree.
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
    /// Percentage of a sub-job's beneficiaries that may fail before the
    /// whole sub-job aborts. Values outside [0, 100] are clamped.
    #[serde(default = "default_failure_threshold_pct")]
    pub failure_threshold_pct: f64,
    /// Deliveries to spend waiting for a not-yet-visible parent job.
    #[serde(default = "default_max_not_found_retries")]
    pub max_not_found_retries: i32,
    /// Interval at which in-flight sub-jobs re-read the parent job's status.
    #[serde(default = "default_cancellation_poll_secs")]
    pub cancellation_poll_secs: u64,
    /// Age at which terminal jobs are archived or expired.
    #[serde(default = "default_archive_threshold_hours")]
    pub archive_threshold_hours: i64,
    /// Beneficiaries per sub-job batch during fan-out.
    #[serde(default = "default_max_beneficiaries_per_job")]
    pub max_beneficiaries_per_job: usize,
    /// Queue worker tasks to spawn.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Alert webhook endpoint; alerts are logged only when unset.
    #[serde(default)]
    pub alert_webhook_url: Option<String>,
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("data/staging")
}

fn default_payload_dir() -> PathBuf {
    PathBuf::from("data/payload")
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("data/archive")
}

fn default_failure_threshold_pct() -> f64 {
    50.0
}

fn default_max_not_found_retries() -> i32 {
    3
}

fn default_cancellation_poll_secs() -> u64 {
    15
}

fn default_archive_threshold_hours() -> i64 {
    24
}

fn default_max_beneficiaries_per_job() -> usize {
    5000
}

fn default_worker_count() -> usize {
    4
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            payload_dir: default_payload_dir(),
            archive_dir: default_archive_dir(),
            failure_threshold_pct: default_failure_threshold_pct(),
            max_not_found_retries: default_max_not_found_retries(),
            cancellation_poll_secs: default_cancellation_poll_secs(),
            archive_threshold_hours: default_archive_threshold_hours(),
            max_beneficiaries_per_job: default_max_beneficiaries_per_job(),
            worker_count: default_worker_count(),
            alert_webhook_url: None,
        }
    }
}

impl WorkerConfig {
    /// The failure threshold actually applied, clamped to [0, 100].
    pub fn effective_failure_threshold(&self) -> f64 {
        self.failure_threshold_pct.clamp(0.0, 100.0)
    }
}

/// Aggregated daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: PostgresConfig,
    #[serde(default)]
    pub queue: PostgresQueueConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl AppConfig {
    /// Loads `benex.toml` (optional) and applies `BENEX_*` environment
    /// overrides, e.g. `BENEX_DATABASE__URL`.
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("benex").required(false))
            .add_source(config::Environment::with_prefix("BENEX").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Rejects configurations that cannot work at runtime.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker.worker_count == 0 {
            return Err("worker.worker_count must be at least 1".into());
        }
        if self.worker.max_beneficiaries_per_job == 0 {
            return Err("worker.max_beneficiaries_per_job must be at least 1".into());
        }
        if self.worker.cancellation_poll_secs == 0 {
            return Err("worker.cancellation_poll_secs must be at least 1".into());
        }
        if self.worker.archive_threshold_hours <= 0 {
            return Err("worker.archive_threshold_hours must be positive".into());
        }
        if self.worker.staging_dir == self.worker.payload_dir {
            return Err("worker.staging_dir and worker.payload_dir must differ".into());
        }
        if self.database.url.is_empty() {
            return Err("database.url must be set".into());
        }
        Ok(())
    }
}
