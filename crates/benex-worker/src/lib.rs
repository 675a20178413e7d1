//! # benex-worker
//!
//! Orchestration core of the benex bulk-export pipeline.
//!
//! Three queue handlers implement the job lifecycle:
//!
//! - [`PrepareWorker`] fans a top-level export request out into per-resource,
//!   per-batch sub-jobs (`prepare_job` messages).
//! - [`ProcessJobHandler`] drives [`ExportWorker`] for each sub-job
//!   (`process_job` messages): fetch bundles, stage NDJSON, record the job
//!   key, then run the completion detector.
//! - [`CleanupWorker`] archives and expires stale terminal jobs
//!   (`cleanup_job` messages).
//!
//! Completion is derived solely from the job-key count reaching the job's
//! expected sub-job count; everything else (status polling, the advisory
//! progress counter) is observability.

pub mod cleanup;
pub mod config;
pub mod error;
pub mod handler;
pub mod notify;
pub mod outcome;
pub mod prepare;
pub mod watch;
pub mod worker;
pub mod writer;

pub use cleanup::CleanupWorker;
pub use config::{AppConfig, WorkerConfig};
pub use error::WorkerError;
pub use handler::ProcessJobHandler;
pub use notify::{Alerter, NoopAlerter, WebhookAlerter};
pub use prepare::{PrepareWorker, job_priority};
pub use watch::watch_for_cancellation;
pub use worker::{ClientFactory, ExportWorker, threshold_exceeded};
pub use writer::NdjsonWriter;
