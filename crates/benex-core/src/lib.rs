//! # benex-core
//!
//! Shared domain model for the benex bulk-export pipeline.
//!
//! This crate defines the persistent records (`Job`, `JobKey`,
//! `Beneficiary`), the job lifecycle state machine (`JobStatus`), and the
//! queue payload types exchanged between the preparer, the export workers
//! and the cleanup sweep. It contains no I/O: stores, queues and clients
//! live in their own crates and depend on these types.

mod args;
mod job;

pub use args::{CleanupJobArgs, ClaimsWindow, ExportJobArgs, PrepareJobArgs};
pub use job::{
    BLANK_FILE_NAME, Beneficiary, InvalidResourceType, Job, JobKey, JobStatus, ResourceType,
};
