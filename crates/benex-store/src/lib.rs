//! # benex-store
//!
//! Job store abstraction for the benex bulk-export pipeline.
//!
//! The main trait is [`JobStore`], the persistence contract the preparer,
//! export workers, completion detector and cleanup sweep are written
//! against. Two backends are provided:
//!
//! - [`PostgresStore`] — production backend on PostgreSQL.
//! - [`MemoryStore`] — in-process backend for tests and local runs.
//!
//! All mutations are single-row conditional updates or inserts; the design
//! deliberately avoids multi-row transactions because completion is derived
//! from the job-key count rather than stored transactionally.

mod error;
mod memory;
mod postgres;
mod schema;
mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::{PostgresConfig, PostgresStore};
pub use store::{JobStore, NewJob};
