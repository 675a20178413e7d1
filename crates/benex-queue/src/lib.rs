//! # benex-queue
//!
//! Durable at-least-once work queue behind the [`QueueTransport`] trait.
//!
//! The orchestration core registers one [`JobHandler`] per message kind and
//! never touches a concrete transport. Two interchangeable backends exist:
//!
//! - [`PostgresQueue`] — production backend; leases rows with
//!   `FOR UPDATE SKIP LOCKED`, tracks per-message error counts, orders by
//!   priority, and reschedules failures with polynomial backoff.
//! - [`MemoryQueue`] — in-process backend with the same contract, used by
//!   tests and local runs.
//!
//! A handler returning `Ok` acknowledges the message (it is removed). A
//! handler returning `Err` puts it back with `error_count + 1` and a
//! backoff delay, until `max_attempts` is reached and the message is
//! discarded with an error log.

mod error;
mod memory;
mod postgres;
mod transport;

pub use error::QueueError;
pub use memory::{MemoryQueue, MemoryQueueConfig};
pub use postgres::{PostgresQueue, PostgresQueueConfig};
pub use transport::{HandlerError, HandlerMap, JobHandler, QueueJob, QueueTransport, retry_backoff};
