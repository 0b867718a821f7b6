//! # Queue Orchestration
//!
//! The control core of the pipeline: drains the pending-registration queue
//! one row at a time, dispatches each row to the matching fetcher, and
//! persists the outcome in a single transaction per item.
//!
//! ## Processing model
//!
//! - **One row per step**: each processing step dequeues exactly one
//!   pending registration; an invocation loops steps up to a configured cap.
//! - **Fetch outside storage**: the network call runs between the dequeue
//!   transaction and the persistence transaction, so a slow origin never
//!   holds a storage lock.
//! - **Atomic persistence**: admission checks, entity insert, fake-report
//!   rows, redirect fan-out, and queue-row deletion commit together or not
//!   at all. A failed transaction leaves the row queued for the next run.
//! - **Failure taxonomy**: transient fetch failures bump the retry count and
//!   keep the row; terminal failures delete it but still honor redirects
//!   discovered before the failure.

pub mod queue_runner;

pub use queue_runner::{InvocationSummary, ItemOutcome, QueueRunner};
