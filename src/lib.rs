#![allow(clippy::doc_markdown)] // Allow technical terms like JSON, PostgreSQL in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Attribution Registration Pipeline
//!
//! Asynchronous pipeline for attribution source and trigger registrations:
//! callers enqueue registration requests, a queue runner fetches each
//! registration URI, parses and validates the response headers, applies
//! privacy admission checks, and persists the resulting entities atomically.
//!
//! ## Architecture
//!
//! Registration is split into a cheap synchronous half and a deferred
//! asynchronous half. The **enqueue API** validates nothing beyond request
//! shape; it writes pending rows and wakes the runner. The **queue runner**
//! does all the work that can fail slowly: the network fetch (with
//! registration-header redirects fanned out as new pending rows under a
//! per-group cap), header parsing, admission checks, and a single
//! transaction per item covering the entity insert, its noise side effects,
//! and the queue-row retry/delete decision.
//!
//! ## Module Organization
//!
//! - [`models`] - Registration, source, trigger, and report data types
//! - [`datastore`] - Transactional storage seam with Postgres and in-memory
//!   implementations
//! - [`enqueue`] - Public registration entry points
//! - [`fetcher`] - HTTP fetch and response-header parsing
//! - [`orchestration`] - The queue runner
//! - [`services`] - Enrollment lookup, noise assignment, debug reports,
//!   work notifications
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//! - [`logging`] - Environment-aware tracing setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use attribution_pipeline::enqueue::{AppSourceRequest, RegistrationEnqueuer};
//! use attribution_pipeline::datastore::InMemoryDatastore;
//! use attribution_pipeline::models::SourceType;
//! use attribution_pipeline::services::LoggingNotifier;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let datastore = Arc::new(InMemoryDatastore::new());
//! let enqueuer = RegistrationEnqueuer::new(datastore, Arc::new(LoggingNotifier));
//!
//! let group_id = enqueuer
//!     .enqueue_app_source(AppSourceRequest {
//!         registration_uri: "https://adtech.example/register-source".to_string(),
//!         registrant: "android-app://com.example.app".to_string(),
//!         source_type: SourceType::Event,
//!         request_time: 1_700_000_000_000,
//!         ad_id_permission: false,
//!         platform_ad_id: None,
//!     })
//!     .await?;
//! println!("queued registration group {group_id}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod datastore;
pub mod enqueue;
pub mod error;
pub mod fetcher;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod services;

pub use config::PipelineConfig;
pub use enqueue::RegistrationEnqueuer;
pub use error::{PipelineError, Result};
pub use logging::init_structured_logging;
pub use orchestration::{InvocationSummary, ItemOutcome, QueueRunner};
