//! # Datastore Interface
//!
//! The storage seam consumed by the enqueue API and the queue runner. A
//! [`Datastore`] hands out transaction-scoped [`MeasurementDao`] handles;
//! every operation performed through one handle commits or rolls back
//! atomically. Network fetches never run while a handle is open.
//!
//! Two implementations ship: [`PgDatastore`] over sqlx/Postgres for
//! production and [`InMemoryDatastore`] for tests and embedders that do not
//! want a database.

pub mod errors;
pub mod memory;
pub mod postgres;

pub use errors::{DatastoreError, DatastoreResult};
pub use memory::InMemoryDatastore;
pub use postgres::PgDatastore;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use uuid::Uuid;

use crate::models::{
    Attribution, EventReport, KeyValueData, KeyValueDataType, PendingRegistration, Source,
    SurfaceType, Trigger,
};

/// Hands out transaction-scoped DAO handles.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Open a transaction. Dropping the returned handle without calling
    /// [`MeasurementDao::commit`] rolls the transaction back.
    async fn begin(&self) -> DatastoreResult<Box<dyn MeasurementDao>>;
}

/// All storage operations the pipeline performs, scoped to one transaction.
///
/// Count queries back the admission checks; their `window_start`/`window_end`
/// parameters are epoch milliseconds. Calling any operation after
/// `commit`/`rollback` yields [`DatastoreError::TransactionClosed`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MeasurementDao: Send {
    /// Oldest queued row whose retry count is below `retry_limit` and whose
    /// registration origin is not excluded, or None when the queue is drained.
    async fn fetch_next_queued_registration(
        &mut self,
        retry_limit: i64,
        excluded_origins: &[String],
    ) -> DatastoreResult<Option<PendingRegistration>>;

    async fn insert_pending_registration(
        &mut self,
        registration: &PendingRegistration,
    ) -> DatastoreResult<()>;

    async fn delete_pending_registration(&mut self, id: Uuid) -> DatastoreResult<()>;

    async fn update_retry_count(&mut self, id: Uuid, retry_count: i64) -> DatastoreResult<()>;

    /// Never absent from the caller's perspective: a missing record comes
    /// back with `value: None`.
    async fn get_key_value_data(
        &mut self,
        data_type: KeyValueDataType,
        key: &str,
    ) -> DatastoreResult<KeyValueData>;

    async fn upsert_key_value_data(&mut self, data: &KeyValueData) -> DatastoreResult<()>;

    async fn insert_source(&mut self, source: &Source) -> DatastoreResult<()>;

    async fn insert_trigger(&mut self, trigger: &Trigger) -> DatastoreResult<()>;

    async fn insert_event_report(&mut self, report: &EventReport) -> DatastoreResult<()>;

    async fn insert_attribution(&mut self, attribution: &Attribution) -> DatastoreResult<()>;

    /// Active sources registered for this publisher origin. Web publishers
    /// match subdomains of the given site as well.
    async fn count_sources_per_publisher(
        &mut self,
        publisher: &str,
        publisher_type: SurfaceType,
    ) -> DatastoreResult<i64>;

    /// Sources for (publisher, enrollment) whose registration origin differs
    /// from the given one, within `origin_update_window_ms` before
    /// `event_time`. A non-zero count means another reporting origin already
    /// registered recently.
    async fn count_sources_excluding_registration_origin(
        &mut self,
        registration_origin: &str,
        publisher: &str,
        publisher_type: SurfaceType,
        enrollment_id: &str,
        event_time: i64,
        origin_update_window_ms: i64,
    ) -> DatastoreResult<i64>;

    /// Distinct destinations of `destination_type` across active sources for
    /// (publisher, enrollment) inside the window, not counting
    /// `excluded_destinations` (the ones the new source is bringing).
    async fn count_distinct_destinations_per_publisher_enrollment(
        &mut self,
        publisher: &str,
        publisher_type: SurfaceType,
        enrollment_id: &str,
        excluded_destinations: &[String],
        destination_type: SurfaceType,
        window_start: i64,
        window_end: i64,
    ) -> DatastoreResult<i64>;

    /// Distinct enrollments other than `excluded_enrollment_id` with sources
    /// for (publisher, any of `destinations`) inside the window.
    async fn count_distinct_enrollments_per_publisher_destination(
        &mut self,
        publisher: &str,
        publisher_type: SurfaceType,
        destinations: &[String],
        excluded_enrollment_id: &str,
        window_start: i64,
        window_end: i64,
    ) -> DatastoreResult<i64>;

    async fn count_triggers_per_destination(
        &mut self,
        destination: &str,
        destination_type: SurfaceType,
    ) -> DatastoreResult<i64>;

    async fn commit(&mut self) -> DatastoreResult<()>;

    async fn rollback(&mut self) -> DatastoreResult<()>;
}
