//! Queue runner: processes pending registrations end to end.
//!
//! Each processed item walks `dequeue -> fetch -> persist`. The persistence
//! step is one transaction covering admission checks, the entity insert with
//! its noise side effects, redirect fan-out under the per-group counter cap,
//! and the queue-row delete/retry decision. Registration metrics are emitted
//! for every item regardless of outcome.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{LimitsConfig, PipelineConfig, RunnerConfig};
use crate::datastore::{Datastore, DatastoreError, DatastoreResult, MeasurementDao};
use crate::error::Result;
use crate::fetcher::{util, SourceFetch, TriggerFetch};
use crate::models::{
    Attribution, EntityStatus, EventReport, EventReportStatus, FetchStatus, KeyValueDataType,
    PendingRegistration, Redirects, RegistrationKind, Source, SurfaceType, Trigger,
};
use crate::services::{
    DebugReportKind, DebugReporter, NoiseAssigner, NoiseAssignment, Notifier, TRIGGER_URI,
};

/// Terminal state of one dequeued queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemOutcome {
    /// Request succeeded and the item committed. Covers admission-rejected
    /// entities too: the fetch itself was fine and the row is gone.
    Success,
    /// Transient fetch failure; the row stays queued with its retry count
    /// bumped.
    TransientFailure,
    /// Terminal fetch failure; the row is deleted, though redirects
    /// discovered before the failure were still enqueued.
    TerminalFailure,
    /// The item's transaction failed and rolled back; the row stays queued
    /// exactly as it was.
    StorageFailure,
}

/// Per-invocation tally, one increment per processed item.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InvocationSummary {
    pub processed: u32,
    pub succeeded: u32,
    pub transient_failures: u32,
    pub terminal_failures: u32,
    pub storage_failures: u32,
}

impl InvocationSummary {
    fn record(&mut self, outcome: ItemOutcome) {
        self.processed += 1;
        match outcome {
            ItemOutcome::Success => self.succeeded += 1,
            ItemOutcome::TransientFailure => self.transient_failures += 1,
            ItemOutcome::TerminalFailure => self.terminal_failures += 1,
            ItemOutcome::StorageFailure => self.storage_failures += 1,
        }
    }
}

/// A finished fetch resolves to exactly one queue-row disposition; matching
/// on this makes "never both retry and delete" structural.
enum RowDisposition {
    Retry,
    Delete,
}

fn row_disposition(status: &FetchStatus) -> RowDisposition {
    if status.should_retry() {
        RowDisposition::Retry
    } else {
        RowDisposition::Delete
    }
}

pub struct QueueRunner {
    datastore: Arc<dyn Datastore>,
    source_fetcher: Arc<dyn SourceFetch>,
    trigger_fetcher: Arc<dyn TriggerFetch>,
    debug_reporter: Arc<dyn DebugReporter>,
    noise_assigner: Arc<dyn NoiseAssigner>,
    notifier: Arc<dyn Notifier>,
    runner: RunnerConfig,
    limits: LimitsConfig,
}

impl QueueRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        datastore: Arc<dyn Datastore>,
        source_fetcher: Arc<dyn SourceFetch>,
        trigger_fetcher: Arc<dyn TriggerFetch>,
        debug_reporter: Arc<dyn DebugReporter>,
        noise_assigner: Arc<dyn NoiseAssigner>,
        notifier: Arc<dyn Notifier>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            datastore,
            source_fetcher,
            trigger_fetcher,
            debug_reporter,
            noise_assigner,
            notifier,
            runner: config.runner.clone(),
            limits: config.limits.clone(),
        }
    }

    /// Drain up to `max_registrations_per_invocation` queue items. Origins
    /// that failed transiently are skipped for the rest of the invocation.
    /// A storage failure inside one item never aborts the loop; only a
    /// failing dequeue does.
    #[instrument(skip(self))]
    pub async fn run_invocation(&self) -> Result<InvocationSummary> {
        let mut failed_origins = HashSet::new();
        let mut summary = InvocationSummary::default();
        for _ in 0..self.runner.max_registrations_per_invocation {
            match self.process_next(&mut failed_origins).await? {
                Some(outcome) => summary.record(outcome),
                None => break,
            }
        }
        debug!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            "Registration queue invocation finished"
        );
        Ok(summary)
    }

    /// Process exactly one queued registration. `None` means the queue had
    /// no eligible row.
    #[instrument(skip(self, failed_origins))]
    pub async fn process_next(
        &self,
        failed_origins: &mut HashSet<String>,
    ) -> Result<Option<ItemOutcome>> {
        let excluded: Vec<String> = failed_origins.iter().cloned().collect();
        let next = {
            let mut dao = self.datastore.begin().await?;
            match dao
                .fetch_next_queued_registration(self.runner.retry_limit, &excluded)
                .await
            {
                Ok(next) => {
                    dao.commit().await?;
                    next
                }
                Err(dequeue_err) => {
                    if let Err(rollback_err) = dao.rollback().await {
                        warn!(error = %rollback_err, "Rollback after failed dequeue failed");
                    }
                    return Err(dequeue_err.into());
                }
            }
        };
        let Some(registration) = next else {
            debug!("No eligible pending registration");
            return Ok(None);
        };

        let outcome = if registration.kind.is_source() {
            debug!(id = %registration.id, "Processing source registration");
            self.process_source(registration, failed_origins).await
        } else {
            debug!(id = %registration.id, "Processing trigger registration");
            self.process_trigger(registration, failed_origins).await
        };
        Ok(Some(outcome))
    }

    async fn process_source(
        &self,
        registration: PendingRegistration,
        failed_origins: &mut HashSet<String>,
    ) -> ItemOutcome {
        let result = self.source_fetcher.fetch_source(&registration).await;
        let mut status = result.status;
        status.registration_delay_ms =
            Some(Utc::now().timestamp_millis() - registration.request_time);

        let outcome = match self.datastore.begin().await {
            Ok(mut dao) => {
                let applied = self
                    .apply_source_outcome(
                        dao.as_mut(),
                        &registration,
                        result.entity,
                        &mut status,
                        &result.redirects,
                        failed_origins,
                    )
                    .await;
                self.finish_item_transaction(dao, applied, &registration, &mut status)
                    .await
            }
            Err(begin_err) => {
                warn!(id = %registration.id, error = %begin_err, "Could not open registration transaction");
                status.entity_status = EntityStatus::StorageError;
                ItemOutcome::StorageFailure
            }
        };
        self.emit_registration_metrics(&registration, &status);
        outcome
    }

    async fn process_trigger(
        &self,
        registration: PendingRegistration,
        failed_origins: &mut HashSet<String>,
    ) -> ItemOutcome {
        let result = self.trigger_fetcher.fetch_trigger(&registration).await;
        let mut status = result.status;
        status.registration_delay_ms =
            Some(Utc::now().timestamp_millis() - registration.request_time);

        let outcome = match self.datastore.begin().await {
            Ok(mut dao) => {
                let applied = self
                    .apply_trigger_outcome(
                        dao.as_mut(),
                        &registration,
                        result.entity,
                        &mut status,
                        &result.redirects,
                        failed_origins,
                    )
                    .await;
                self.finish_item_transaction(dao, applied, &registration, &mut status)
                    .await
            }
            Err(begin_err) => {
                warn!(id = %registration.id, error = %begin_err, "Could not open registration transaction");
                status.entity_status = EntityStatus::StorageError;
                ItemOutcome::StorageFailure
            }
        };
        self.emit_registration_metrics(&registration, &status);
        outcome
    }

    /// Commit or roll back one item's transaction, mapping any storage
    /// failure to [`ItemOutcome::StorageFailure`] so the invocation loop
    /// keeps draining.
    async fn finish_item_transaction(
        &self,
        mut dao: Box<dyn MeasurementDao>,
        applied: DatastoreResult<ItemOutcome>,
        registration: &PendingRegistration,
        status: &mut FetchStatus,
    ) -> ItemOutcome {
        match applied {
            Ok(outcome) => match dao.commit().await {
                Ok(()) => outcome,
                Err(commit_err) => {
                    warn!(id = %registration.id, error = %commit_err, "Registration transaction commit failed");
                    status.entity_status = EntityStatus::StorageError;
                    ItemOutcome::StorageFailure
                }
            },
            Err(apply_err) => {
                warn!(id = %registration.id, error = %apply_err, "Registration transaction failed, rolling back");
                if let Err(rollback_err) = dao.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed registration transaction failed");
                }
                status.entity_status = EntityStatus::StorageError;
                ItemOutcome::StorageFailure
            }
        }
    }

    async fn apply_source_outcome(
        &self,
        dao: &mut dyn MeasurementDao,
        registration: &PendingRegistration,
        entity: Option<Source>,
        status: &mut FetchStatus,
        redirects: &Redirects,
        failed_origins: &mut HashSet<String>,
    ) -> DatastoreResult<ItemOutcome> {
        if !status.is_request_success() {
            return self
                .handle_failure(dao, registration, status, failed_origins)
                .await;
        }
        if let Some(source) = entity {
            self.store_source(dao, source, registration).await?;
        }
        self.handle_success(dao, registration, status, redirects)
            .await?;
        Ok(if status.entity_status.is_success() {
            ItemOutcome::Success
        } else {
            ItemOutcome::TerminalFailure
        })
    }

    async fn apply_trigger_outcome(
        &self,
        dao: &mut dyn MeasurementDao,
        registration: &PendingRegistration,
        entity: Option<Trigger>,
        status: &mut FetchStatus,
        redirects: &Redirects,
        failed_origins: &mut HashSet<String>,
    ) -> DatastoreResult<ItemOutcome> {
        if !status.is_request_success() {
            return self
                .handle_failure(dao, registration, status, failed_origins)
                .await;
        }
        if let Some(trigger) = entity {
            self.store_trigger(dao, &trigger).await?;
        }
        self.handle_success(dao, registration, status, redirects)
            .await?;
        Ok(if status.entity_status.is_success() {
            ItemOutcome::Success
        } else {
            ItemOutcome::TerminalFailure
        })
    }

    /// Admission-check an admitted source and insert it with its noise side
    /// effects. Rejected sources are dropped silently; the queue row is
    /// still handled by the caller.
    async fn store_source(
        &self,
        dao: &mut dyn MeasurementDao,
        mut source: Source,
        registration: &PendingRegistration,
    ) -> DatastoreResult<()> {
        // Web sources are attributed to the page origin; app sources to the
        // registrant package.
        let (top_origin, publisher_type) = match registration.kind {
            RegistrationKind::WebSource { .. } => {
                (registration.top_origin.as_str(), SurfaceType::Web)
            }
            _ => (registration.registrant.as_str(), SurfaceType::App),
        };
        if self
            .is_source_allowed_to_insert(dao, &source, top_origin, publisher_type)
            .await?
        {
            self.insert_source_with_noise(dao, &mut source).await?;
            self.debug_reporter
                .schedule_source_report(DebugReportKind::SourceSuccess, &source)
                .await;
        }
        Ok(())
    }

    /// Sequential admission checks; each runs only if the ones before it
    /// passed, except that the destination bound is evaluated for both
    /// surface types before admission fails.
    async fn is_source_allowed_to_insert(
        &self,
        dao: &mut dyn MeasurementDao,
        source: &Source,
        top_origin: &str,
        publisher_type: SurfaceType,
    ) -> DatastoreResult<bool> {
        let window_start = source.event_time - self.limits.rate_limit_window_ms;
        let Some(publisher) = top_level_publisher(top_origin, publisher_type) else {
            debug!(top_origin, "No top-level publisher, rejecting source");
            return Ok(false);
        };

        let publisher_origin =
            util::base_origin(top_origin).unwrap_or_else(|| top_origin.to_string());
        let sources_per_publisher = dao
            .count_sources_per_publisher(&publisher_origin, publisher_type)
            .await?;
        if sources_per_publisher >= self.limits.max_sources_per_publisher {
            debug!(
                publisher = %publisher,
                count = sources_per_publisher,
                "Stored-source ceiling reached for publisher"
            );
            self.debug_reporter
                .schedule_source_report(DebugReportKind::SourceStorageLimit, source)
                .await;
            return Ok(false);
        }

        let other_origins = dao
            .count_sources_excluding_registration_origin(
                &source.registration_origin,
                &publisher,
                publisher_type,
                &source.enrollment_id,
                source.event_time,
                self.limits.min_reporting_origin_update_window_ms,
            )
            .await?;
        if other_origins > 0 {
            debug!(
                publisher = %publisher,
                enrollment_id = %source.enrollment_id,
                "Another reporting origin already registered recently"
            );
            return Ok(false);
        }

        let mut destination_limit_exceeded = false;
        for (destination_type, destinations) in source.destinations() {
            if !self
                .destinations_within_limit(
                    dao,
                    source,
                    &publisher,
                    publisher_type,
                    destinations,
                    destination_type,
                    window_start,
                )
                .await?
            {
                destination_limit_exceeded = true;
            }
        }
        if destination_limit_exceeded {
            return Ok(false);
        }

        for (_, destinations) in source.destinations() {
            let enrollments = dao
                .count_distinct_enrollments_per_publisher_destination(
                    &publisher,
                    publisher_type,
                    destinations,
                    &source.enrollment_id,
                    window_start,
                    source.event_time,
                )
                .await?;
            if enrollments >= self.limits.max_distinct_reporting_origins_per_publisher_destination
            {
                debug!(
                    publisher = %publisher,
                    count = enrollments,
                    "Distinct reporting-origin bound reached for publisher and destination"
                );
                self.debug_reporter
                    .schedule_source_report(DebugReportKind::SourceReportingOriginLimit, source)
                    .await;
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn destinations_within_limit(
        &self,
        dao: &mut dyn MeasurementDao,
        source: &Source,
        publisher: &str,
        publisher_type: SurfaceType,
        destinations: &[String],
        destination_type: SurfaceType,
        window_start: i64,
    ) -> DatastoreResult<bool> {
        let destination_count = dao
            .count_distinct_destinations_per_publisher_enrollment(
                publisher,
                publisher_type,
                &source.enrollment_id,
                destinations,
                destination_type,
                window_start,
                source.event_time,
            )
            .await?;
        if destination_count + destinations.len() as i64
            > self.limits.max_distinct_destinations_in_active_source
        {
            debug!(
                publisher = %publisher,
                destination_type = %destination_type,
                count = destination_count,
                "Distinct-destination bound reached for publisher and enrollment"
            );
            self.debug_reporter
                .schedule_source_report(DebugReportKind::SourceDestinationLimit, source)
                .await;
            return Ok(false);
        }
        Ok(true)
    }

    /// Insert a source together with its noise outcome: fake event reports
    /// plus one attribution rate-limit row per destination when the source
    /// did not stay truthful.
    async fn insert_source_with_noise(
        &self,
        dao: &mut dyn MeasurementDao,
        source: &mut Source,
    ) -> DatastoreResult<()> {
        let assignment = self.noise_assigner.assign(source).await;
        source.attribution_mode = assignment.attribution_mode;
        let event_reports = fake_event_reports(source, &assignment);
        if !event_reports.is_empty() {
            self.debug_reporter
                .schedule_source_report(DebugReportKind::SourceNoised, source)
                .await;
        }
        if let Err(insert_err) = dao.insert_source(source).await {
            self.debug_reporter
                .schedule_source_report(DebugReportKind::SourceUnknownError, source)
                .await;
            error!(
                source_id = %source.id,
                error = %insert_err,
                "Source insert failed, scheduled source-unknown-error report"
            );
            return Err(insert_err);
        }
        for report in &event_reports {
            dao.insert_event_report(report).await?;
        }
        if !source.attribution_mode.is_truthful() {
            for (_, destinations) in source.destinations() {
                for destination in destinations {
                    let attribution = fake_attribution_rate_limit(source, destination)?;
                    dao.insert_attribution(&attribution).await?;
                }
            }
        }
        Ok(())
    }

    /// Count-gate and insert a trigger, waking the downstream attribution
    /// consumer on success. A failing count query drops the trigger without
    /// failing the registration.
    async fn store_trigger(
        &self,
        dao: &mut dyn MeasurementDao,
        trigger: &Trigger,
    ) -> DatastoreResult<()> {
        if self.is_trigger_allowed_to_insert(dao, trigger).await {
            if let Err(insert_err) = dao.insert_trigger(trigger).await {
                self.debug_reporter
                    .schedule_trigger_report(DebugReportKind::TriggerUnknownError, trigger)
                    .await;
                error!(
                    trigger_id = %trigger.id,
                    error = %insert_err,
                    "Trigger insert failed, scheduled trigger-unknown-error report"
                );
                return Err(insert_err);
            }
            self.notifier.notify(TRIGGER_URI).await;
        }
        Ok(())
    }

    async fn is_trigger_allowed_to_insert(
        &self,
        dao: &mut dyn MeasurementDao,
        trigger: &Trigger,
    ) -> bool {
        match dao
            .count_triggers_per_destination(
                &trigger.attribution_destination,
                trigger.destination_type,
            )
            .await
        {
            Ok(count) => count < self.limits.max_triggers_per_destination,
            Err(count_err) => {
                error!(
                    destination = %trigger.attribution_destination,
                    error = %count_err,
                    "Trigger count query failed, dropping trigger"
                );
                false
            }
        }
    }

    /// Delete the processed row and fan discovered redirects out as child
    /// rows, bounded by the per-group counter. The counter is only written
    /// back when at least one child row was inserted.
    async fn handle_success(
        &self,
        dao: &mut dyn MeasurementDao,
        registration: &PendingRegistration,
        status: &mut FetchStatus,
        redirects: &Redirects,
    ) -> DatastoreResult<()> {
        // Delete first: if another job already removed the row this errors
        // and rolls the whole item back.
        dao.delete_pending_registration(registration.id).await?;
        if redirects.is_empty() {
            return Ok(());
        }
        let max_redirects = self.runner.max_registration_redirects;
        let mut key_value = dao
            .get_key_value_data(
                KeyValueDataType::RegistrationRedirectCount,
                &registration.registration_id.to_string(),
            )
            .await?;
        let mut current_count = key_value.registration_redirect_count();
        if current_count == max_redirects {
            debug!(
                registration_id = %registration.registration_id,
                "Redirect cap already reached for group"
            );
            status.redirect_error = true;
            return Ok(());
        }
        for uri in redirects.uris() {
            if current_count >= max_redirects {
                break;
            }
            dao.insert_pending_registration(&registration.redirect_child(uri))
                .await?;
            current_count += 1;
        }
        key_value.set_registration_redirect_count(current_count);
        dao.upsert_key_value_data(&key_value).await?;
        Ok(())
    }

    /// Retry or delete the row; a fetch failure resolves to exactly one of
    /// the two.
    async fn handle_failure(
        &self,
        dao: &mut dyn MeasurementDao,
        registration: &PendingRegistration,
        status: &FetchStatus,
        failed_origins: &mut HashSet<String>,
    ) -> DatastoreResult<ItemOutcome> {
        match row_disposition(status) {
            RowDisposition::Retry => {
                debug!(
                    id = %registration.id,
                    response_status = %status.response_status,
                    "Registration queued for retry"
                );
                if let Some(origin) = util::base_origin(&registration.registration_uri) {
                    failed_origins.insert(origin);
                }
                dao.update_retry_count(registration.id, registration.retry_count + 1)
                    .await?;
                Ok(ItemOutcome::TransientFailure)
            }
            RowDisposition::Delete => {
                debug!(
                    id = %registration.id,
                    response_status = %status.response_status,
                    "Registration not retryable, deleting"
                );
                dao.delete_pending_registration(registration.id).await?;
                Ok(ItemOutcome::TerminalFailure)
            }
        }
    }

    fn emit_registration_metrics(&self, registration: &PendingRegistration, status: &FetchStatus) {
        let oversized_origin = (status.response_size
            > self.limits.max_response_header_size_bytes)
            .then(|| {
                util::base_origin(&registration.registration_uri)
                    .unwrap_or_else(|| registration.registration_uri.clone())
            });
        info!(
            registration_id = %registration.registration_id,
            kind = %registration.kind,
            response_status = %status.response_status,
            entity_status = %status.entity_status,
            registration_delay_ms = status.registration_delay_ms.unwrap_or(0),
            response_size_bytes = status.response_size,
            redirect_error = status.redirect_error,
            oversized_origin = oversized_origin.as_deref(),
            "Registration processed"
        );
    }
}

fn top_level_publisher(top_origin: &str, publisher_type: SurfaceType) -> Option<String> {
    match publisher_type {
        SurfaceType::App => Some(top_origin.to_string()),
        SurfaceType::Web => util::top_private_domain_and_scheme(top_origin),
    }
}

fn fake_event_reports(source: &Source, assignment: &NoiseAssignment) -> Vec<EventReport> {
    assignment
        .fake_reports
        .iter()
        .map(|fake| EventReport {
            id: Uuid::new_v4(),
            source_id: source.id,
            source_event_id: source.event_id,
            trigger_data: fake.trigger_data,
            trigger_priority: 0,
            trigger_dedup_key: None,
            // The source's own event time keeps the placeholder inside any
            // later rate-limit window query.
            trigger_time: source.event_time,
            report_time: fake.reporting_time,
            attribution_destinations: fake.destinations.clone(),
            enrollment_id: source.enrollment_id.clone(),
            source_type: source.source_type,
            randomized_trigger_rate: assignment.randomized_trigger_rate,
            registration_origin: source.registration_origin.clone(),
            status: EventReportStatus::Pending,
        })
        .collect()
}

/// Rate-limit row planted at source insertion so noised sources consume
/// attribution budget like real ones. Carries no trigger id.
fn fake_attribution_rate_limit(
    source: &Source,
    destination: &str,
) -> DatastoreResult<Attribution> {
    let source_site = top_level_publisher(&source.publisher, source.publisher_type)
        .ok_or_else(|| {
            DatastoreError::internal(format!(
                "no top-level publisher for {}",
                source.publisher
            ))
        })?;
    Ok(Attribution {
        id: Uuid::new_v4(),
        source_site,
        source_origin: source.publisher.clone(),
        destination_site: destination.to_string(),
        destination_origin: destination.to_string(),
        enrollment_id: source.enrollment_id.clone(),
        trigger_time: source.event_time,
        registrant: source.registrant.clone(),
        source_id: Some(source.id),
        trigger_id: None,
    })
}
