//! In-memory datastore used by integration tests and local runs.
//!
//! Transactions take a snapshot of the shared tables on `begin` and write the
//! whole snapshot back on `commit`; rollback (explicit or by drop) discards
//! it. That gives real transactional behavior for the single-worker runner,
//! which never holds two transactions open at once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use url::Url;
use uuid::Uuid;

use crate::fetcher::util::{base_origin, top_private_domain_and_scheme};
use crate::models::{
    Attribution, EventReport, KeyValueData, KeyValueDataType, PendingRegistration, Source,
    SourceStatus, SurfaceType, Trigger,
};

use super::errors::{DatastoreError, DatastoreResult};
use super::{Datastore, MeasurementDao};

#[derive(Debug, Default, Clone)]
struct Tables {
    pending: Vec<PendingRegistration>,
    sources: Vec<Source>,
    triggers: Vec<Trigger>,
    event_reports: Vec<EventReport>,
    attributions: Vec<Attribution>,
    key_values: HashMap<(KeyValueDataType, String), String>,
}

/// Shared-state datastore backed by a mutex-guarded set of tables.
#[derive(Debug, Default, Clone)]
pub struct InMemoryDatastore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_registrations(&self) -> Vec<PendingRegistration> {
        self.tables.lock().pending.clone()
    }

    pub fn sources(&self) -> Vec<Source> {
        self.tables.lock().sources.clone()
    }

    pub fn triggers(&self) -> Vec<Trigger> {
        self.tables.lock().triggers.clone()
    }

    pub fn event_reports(&self) -> Vec<EventReport> {
        self.tables.lock().event_reports.clone()
    }

    pub fn attributions(&self) -> Vec<Attribution> {
        self.tables.lock().attributions.clone()
    }

    pub fn key_value(&self, data_type: KeyValueDataType, key: &str) -> Option<String> {
        self.tables
            .lock()
            .key_values
            .get(&(data_type, key.to_string()))
            .cloned()
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn begin(&self) -> DatastoreResult<Box<dyn MeasurementDao>> {
        let snapshot = self.tables.lock().clone();
        Ok(Box::new(InMemoryDao {
            shared: Arc::clone(&self.tables),
            working: Some(snapshot),
        }))
    }
}

struct InMemoryDao {
    shared: Arc<Mutex<Tables>>,
    working: Option<Tables>,
}

impl InMemoryDao {
    fn tables(&mut self) -> DatastoreResult<&mut Tables> {
        self.working.as_mut().ok_or(DatastoreError::TransactionClosed)
    }
}

/// Web publishers match the given origin exactly or any subdomain origin of
/// it on the same scheme. App publishers match exactly.
fn publisher_matches(stored: &str, publisher: &str, publisher_type: SurfaceType) -> bool {
    if stored == publisher {
        return true;
    }
    if publisher_type == SurfaceType::Web {
        if let (Ok(stored_url), Ok(given_url)) = (Url::parse(stored), Url::parse(publisher)) {
            if stored_url.scheme() == given_url.scheme() {
                if let (Some(stored_host), Some(given_host)) =
                    (stored_url.host_str(), given_url.host_str())
                {
                    return stored_host.ends_with(&format!(".{given_host}"));
                }
            }
        }
    }
    false
}

/// Trigger destinations are stored as registered; the comparison reduces
/// them to the same normalized form the given destination arrives in.
fn trigger_destination_matches(stored: &str, destination: &str, kind: SurfaceType) -> bool {
    if stored == destination {
        return true;
    }
    let normalized = match kind {
        SurfaceType::App => base_origin(stored),
        SurfaceType::Web => top_private_domain_and_scheme(stored),
    };
    normalized.as_deref() == Some(destination)
}

fn source_destinations(source: &Source, kind: SurfaceType) -> &[String] {
    match kind {
        SurfaceType::App => &source.app_destinations,
        SurfaceType::Web => &source.web_destinations,
    }
}

#[async_trait]
impl MeasurementDao for InMemoryDao {
    async fn fetch_next_queued_registration(
        &mut self,
        retry_limit: i64,
        excluded_origins: &[String],
    ) -> DatastoreResult<Option<PendingRegistration>> {
        let tables = self.tables()?;
        let mut best: Option<&PendingRegistration> = None;
        for registration in &tables.pending {
            if registration.retry_count >= retry_limit {
                continue;
            }
            if let Some(origin) = base_origin(&registration.registration_uri) {
                if excluded_origins.iter().any(|excluded| *excluded == origin) {
                    continue;
                }
            }
            // Earliest request time wins; insertion order breaks ties.
            match best {
                Some(current) if current.request_time <= registration.request_time => {}
                _ => best = Some(registration),
            }
        }
        Ok(best.cloned())
    }

    async fn insert_pending_registration(
        &mut self,
        registration: &PendingRegistration,
    ) -> DatastoreResult<()> {
        self.tables()?.pending.push(registration.clone());
        Ok(())
    }

    async fn delete_pending_registration(&mut self, id: Uuid) -> DatastoreResult<()> {
        let tables = self.tables()?;
        let before = tables.pending.len();
        tables.pending.retain(|registration| registration.id != id);
        if tables.pending.len() == before {
            return Err(DatastoreError::database(format!(
                "pending registration {id} not found"
            )));
        }
        Ok(())
    }

    async fn update_retry_count(&mut self, id: Uuid, retry_count: i64) -> DatastoreResult<()> {
        let tables = self.tables()?;
        match tables
            .pending
            .iter_mut()
            .find(|registration| registration.id == id)
        {
            Some(registration) => {
                registration.retry_count = retry_count;
                Ok(())
            }
            None => Err(DatastoreError::database(format!(
                "pending registration {id} not found"
            ))),
        }
    }

    async fn get_key_value_data(
        &mut self,
        data_type: KeyValueDataType,
        key: &str,
    ) -> DatastoreResult<KeyValueData> {
        let tables = self.tables()?;
        Ok(KeyValueData {
            data_type,
            key: key.to_string(),
            value: tables.key_values.get(&(data_type, key.to_string())).cloned(),
        })
    }

    async fn upsert_key_value_data(&mut self, data: &KeyValueData) -> DatastoreResult<()> {
        let tables = self.tables()?;
        let slot = (data.data_type, data.key.clone());
        match &data.value {
            Some(value) => {
                tables.key_values.insert(slot, value.clone());
            }
            None => {
                tables.key_values.remove(&slot);
            }
        }
        Ok(())
    }

    async fn insert_source(&mut self, source: &Source) -> DatastoreResult<()> {
        self.tables()?.sources.push(source.clone());
        Ok(())
    }

    async fn insert_trigger(&mut self, trigger: &Trigger) -> DatastoreResult<()> {
        self.tables()?.triggers.push(trigger.clone());
        Ok(())
    }

    async fn insert_event_report(&mut self, report: &EventReport) -> DatastoreResult<()> {
        self.tables()?.event_reports.push(report.clone());
        Ok(())
    }

    async fn insert_attribution(&mut self, attribution: &Attribution) -> DatastoreResult<()> {
        self.tables()?.attributions.push(attribution.clone());
        Ok(())
    }

    async fn count_sources_per_publisher(
        &mut self,
        publisher: &str,
        publisher_type: SurfaceType,
    ) -> DatastoreResult<i64> {
        let tables = self.tables()?;
        let count = tables
            .sources
            .iter()
            .filter(|source| source.status == SourceStatus::Active)
            .filter(|source| publisher_matches(&source.publisher, publisher, publisher_type))
            .count();
        Ok(count as i64)
    }

    async fn count_sources_excluding_registration_origin(
        &mut self,
        registration_origin: &str,
        publisher: &str,
        publisher_type: SurfaceType,
        enrollment_id: &str,
        event_time: i64,
        origin_update_window_ms: i64,
    ) -> DatastoreResult<i64> {
        let tables = self.tables()?;
        let window_start = event_time - origin_update_window_ms;
        let count = tables
            .sources
            .iter()
            .filter(|source| source.registration_origin != registration_origin)
            .filter(|source| publisher_matches(&source.publisher, publisher, publisher_type))
            .filter(|source| source.enrollment_id == enrollment_id)
            .filter(|source| source.event_time >= window_start && source.event_time <= event_time)
            .count();
        Ok(count as i64)
    }

    async fn count_distinct_destinations_per_publisher_enrollment(
        &mut self,
        publisher: &str,
        publisher_type: SurfaceType,
        enrollment_id: &str,
        excluded_destinations: &[String],
        destination_type: SurfaceType,
        window_start: i64,
        window_end: i64,
    ) -> DatastoreResult<i64> {
        let tables = self.tables()?;
        let mut distinct: HashSet<&str> = HashSet::new();
        for source in &tables.sources {
            if source.status != SourceStatus::Active {
                continue;
            }
            if !publisher_matches(&source.publisher, publisher, publisher_type) {
                continue;
            }
            if source.enrollment_id != enrollment_id {
                continue;
            }
            if source.event_time < window_start || source.event_time > window_end {
                continue;
            }
            for destination in source_destinations(source, destination_type) {
                if !excluded_destinations.contains(destination) {
                    distinct.insert(destination.as_str());
                }
            }
        }
        Ok(distinct.len() as i64)
    }

    async fn count_distinct_enrollments_per_publisher_destination(
        &mut self,
        publisher: &str,
        publisher_type: SurfaceType,
        destinations: &[String],
        excluded_enrollment_id: &str,
        window_start: i64,
        window_end: i64,
    ) -> DatastoreResult<i64> {
        let tables = self.tables()?;
        let mut distinct: HashSet<&str> = HashSet::new();
        for source in &tables.sources {
            if source.enrollment_id == excluded_enrollment_id {
                continue;
            }
            if !publisher_matches(&source.publisher, publisher, publisher_type) {
                continue;
            }
            if source.event_time < window_start || source.event_time > window_end {
                continue;
            }
            let overlaps = source
                .app_destinations
                .iter()
                .chain(source.web_destinations.iter())
                .any(|destination| destinations.contains(destination));
            if overlaps {
                distinct.insert(source.enrollment_id.as_str());
            }
        }
        Ok(distinct.len() as i64)
    }

    async fn count_triggers_per_destination(
        &mut self,
        destination: &str,
        destination_type: SurfaceType,
    ) -> DatastoreResult<i64> {
        let tables = self.tables()?;
        let count = tables
            .triggers
            .iter()
            .filter(|trigger| trigger.destination_type == destination_type)
            .filter(|trigger| {
                trigger_destination_matches(
                    &trigger.attribution_destination,
                    destination,
                    destination_type,
                )
            })
            .count();
        Ok(count as i64)
    }

    async fn commit(&mut self) -> DatastoreResult<()> {
        let tables = self
            .working
            .take()
            .ok_or(DatastoreError::TransactionClosed)?;
        *self.shared.lock() = tables;
        Ok(())
    }

    async fn rollback(&mut self) -> DatastoreResult<()> {
        if self.working.take().is_none() {
            return Err(DatastoreError::TransactionClosed);
        }
        Ok(())
    }
}
