//! PostgreSQL datastore. All statements are runtime-checked sqlx queries;
//! unsigned 64-bit fields are stored bit-cast in BIGINT columns and enums as
//! their snake_case text form.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use url::Url;
use uuid::Uuid;

use crate::fetcher::util::base_origin;
use crate::models::{
    Attribution, EventReport, KeyValueData, KeyValueDataType, PendingRegistration,
    RegistrationKind, Source, SurfaceType, Trigger,
};

use super::errors::{DatastoreError, DatastoreResult};
use super::{Datastore, MeasurementDao};

/// Connection-pool backed datastore; transactions come from [`Datastore::begin`].
#[derive(Debug, Clone)]
pub struct PgDatastore {
    pool: PgPool,
}

impl PgDatastore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> DatastoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Datastore for PgDatastore {
    async fn begin(&self) -> DatastoreResult<Box<dyn MeasurementDao>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransactionDao { tx: Some(tx) }))
    }
}

struct PgTransactionDao {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgTransactionDao {
    fn tx(&mut self) -> DatastoreResult<&mut Transaction<'static, Postgres>> {
        self.tx.as_mut().ok_or(DatastoreError::TransactionClosed)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PendingRegistrationRow {
    id: Uuid,
    registration_uri: String,
    registration_id: Uuid,
    kind: serde_json::Value,
    registrant: String,
    top_origin: String,
    verified_destination: Option<String>,
    web_destination: Option<String>,
    os_destination: Option<String>,
    request_time: i64,
    retry_count: i64,
    ad_id_permission: bool,
    platform_ad_id: Option<String>,
    debug_key_allowed: bool,
}

impl TryFrom<PendingRegistrationRow> for PendingRegistration {
    type Error = DatastoreError;

    fn try_from(row: PendingRegistrationRow) -> Result<Self, Self::Error> {
        let kind: RegistrationKind = serde_json::from_value(row.kind)
            .map_err(|e| DatastoreError::invalid_stored_value("kind", e.to_string()))?;
        Ok(PendingRegistration {
            id: row.id,
            registration_uri: row.registration_uri,
            registration_id: row.registration_id,
            kind,
            registrant: row.registrant,
            top_origin: row.top_origin,
            verified_destination: row.verified_destination,
            web_destination: row.web_destination,
            os_destination: row.os_destination,
            request_time: row.request_time,
            retry_count: row.retry_count,
            ad_id_permission: row.ad_id_permission,
            platform_ad_id: row.platform_ad_id,
            debug_key_allowed: row.debug_key_allowed,
        })
    }
}

/// LIKE pattern matching subdomain origins of a web publisher site,
/// or empty for app publishers so the clause collapses to exact equality.
fn web_publisher_pattern(publisher: &str, publisher_type: SurfaceType) -> String {
    if publisher_type != SurfaceType::Web {
        return String::new();
    }
    match Url::parse(publisher) {
        Ok(url) => match url.host_str() {
            Some(host) => format!("{}://%.{}", url.scheme(), host),
            None => String::new(),
        },
        Err(_) => String::new(),
    }
}

#[async_trait]
impl MeasurementDao for PgTransactionDao {
    async fn fetch_next_queued_registration(
        &mut self,
        retry_limit: i64,
        excluded_origins: &[String],
    ) -> DatastoreResult<Option<PendingRegistration>> {
        let query = r#"
            SELECT id, registration_uri, registration_id, kind, registrant, top_origin,
                   verified_destination, web_destination, os_destination, request_time,
                   retry_count, ad_id_permission, platform_ad_id, debug_key_allowed
            FROM pending_registrations
            WHERE retry_count < $1
              AND NOT (registration_origin = ANY($2))
            ORDER BY request_time ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        "#;
        let tx = self.tx()?;
        let row = sqlx::query_as::<_, PendingRegistrationRow>(query)
            .bind(retry_limit)
            .bind(excluded_origins.to_vec())
            .fetch_optional(&mut **tx)
            .await?;
        row.map(PendingRegistration::try_from).transpose()
    }

    async fn insert_pending_registration(
        &mut self,
        registration: &PendingRegistration,
    ) -> DatastoreResult<()> {
        let query = r#"
            INSERT INTO pending_registrations
                (id, registration_uri, registration_origin, registration_id, kind,
                 registrant, top_origin, verified_destination, web_destination,
                 os_destination, request_time, retry_count, ad_id_permission,
                 platform_ad_id, debug_key_allowed)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#;
        let origin = base_origin(&registration.registration_uri)
            .unwrap_or_else(|| registration.registration_uri.clone());
        let kind = serde_json::to_value(&registration.kind)?;
        let tx = self.tx()?;
        sqlx::query(query)
            .bind(registration.id)
            .bind(&registration.registration_uri)
            .bind(origin)
            .bind(registration.registration_id)
            .bind(kind)
            .bind(&registration.registrant)
            .bind(&registration.top_origin)
            .bind(&registration.verified_destination)
            .bind(&registration.web_destination)
            .bind(&registration.os_destination)
            .bind(registration.request_time)
            .bind(registration.retry_count)
            .bind(registration.ad_id_permission)
            .bind(&registration.platform_ad_id)
            .bind(registration.debug_key_allowed)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn delete_pending_registration(&mut self, id: Uuid) -> DatastoreResult<()> {
        let tx = self.tx()?;
        let result = sqlx::query("DELETE FROM pending_registrations WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatastoreError::database(format!(
                "pending registration {id} not found"
            )));
        }
        Ok(())
    }

    async fn update_retry_count(&mut self, id: Uuid, retry_count: i64) -> DatastoreResult<()> {
        let tx = self.tx()?;
        let result =
            sqlx::query("UPDATE pending_registrations SET retry_count = $2 WHERE id = $1")
                .bind(id)
                .bind(retry_count)
                .execute(&mut **tx)
                .await?;
        if result.rows_affected() == 0 {
            return Err(DatastoreError::database(format!(
                "pending registration {id} not found"
            )));
        }
        Ok(())
    }

    async fn get_key_value_data(
        &mut self,
        data_type: KeyValueDataType,
        key: &str,
    ) -> DatastoreResult<KeyValueData> {
        let tx = self.tx()?;
        let value: Option<Option<String>> =
            sqlx::query_scalar("SELECT value FROM key_value_data WHERE data_type = $1 AND key = $2")
                .bind(data_type.to_string())
                .bind(key)
                .fetch_optional(&mut **tx)
                .await?;
        Ok(KeyValueData {
            data_type,
            key: key.to_string(),
            value: value.flatten(),
        })
    }

    async fn upsert_key_value_data(&mut self, data: &KeyValueData) -> DatastoreResult<()> {
        let query = r#"
            INSERT INTO key_value_data (data_type, key, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (data_type, key) DO UPDATE SET value = EXCLUDED.value
        "#;
        let tx = self.tx()?;
        sqlx::query(query)
            .bind(data.data_type.to_string())
            .bind(&data.key)
            .bind(&data.value)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn insert_source(&mut self, source: &Source) -> DatastoreResult<()> {
        let query = r#"
            INSERT INTO sources
                (id, app_destinations, web_destinations, enrollment_id, publisher,
                 publisher_type, registrant, event_id, priority, event_time, expiry_time,
                 event_report_window, aggregatable_report_window, install_attribution_window,
                 post_install_exclusivity_window, source_type, status, attribution_mode,
                 debug_key, debug_reporting, ad_id_permission, debug_key_allowed,
                 debug_join_key, debug_ad_id, platform_ad_id, filter_data, aggregation_keys,
                 shared_aggregation_keys, coarse_event_report_destinations,
                 registration_origin, registration_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31)
        "#;
        let tx = self.tx()?;
        sqlx::query(query)
            .bind(source.id)
            .bind(&source.app_destinations)
            .bind(&source.web_destinations)
            .bind(&source.enrollment_id)
            .bind(&source.publisher)
            .bind(source.publisher_type.to_string())
            .bind(&source.registrant)
            .bind(source.event_id as i64)
            .bind(source.priority)
            .bind(source.event_time)
            .bind(source.expiry_time)
            .bind(source.event_report_window)
            .bind(source.aggregatable_report_window)
            .bind(source.install_attribution_window)
            .bind(source.post_install_exclusivity_window)
            .bind(source.source_type.to_string())
            .bind(source.status.to_string())
            .bind(source.attribution_mode.to_string())
            .bind(source.debug_key.map(|k| k as i64))
            .bind(source.debug_reporting)
            .bind(source.ad_id_permission)
            .bind(source.debug_key_allowed)
            .bind(&source.debug_join_key)
            .bind(&source.debug_ad_id)
            .bind(&source.platform_ad_id)
            .bind(&source.filter_data)
            .bind(&source.aggregation_keys)
            .bind(&source.shared_aggregation_keys)
            .bind(source.coarse_event_report_destinations)
            .bind(&source.registration_origin)
            .bind(source.registration_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn insert_trigger(&mut self, trigger: &Trigger) -> DatastoreResult<()> {
        let query = r#"
            INSERT INTO triggers
                (id, attribution_destination, destination_type, enrollment_id, registrant,
                 trigger_time, status, event_triggers, aggregatable_trigger_data,
                 aggregatable_values, aggregatable_deduplication_keys, filters, not_filters,
                 debug_key, debug_reporting, ad_id_permission, debug_key_allowed,
                 debug_join_key, debug_ad_id, platform_ad_id, registration_origin,
                 registration_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22)
        "#;
        let tx = self.tx()?;
        sqlx::query(query)
            .bind(trigger.id)
            .bind(&trigger.attribution_destination)
            .bind(trigger.destination_type.to_string())
            .bind(&trigger.enrollment_id)
            .bind(&trigger.registrant)
            .bind(trigger.trigger_time)
            .bind(trigger.status.to_string())
            .bind(&trigger.event_triggers)
            .bind(&trigger.aggregatable_trigger_data)
            .bind(&trigger.aggregatable_values)
            .bind(&trigger.aggregatable_deduplication_keys)
            .bind(&trigger.filters)
            .bind(&trigger.not_filters)
            .bind(trigger.debug_key.map(|k| k as i64))
            .bind(trigger.debug_reporting)
            .bind(trigger.ad_id_permission)
            .bind(trigger.debug_key_allowed)
            .bind(&trigger.debug_join_key)
            .bind(&trigger.debug_ad_id)
            .bind(&trigger.platform_ad_id)
            .bind(&trigger.registration_origin)
            .bind(trigger.registration_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn insert_event_report(&mut self, report: &EventReport) -> DatastoreResult<()> {
        let query = r#"
            INSERT INTO event_reports
                (id, source_id, source_event_id, trigger_data, trigger_priority,
                 trigger_dedup_key, trigger_time, report_time, attribution_destinations,
                 enrollment_id, source_type, randomized_trigger_rate, registration_origin,
                 status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#;
        let tx = self.tx()?;
        sqlx::query(query)
            .bind(report.id)
            .bind(report.source_id)
            .bind(report.source_event_id as i64)
            .bind(report.trigger_data as i64)
            .bind(report.trigger_priority)
            .bind(report.trigger_dedup_key.map(|k| k as i64))
            .bind(report.trigger_time)
            .bind(report.report_time)
            .bind(&report.attribution_destinations)
            .bind(&report.enrollment_id)
            .bind(report.source_type.to_string())
            .bind(report.randomized_trigger_rate)
            .bind(&report.registration_origin)
            .bind(report.status.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn insert_attribution(&mut self, attribution: &Attribution) -> DatastoreResult<()> {
        let query = r#"
            INSERT INTO attributions
                (id, source_site, source_origin, destination_site, destination_origin,
                 enrollment_id, trigger_time, registrant, source_id, trigger_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#;
        let tx = self.tx()?;
        sqlx::query(query)
            .bind(attribution.id)
            .bind(&attribution.source_site)
            .bind(&attribution.source_origin)
            .bind(&attribution.destination_site)
            .bind(&attribution.destination_origin)
            .bind(&attribution.enrollment_id)
            .bind(attribution.trigger_time)
            .bind(&attribution.registrant)
            .bind(attribution.source_id)
            .bind(attribution.trigger_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn count_sources_per_publisher(
        &mut self,
        publisher: &str,
        publisher_type: SurfaceType,
    ) -> DatastoreResult<i64> {
        let query = r#"
            SELECT COUNT(*) FROM sources
            WHERE status = 'active'
              AND (publisher = $1 OR ($2 <> '' AND publisher LIKE $2))
        "#;
        let pattern = web_publisher_pattern(publisher, publisher_type);
        let tx = self.tx()?;
        let count: i64 = sqlx::query_scalar(query)
            .bind(publisher)
            .bind(pattern)
            .fetch_one(&mut **tx)
            .await?;
        Ok(count)
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
        let query = r#"
            SELECT COUNT(*) FROM sources
            WHERE registration_origin <> $1
              AND (publisher = $2 OR ($3 <> '' AND publisher LIKE $3))
              AND enrollment_id = $4
              AND event_time >= $5 AND event_time <= $6
        "#;
        let pattern = web_publisher_pattern(publisher, publisher_type);
        let tx = self.tx()?;
        let count: i64 = sqlx::query_scalar(query)
            .bind(registration_origin)
            .bind(publisher)
            .bind(pattern)
            .bind(enrollment_id)
            .bind(event_time - origin_update_window_ms)
            .bind(event_time)
            .fetch_one(&mut **tx)
            .await?;
        Ok(count)
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
        let query = r#"
            SELECT COUNT(DISTINCT d.destination) FROM (
                SELECT unnest(CASE WHEN $1 = 'app' THEN app_destinations
                                   ELSE web_destinations END) AS destination
                FROM sources
                WHERE status = 'active'
                  AND enrollment_id = $2
                  AND event_time >= $3 AND event_time <= $4
                  AND (publisher = $5 OR ($6 <> '' AND publisher LIKE $6))
            ) d
            WHERE NOT (d.destination = ANY($7))
        "#;
        let pattern = web_publisher_pattern(publisher, publisher_type);
        let tx = self.tx()?;
        let count: i64 = sqlx::query_scalar(query)
            .bind(destination_type.to_string())
            .bind(enrollment_id)
            .bind(window_start)
            .bind(window_end)
            .bind(publisher)
            .bind(pattern)
            .bind(excluded_destinations.to_vec())
            .fetch_one(&mut **tx)
            .await?;
        Ok(count)
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
        let query = r#"
            SELECT COUNT(DISTINCT enrollment_id) FROM sources
            WHERE enrollment_id <> $1
              AND event_time >= $2 AND event_time <= $3
              AND (publisher = $4 OR ($5 <> '' AND publisher LIKE $5))
              AND (app_destinations && $6 OR web_destinations && $6)
        "#;
        let pattern = web_publisher_pattern(publisher, publisher_type);
        let tx = self.tx()?;
        let count: i64 = sqlx::query_scalar(query)
            .bind(excluded_enrollment_id)
            .bind(window_start)
            .bind(window_end)
            .bind(publisher)
            .bind(pattern)
            .bind(destinations.to_vec())
            .fetch_one(&mut **tx)
            .await?;
        Ok(count)
    }

    async fn count_triggers_per_destination(
        &mut self,
        destination: &str,
        destination_type: SurfaceType,
    ) -> DatastoreResult<i64> {
        // App destinations match the base URI and anything under its path;
        // web destinations additionally match subdomain origins of the site.
        let count: i64 = match destination_type {
            SurfaceType::App => {
                let query = r#"
                    SELECT COUNT(*) FROM triggers
                    WHERE destination_type = 'app'
                      AND (attribution_destination = $1 OR attribution_destination LIKE $2)
                "#;
                let tx = self.tx()?;
                sqlx::query_scalar(query)
                    .bind(destination)
                    .bind(format!("{destination}/%"))
                    .fetch_one(&mut **tx)
                    .await?
            }
            SurfaceType::Web => {
                let query = r#"
                    SELECT COUNT(*) FROM triggers
                    WHERE destination_type = 'web'
                      AND (attribution_destination = $1
                        OR attribution_destination LIKE $2
                        OR attribution_destination LIKE $3
                        OR attribution_destination LIKE $4)
                "#;
                let (subdomains, subdomain_paths) = match Url::parse(destination) {
                    Ok(url) => match url.host_str() {
                        Some(host) => (
                            format!("{}://%.{}", url.scheme(), host),
                            format!("{}://%.{}/%", url.scheme(), host),
                        ),
                        None => (destination.to_string(), destination.to_string()),
                    },
                    Err(_) => (destination.to_string(), destination.to_string()),
                };
                let tx = self.tx()?;
                sqlx::query_scalar(query)
                    .bind(destination)
                    .bind(format!("{destination}/%"))
                    .bind(subdomains)
                    .bind(subdomain_paths)
                    .fetch_one(&mut **tx)
                    .await?
            }
        };
        Ok(count)
    }

    async fn commit(&mut self) -> DatastoreResult<()> {
        let tx = self.tx.take().ok_or(DatastoreError::TransactionClosed)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> DatastoreResult<()> {
        let tx = self.tx.take().ok_or(DatastoreError::TransactionClosed)?;
        tx.rollback().await?;
        Ok(())
    }
}
