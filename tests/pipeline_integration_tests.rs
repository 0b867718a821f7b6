//! End-to-end pipeline journeys over the in-memory datastore: enqueue,
//! fetch (scripted, no network), parse, admission, persistence, and
//! redirect fan-out.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use attribution_pipeline::config::PipelineConfig;
use attribution_pipeline::datastore::{Datastore, InMemoryDatastore};
use attribution_pipeline::enqueue::{
    AppSourceRequest, AppTriggerRequest, RegistrationEnqueuer, WebRegistrationParams,
    WebTriggerRequest,
};
use attribution_pipeline::fetcher::source::parse_source;
use attribution_pipeline::fetcher::trigger::parse_trigger;
use attribution_pipeline::fetcher::{FetchResult, SourceFetch, TriggerFetch};
use attribution_pipeline::models::{
    EntityStatus, FetchStatus, KeyValueData, KeyValueDataType, PendingRegistration, RedirectType,
    Redirects, RegistrationKind, ResponseStatus, Source, SourceType, Trigger,
};
use attribution_pipeline::orchestration::QueueRunner;
use attribution_pipeline::services::{
    LoggingDebugReporter, Notifier, TruthfulNoiseAssigner, PENDING_REGISTRATION_URI, TRIGGER_URI,
};

const REQUEST_TIME: i64 = 1_700_000_000_000;
const THIRTY_DAYS_MS: i64 = 2_592_000_000;

/// Pops one canned result per fetch; panics when the script runs dry.
struct ScriptedSourceFetch {
    script: Mutex<VecDeque<FetchResult<Source>>>,
}

impl ScriptedSourceFetch {
    fn new(results: Vec<FetchResult<Source>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
        }
    }
}

#[async_trait]
impl SourceFetch for ScriptedSourceFetch {
    async fn fetch_source(&self, registration: &PendingRegistration) -> FetchResult<Source> {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| panic!("unscripted source fetch for {}", registration.id))
    }
}

/// Parses a fixed response body against whichever registration is being
/// fetched, mirroring a server that answers every request the same way.
struct ParsingSourceFetch {
    body: String,
    redirects: Redirects,
    config: PipelineConfig,
}

impl ParsingSourceFetch {
    fn new(body: &str, redirects: Redirects) -> Self {
        Self {
            body: body.to_string(),
            redirects,
            config: PipelineConfig::default(),
        }
    }
}

#[async_trait]
impl SourceFetch for ParsingSourceFetch {
    async fn fetch_source(&self, registration: &PendingRegistration) -> FetchResult<Source> {
        let source_type = registration.kind.source_type().unwrap_or(SourceType::Event);
        let mut status = FetchStatus::new(ResponseStatus::Success);
        let entity = match parse_source(
            registration,
            source_type,
            "enrollment-journey",
            &self.body,
            &self.config.limits,
            &self.config.debug,
        ) {
            Ok(source) => {
                status.entity_status = EntityStatus::Success;
                Some(source)
            }
            Err(entity_status) => {
                status.entity_status = entity_status;
                None
            }
        };
        FetchResult {
            entity,
            status,
            redirects: self.redirects.clone(),
        }
    }
}

struct ParsingTriggerFetch {
    body: String,
    redirects: Redirects,
    config: PipelineConfig,
}

impl ParsingTriggerFetch {
    fn new(body: &str, redirects: Redirects) -> Self {
        Self {
            body: body.to_string(),
            redirects,
            config: PipelineConfig::default(),
        }
    }
}

#[async_trait]
impl TriggerFetch for ParsingTriggerFetch {
    async fn fetch_trigger(&self, registration: &PendingRegistration) -> FetchResult<Trigger> {
        let mut status = FetchStatus::new(ResponseStatus::Success);
        let entity = match parse_trigger(
            registration,
            "enrollment-journey",
            &self.body,
            &self.config.limits,
            &self.config.debug,
        ) {
            Ok(trigger) => {
                status.entity_status = EntityStatus::Success;
                Some(trigger)
            }
            Err(entity_status) => {
                status.entity_status = entity_status;
                None
            }
        };
        FetchResult {
            entity,
            status,
            redirects: self.redirects.clone(),
        }
    }
}

struct NoSourceFetch;

#[async_trait]
impl SourceFetch for NoSourceFetch {
    async fn fetch_source(&self, registration: &PendingRegistration) -> FetchResult<Source> {
        panic!("no source fetch expected, got {}", registration.id);
    }
}

struct NoTriggerFetch;

#[async_trait]
impl TriggerFetch for NoTriggerFetch {
    async fn fetch_trigger(&self, registration: &PendingRegistration) -> FetchResult<Trigger> {
        panic!("no trigger fetch expected, got {}", registration.id);
    }
}

#[derive(Default)]
struct RecordingNotifier {
    uris: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn notified(&self) -> Vec<String> {
        self.uris.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, uri: &str) {
        self.uris.lock().push(uri.to_string());
    }
}

fn runner(
    datastore: Arc<InMemoryDatastore>,
    source_fetcher: Arc<dyn SourceFetch>,
    trigger_fetcher: Arc<dyn TriggerFetch>,
    notifier: Arc<dyn Notifier>,
) -> QueueRunner {
    QueueRunner::new(
        datastore,
        source_fetcher,
        trigger_fetcher,
        Arc::new(LoggingDebugReporter),
        Arc::new(TruthfulNoiseAssigner),
        notifier,
        &PipelineConfig::default(),
    )
}

fn app_source_row() -> PendingRegistration {
    PendingRegistration {
        id: uuid::Uuid::new_v4(),
        registration_uri: "https://adtech.example/register-source".to_string(),
        registration_id: uuid::Uuid::new_v4(),
        kind: RegistrationKind::AppSource {
            source_type: SourceType::Event,
        },
        registrant: "android-app://com.caller.app".to_string(),
        top_origin: "android-app://com.caller.app".to_string(),
        verified_destination: None,
        web_destination: None,
        os_destination: None,
        request_time: REQUEST_TIME,
        retry_count: 0,
        ad_id_permission: false,
        platform_ad_id: None,
        debug_key_allowed: false,
    }
}

async fn seed_row(datastore: &InMemoryDatastore, row: &PendingRegistration) {
    let mut dao = datastore.begin().await.unwrap();
    dao.insert_pending_registration(row).await.unwrap();
    dao.commit().await.unwrap();
}

async fn seed_redirect_count(datastore: &InMemoryDatastore, group: uuid::Uuid, count: u32) {
    let mut dao = datastore.begin().await.unwrap();
    dao.upsert_key_value_data(&KeyValueData {
        data_type: KeyValueDataType::RegistrationRedirectCount,
        key: group.to_string(),
        value: Some(count.to_string()),
    })
    .await
    .unwrap();
    dao.commit().await.unwrap();
}

fn list_redirects(uris: &[&str]) -> Redirects {
    let mut redirects = Redirects::new();
    for uri in uris {
        redirects.push(RedirectType::List, *uri);
    }
    redirects
}

#[tokio::test]
async fn test_app_source_registration_end_to_end() {
    let datastore = Arc::new(InMemoryDatastore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let enqueuer = RegistrationEnqueuer::new(datastore.clone(), notifier.clone());

    let group = enqueuer
        .enqueue_app_source(AppSourceRequest {
            registration_uri: "https://adtech.example/register-source".to_string(),
            registrant: "android-app://com.caller.app".to_string(),
            source_type: SourceType::Event,
            request_time: REQUEST_TIME,
            ad_id_permission: false,
            platform_ad_id: None,
        })
        .await
        .unwrap();
    assert_eq!(notifier.notified(), vec![PENDING_REGISTRATION_URI.to_string()]);

    let fetcher = ParsingSourceFetch::new(
        r#"{"destination":"android-app://com.myapps","source_event_id":"987654321"}"#,
        Redirects::new(),
    );
    let runner = runner(
        datastore.clone(),
        Arc::new(fetcher),
        Arc::new(NoTriggerFetch),
        notifier.clone(),
    );
    let summary = runner.run_invocation().await.unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.succeeded, 1);
    assert!(datastore.pending_registrations().is_empty());

    let sources = datastore.sources();
    assert_eq!(sources.len(), 1);
    let source = &sources[0];
    assert_eq!(source.app_destinations, vec!["android-app://com.myapps"]);
    assert!(source.web_destinations.is_empty());
    assert_eq!(source.event_id, 987_654_321);
    assert_eq!(source.event_time, REQUEST_TIME);
    assert_eq!(source.expiry_time, REQUEST_TIME + THIRTY_DAYS_MS);
    assert_eq!(source.publisher, "android-app://com.caller.app");
    assert_eq!(source.registration_id, group);
    assert_eq!(source.enrollment_id, "enrollment-journey");
}

#[tokio::test]
async fn test_redirect_chain_saturates_group_budget() {
    let datastore = Arc::new(InMemoryDatastore::new());
    let row = app_source_row();
    seed_row(&datastore, &row).await;
    seed_redirect_count(&datastore, row.registration_id, 15).await;

    let redirect_uris: Vec<String> = (0..10)
        .map(|i| format!("https://hop-{i}.adtech.example/register"))
        .collect();
    let uri_refs: Vec<&str> = redirect_uris.iter().map(String::as_str).collect();
    let fetcher = ParsingSourceFetch::new(
        r#"{"destination":"android-app://com.myapps","source_event_id":"1"}"#,
        list_redirects(&uri_refs),
    );
    let runner = runner(
        datastore.clone(),
        Arc::new(fetcher),
        Arc::new(NoTriggerFetch),
        Arc::new(RecordingNotifier::default()),
    );
    let summary = runner.run_invocation().await.unwrap();

    // 15 existing group members leave room for 5 children; the children
    // themselves then drain with the budget exhausted, spawning nothing.
    assert_eq!(summary.processed, 6);
    assert_eq!(summary.succeeded, 6);
    assert!(datastore.pending_registrations().is_empty());
    assert_eq!(
        datastore.key_value(
            KeyValueDataType::RegistrationRedirectCount,
            &row.registration_id.to_string()
        ),
        Some("20".to_string())
    );
}

#[tokio::test]
async fn test_sibling_rows_share_redirect_budget() {
    let datastore = Arc::new(InMemoryDatastore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let enqueuer = RegistrationEnqueuer::new(datastore.clone(), notifier.clone());

    let group = enqueuer
        .enqueue_web_trigger(WebTriggerRequest {
            params: vec![
                WebRegistrationParams {
                    registration_uri: "https://first.adtech.example/register".to_string(),
                    debug_key_allowed: false,
                },
                WebRegistrationParams {
                    registration_uri: "https://second.adtech.example/register".to_string(),
                    debug_key_allowed: false,
                },
            ],
            registrant: "android-app://com.browser".to_string(),
            top_origin: "https://news.example".to_string(),
            request_time: REQUEST_TIME,
            ad_id_permission: false,
            platform_ad_id: None,
        })
        .await
        .unwrap();

    let fetcher = ParsingTriggerFetch::new(
        "{}",
        list_redirects(&["https://hop.adtech.example/register"]),
    );
    let runner = runner(
        datastore.clone(),
        Arc::new(NoSourceFetch),
        Arc::new(fetcher),
        notifier.clone(),
    );

    // Process exactly the two sibling rows; their children stay queued.
    let mut failed_origins = HashSet::new();
    runner.process_next(&mut failed_origins).await.unwrap().unwrap();
    runner.process_next(&mut failed_origins).await.unwrap().unwrap();

    // Both siblings drew from one shared counter: 1 original + 2 children.
    let remaining = datastore.pending_registrations();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|r| r.registration_id == group));
    assert!(remaining
        .iter()
        .all(|r| r.registration_uri == "https://hop.adtech.example/register"));
    assert_eq!(
        datastore.key_value(
            KeyValueDataType::RegistrationRedirectCount,
            &group.to_string()
        ),
        Some("3".to_string())
    );
    assert_eq!(datastore.triggers().len(), 2);
}

#[tokio::test]
async fn test_transient_failure_retries_on_next_invocation() {
    let datastore = Arc::new(InMemoryDatastore::new());
    let row = app_source_row();
    seed_row(&datastore, &row).await;

    let parsed = parse_source(
        &row,
        SourceType::Event,
        "enrollment-journey",
        r#"{"destination":"android-app://com.myapps","source_event_id":"7"}"#,
        &PipelineConfig::default().limits,
        &PipelineConfig::default().debug,
    )
    .unwrap();
    let mut success = FetchResult {
        entity: Some(parsed),
        status: FetchStatus::new(ResponseStatus::Success),
        redirects: Redirects::new(),
    };
    success.status.entity_status = EntityStatus::Success;
    let fetcher = ScriptedSourceFetch::new(vec![
        FetchResult::failed(ResponseStatus::ServerUnavailable),
        success,
    ]);
    let runner = runner(
        datastore.clone(),
        Arc::new(fetcher),
        Arc::new(NoTriggerFetch),
        Arc::new(RecordingNotifier::default()),
    );

    let first = runner.run_invocation().await.unwrap();
    assert_eq!(first.transient_failures, 1);
    let rows = datastore.pending_registrations();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].retry_count, 1);
    assert!(datastore.sources().is_empty());

    // A fresh invocation no longer excludes the origin.
    let second = runner.run_invocation().await.unwrap();
    assert_eq!(second.succeeded, 1);
    assert!(datastore.pending_registrations().is_empty());
    assert_eq!(datastore.sources().len(), 1);
}

#[tokio::test]
async fn test_rows_out_of_retries_are_left_queued() {
    let datastore = Arc::new(InMemoryDatastore::new());
    let mut row = app_source_row();
    row.retry_count = PipelineConfig::default().runner.retry_limit;
    seed_row(&datastore, &row).await;

    let runner = runner(
        datastore.clone(),
        Arc::new(NoSourceFetch),
        Arc::new(NoTriggerFetch),
        Arc::new(RecordingNotifier::default()),
    );
    let summary = runner.run_invocation().await.unwrap();

    // Exhausted rows are never fetched again but stay in storage.
    assert_eq!(summary.processed, 0);
    assert_eq!(datastore.pending_registrations().len(), 1);
}

#[tokio::test]
async fn test_app_trigger_registration_end_to_end() {
    let datastore = Arc::new(InMemoryDatastore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let enqueuer = RegistrationEnqueuer::new(datastore.clone(), notifier.clone());

    let group = enqueuer
        .enqueue_app_trigger(AppTriggerRequest {
            registration_uri: "https://adtech.example/register-trigger".to_string(),
            registrant: "android-app://com.shop.app".to_string(),
            request_time: REQUEST_TIME,
            ad_id_permission: false,
            platform_ad_id: None,
        })
        .await
        .unwrap();

    let fetcher = ParsingTriggerFetch::new(
        r#"{"event_trigger_data":[{"trigger_data":"5","priority":"123"}]}"#,
        Redirects::new(),
    );
    let runner = runner(
        datastore.clone(),
        Arc::new(NoSourceFetch),
        Arc::new(fetcher),
        notifier.clone(),
    );
    let summary = runner.run_invocation().await.unwrap();

    assert_eq!(summary.succeeded, 1);
    assert!(datastore.pending_registrations().is_empty());
    let triggers = datastore.triggers();
    assert_eq!(triggers.len(), 1);
    let trigger = &triggers[0];
    assert_eq!(trigger.attribution_destination, "android-app://com.shop.app");
    assert_eq!(trigger.trigger_time, REQUEST_TIME);
    assert_eq!(trigger.registration_id, group);
    assert_eq!(
        trigger.event_triggers,
        Some(serde_json::json!([{"trigger_data": "5", "priority": "123"}]))
    );
    // Enqueue wake-up first, then the post-store trigger wake-up.
    assert_eq!(
        notifier.notified(),
        vec![
            PENDING_REGISTRATION_URI.to_string(),
            TRIGGER_URI.to_string()
        ]
    );
}

#[tokio::test]
async fn test_unparseable_response_still_spawns_redirects() {
    let datastore = Arc::new(InMemoryDatastore::new());
    let row = app_source_row();
    seed_row(&datastore, &row).await;

    let fetcher = ParsingSourceFetch::new(
        "not json at all",
        list_redirects(&["https://fallback.adtech.example/register"]),
    );
    let runner = runner(
        datastore.clone(),
        Arc::new(fetcher),
        Arc::new(NoTriggerFetch),
        Arc::new(RecordingNotifier::default()),
    );

    let outcome = runner
        .process_next(&mut HashSet::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome, attribution_pipeline::ItemOutcome::TerminalFailure);
    assert!(datastore.sources().is_empty());
    let rows = datastore.pending_registrations();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].registration_uri,
        "https://fallback.adtech.example/register"
    );
    assert_eq!(rows[0].registration_id, row.registration_id);
}
