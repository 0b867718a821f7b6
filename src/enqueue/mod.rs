//! Registration intake: turns a caller's request into queued work.
//!
//! Each request becomes one [`PendingRegistration`] row per target URI,
//! written in a single transaction and sharing a freshly generated
//! registration-group id. Web requests fan their destination hints out to
//! every row in the group. After the commit a work-pending notification is
//! fired so an external scheduler picks the rows up.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::datastore::Datastore;
use crate::error::{PipelineError, Result};
use crate::models::{PendingRegistration, RegistrationKind, SourceType};
use crate::services::{Notifier, PENDING_REGISTRATION_URI};

/// App-context source registration: one reporting origin URI.
#[derive(Debug, Clone)]
pub struct AppSourceRequest {
    pub registration_uri: String,
    /// `android-app://` origin of the calling package; doubles as the
    /// registration's top origin.
    pub registrant: String,
    pub source_type: SourceType,
    /// Epoch milliseconds at which the caller issued the request.
    pub request_time: i64,
    pub ad_id_permission: bool,
    pub platform_ad_id: Option<String>,
}

/// App-context trigger registration: one reporting origin URI.
#[derive(Debug, Clone)]
pub struct AppTriggerRequest {
    pub registration_uri: String,
    pub registrant: String,
    pub request_time: i64,
    pub ad_id_permission: bool,
    pub platform_ad_id: Option<String>,
}

/// One reporting origin within a web request, with its per-origin debug
/// opt-in.
#[derive(Debug, Clone)]
pub struct WebRegistrationParams {
    pub registration_uri: String,
    pub debug_key_allowed: bool,
}

/// Web-context source registration: a browser forwards one or more
/// reporting origins plus destination hints shared by all of them.
#[derive(Debug, Clone)]
pub struct WebSourceRequest {
    pub params: Vec<WebRegistrationParams>,
    pub registrant: String,
    /// The page origin the registration happened on.
    pub top_origin: String,
    pub source_type: SourceType,
    pub request_time: i64,
    pub ad_id_permission: bool,
    pub platform_ad_id: Option<String>,
    pub web_destination: Option<String>,
    pub os_destination: Option<String>,
    pub verified_destination: Option<String>,
}

/// Web-context trigger registration.
#[derive(Debug, Clone)]
pub struct WebTriggerRequest {
    pub params: Vec<WebRegistrationParams>,
    pub registrant: String,
    pub top_origin: String,
    pub request_time: i64,
    pub ad_id_permission: bool,
    pub platform_ad_id: Option<String>,
}

/// Writes registration requests into the pending queue.
pub struct RegistrationEnqueuer {
    datastore: Arc<dyn Datastore>,
    notifier: Arc<dyn Notifier>,
}

impl RegistrationEnqueuer {
    pub fn new(datastore: Arc<dyn Datastore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            datastore,
            notifier,
        }
    }

    /// Enqueue an app source registration. Returns the group id shared by
    /// the row and any redirect children it later spawns.
    pub async fn enqueue_app_source(&self, request: AppSourceRequest) -> Result<Uuid> {
        let group_id = Uuid::new_v4();
        let row = PendingRegistration {
            id: Uuid::new_v4(),
            registration_uri: request.registration_uri,
            registration_id: group_id,
            kind: RegistrationKind::AppSource {
                source_type: request.source_type,
            },
            registrant: request.registrant.clone(),
            top_origin: request.registrant,
            verified_destination: None,
            web_destination: None,
            os_destination: None,
            request_time: request.request_time,
            retry_count: 0,
            ad_id_permission: request.ad_id_permission,
            platform_ad_id: gated_ad_id(request.ad_id_permission, request.platform_ad_id),
            debug_key_allowed: false,
        };
        self.insert_group(vec![row], group_id).await
    }

    /// Enqueue an app trigger registration.
    pub async fn enqueue_app_trigger(&self, request: AppTriggerRequest) -> Result<Uuid> {
        let group_id = Uuid::new_v4();
        let row = PendingRegistration {
            id: Uuid::new_v4(),
            registration_uri: request.registration_uri,
            registration_id: group_id,
            kind: RegistrationKind::AppTrigger,
            registrant: request.registrant.clone(),
            top_origin: request.registrant,
            verified_destination: None,
            web_destination: None,
            os_destination: None,
            request_time: request.request_time,
            retry_count: 0,
            ad_id_permission: request.ad_id_permission,
            platform_ad_id: gated_ad_id(request.ad_id_permission, request.platform_ad_id),
            debug_key_allowed: false,
        };
        self.insert_group(vec![row], group_id).await
    }

    /// Enqueue a web source registration: one row per reporting origin, all
    /// sharing the group id and the request's destination hints.
    pub async fn enqueue_web_source(&self, request: WebSourceRequest) -> Result<Uuid> {
        if request.params.is_empty() {
            return Err(PipelineError::invalid_request(
                "web source registration carries no reporting origins",
            ));
        }
        let group_id = Uuid::new_v4();
        let platform_ad_id = gated_ad_id(request.ad_id_permission, request.platform_ad_id);
        let rows = request
            .params
            .into_iter()
            .map(|params| PendingRegistration {
                id: Uuid::new_v4(),
                registration_uri: params.registration_uri,
                registration_id: group_id,
                kind: RegistrationKind::WebSource {
                    source_type: request.source_type,
                },
                registrant: request.registrant.clone(),
                top_origin: request.top_origin.clone(),
                verified_destination: request.verified_destination.clone(),
                web_destination: request.web_destination.clone(),
                os_destination: request.os_destination.clone(),
                request_time: request.request_time,
                retry_count: 0,
                ad_id_permission: request.ad_id_permission,
                platform_ad_id: platform_ad_id.clone(),
                debug_key_allowed: params.debug_key_allowed,
            })
            .collect();
        self.insert_group(rows, group_id).await
    }

    /// Enqueue a web trigger registration: one row per reporting origin.
    pub async fn enqueue_web_trigger(&self, request: WebTriggerRequest) -> Result<Uuid> {
        if request.params.is_empty() {
            return Err(PipelineError::invalid_request(
                "web trigger registration carries no reporting origins",
            ));
        }
        let group_id = Uuid::new_v4();
        let platform_ad_id = gated_ad_id(request.ad_id_permission, request.platform_ad_id);
        let rows = request
            .params
            .into_iter()
            .map(|params| PendingRegistration {
                id: Uuid::new_v4(),
                registration_uri: params.registration_uri,
                registration_id: group_id,
                kind: RegistrationKind::WebTrigger,
                registrant: request.registrant.clone(),
                top_origin: request.top_origin.clone(),
                verified_destination: None,
                web_destination: None,
                os_destination: None,
                request_time: request.request_time,
                retry_count: 0,
                ad_id_permission: request.ad_id_permission,
                platform_ad_id: platform_ad_id.clone(),
                debug_key_allowed: params.debug_key_allowed,
            })
            .collect();
        self.insert_group(rows, group_id).await
    }

    /// All-or-nothing insert of one registration group, then the
    /// work-pending notification.
    async fn insert_group(
        &self,
        rows: Vec<PendingRegistration>,
        group_id: Uuid,
    ) -> Result<Uuid> {
        let mut dao = self.datastore.begin().await?;
        for row in &rows {
            if let Err(insert_err) = dao.insert_pending_registration(row).await {
                if let Err(rollback_err) = dao.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed enqueue insert failed");
                }
                return Err(insert_err.into());
            }
        }
        dao.commit().await?;
        debug!(
            group_id = %group_id,
            rows = rows.len(),
            "Registration group enqueued"
        );
        self.notifier.notify(PENDING_REGISTRATION_URI).await;
        Ok(group_id)
    }
}

fn gated_ad_id(ad_id_permission: bool, platform_ad_id: Option<String>) -> Option<String> {
    if ad_id_permission {
        platform_ad_id
    } else {
        None
    }
}
