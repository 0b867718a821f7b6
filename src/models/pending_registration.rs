//! The work-queue item: one outstanding registration fetch.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::source::SourceType;

/// What kind of registration a pending row represents. Source kinds carry
/// the caller's source-type hint; trigger kinds have none, which keeps
/// "a trigger has no source type" a compile-time fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RegistrationKind {
    AppSource { source_type: SourceType },
    AppTrigger,
    WebSource { source_type: SourceType },
    WebTrigger,
}

impl RegistrationKind {
    pub fn is_source(&self) -> bool {
        matches!(self, Self::AppSource { .. } | Self::WebSource { .. })
    }

    pub fn is_trigger(&self) -> bool {
        !self.is_source()
    }

    /// Web registrations resolve publishers through top-private-domain
    /// reduction; app registrations use origins as-is.
    pub fn is_web(&self) -> bool {
        matches!(self, Self::WebSource { .. } | Self::WebTrigger)
    }

    pub fn source_type(&self) -> Option<SourceType> {
        match self {
            Self::AppSource { source_type } | Self::WebSource { source_type } => Some(*source_type),
            Self::AppTrigger | Self::WebTrigger => None,
        }
    }
}

impl fmt::Display for RegistrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AppSource { .. } => write!(f, "app_source"),
            Self::AppTrigger => write!(f, "app_trigger"),
            Self::WebSource { .. } => write!(f, "web_source"),
            Self::WebTrigger => write!(f, "web_trigger"),
        }
    }
}

/// One queued fetch. Created by the enqueue API (one row per registration
/// URI or redirect hop), retried or deleted by the queue runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRegistration {
    pub id: Uuid,
    pub registration_uri: String,
    /// Shared across every row spawned from one caller request or redirect
    /// chain; keys the redirect-count record
    pub registration_id: Uuid,
    pub kind: RegistrationKind,
    pub registrant: String,
    pub top_origin: String,
    pub verified_destination: Option<String>,
    pub web_destination: Option<String>,
    pub os_destination: Option<String>,
    /// Epoch milliseconds at enqueue
    pub request_time: i64,
    pub retry_count: i64,
    pub ad_id_permission: bool,
    pub platform_ad_id: Option<String>,
    pub debug_key_allowed: bool,
}

impl PendingRegistration {
    /// Child row for a discovered redirect: fresh id, zeroed retry count,
    /// same group id and request context, only the URI changes.
    pub fn redirect_child(&self, redirect_uri: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            registration_uri: redirect_uri.into(),
            registration_id: self.registration_id,
            kind: self.kind,
            registrant: self.registrant.clone(),
            top_origin: self.top_origin.clone(),
            verified_destination: self.verified_destination.clone(),
            web_destination: self.web_destination.clone(),
            os_destination: self.os_destination.clone(),
            request_time: self.request_time,
            retry_count: 0,
            ad_id_permission: self.ad_id_permission,
            platform_ad_id: self.platform_ad_id.clone(),
            debug_key_allowed: self.debug_key_allowed,
        }
    }
}
