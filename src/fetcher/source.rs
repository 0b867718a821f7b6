//! Source registration fetcher.
//!
//! Drives the network exchange for a pending source registration and turns
//! the `Attribution-Reporting-Register-Source` response header into a
//! [`Source`]. Parsing is deliberately lenient where the original request
//! can survive (bad event ids fall back to zero, bad debug keys are
//! dropped) and strict where the entity would be meaningless (no
//! destination, malformed JSON, destination limits exceeded).

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::config::{DebugConfig, LimitsConfig};
use crate::models::{
    AttributionMode, EntityStatus, FetchStatus, PendingRegistration, ResponseStatus, Source,
    SourceStatus, SourceType, SurfaceType,
};
use crate::services::EnrollmentResolver;

use super::{
    execute_registration_request, util, FetchResult, SourceFetch, AD_ID_HEADER,
    REGISTER_SOURCE_HEADER, SOURCE_INFO_HEADER,
};

// Registration JSON field names.
const SOURCE_EVENT_ID: &str = "source_event_id";
const DEBUG_KEY: &str = "debug_key";
const DESTINATION: &str = "destination";
const EXPIRY: &str = "expiry";
const EVENT_REPORT_WINDOW: &str = "event_report_window";
const AGGREGATABLE_REPORT_WINDOW: &str = "aggregatable_report_window";
const PRIORITY: &str = "priority";
const INSTALL_ATTRIBUTION_WINDOW: &str = "install_attribution_window";
const POST_INSTALL_EXCLUSIVITY_WINDOW: &str = "post_install_exclusivity_window";
const FILTER_DATA: &str = "filter_data";
const WEB_DESTINATION: &str = "web_destination";
const AGGREGATION_KEYS: &str = "aggregation_keys";
const SHARED_AGGREGATION_KEYS: &str = "shared_aggregation_keys";
const DEBUG_REPORTING: &str = "debug_reporting";
const DEBUG_JOIN_KEY: &str = "debug_join_key";
const DEBUG_AD_ID: &str = "debug_ad_id";
const COARSE_EVENT_REPORT_DESTINATIONS: &str = "coarse_event_report_destinations";

const ANDROID_APP_SCHEME: &str = "android-app";
const SECONDS_PER_DAY: i64 = 86_400;

pub struct SourceFetcher {
    client: Client,
    limits: LimitsConfig,
    debug: DebugConfig,
    enrollment: Arc<dyn EnrollmentResolver>,
}

impl SourceFetcher {
    pub fn new(
        client: Client,
        limits: LimitsConfig,
        debug: DebugConfig,
        enrollment: Arc<dyn EnrollmentResolver>,
    ) -> Self {
        Self {
            client,
            limits,
            debug,
            enrollment,
        }
    }
}

#[async_trait]
impl SourceFetch for SourceFetcher {
    async fn fetch_source(&self, registration: &PendingRegistration) -> FetchResult<Source> {
        let Some(source_type) = registration.kind.source_type() else {
            // Only a dispatch bug can route a trigger row here; drop it.
            debug!(id = %registration.id, kind = %registration.kind, "not a source registration");
            return FetchResult::failed(ResponseStatus::InvalidUrl);
        };

        let enrollment_id = self
            .enrollment
            .valid_enrollment_id(&registration.registration_uri)
            .await;

        let mut request_headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&source_type.to_string()) {
            request_headers.insert(SOURCE_INFO_HEADER, value);
        }
        if registration.ad_id_permission {
            if let (Some(ad_id), Some(enrollment_id)) =
                (&registration.platform_ad_id, &enrollment_id)
            {
                let hashed = util::hashed_platform_ad_id(ad_id, enrollment_id);
                if let Ok(value) = HeaderValue::from_str(&hashed) {
                    request_headers.insert(AD_ID_HEADER, value);
                }
            }
        }

        let response = execute_registration_request(
            &self.client,
            &registration.registration_uri,
            &request_headers,
        )
        .await;

        let mut status = FetchStatus::new(response.response_status);
        status.response_size = response.response_size;
        let redirects = response.redirects;

        if !status.is_request_success() {
            return FetchResult {
                entity: None,
                status,
                redirects,
            };
        }

        let Some(enrollment_id) = enrollment_id else {
            debug!(
                uri = %registration.registration_uri,
                "no valid enrollment for registration origin"
            );
            status.entity_status = EntityStatus::InvalidEnrollment;
            return FetchResult {
                entity: None,
                status,
                redirects,
            };
        };

        let register_values: Vec<_> = response
            .headers
            .get_all(REGISTER_SOURCE_HEADER)
            .iter()
            .collect();
        if register_values.is_empty() {
            status.entity_status = EntityStatus::HeaderMissing;
            return FetchResult {
                entity: None,
                status,
                redirects,
            };
        }
        let body = if register_values.len() == 1 {
            register_values[0].to_str().ok()
        } else {
            debug!(
                occurrences = register_values.len(),
                "source registration header repeated"
            );
            None
        };
        let Some(body) = body else {
            status.entity_status = EntityStatus::ParsingError;
            return FetchResult {
                entity: None,
                status,
                redirects,
            };
        };

        match parse_source(
            registration,
            source_type,
            &enrollment_id,
            body,
            &self.limits,
            &self.debug,
        ) {
            Ok(source) => {
                status.entity_status = EntityStatus::Success;
                FetchResult {
                    entity: Some(source),
                    status,
                    redirects,
                }
            }
            Err(entity_status) => {
                status.entity_status = entity_status;
                FetchResult {
                    entity: None,
                    status,
                    redirects,
                }
            }
        }
    }
}

/// Parses one source registration body.
///
/// Field handling mirrors the response-header contract: numeric clamps for
/// windows, whole-day rounding for EVENT expiry, destination validation
/// including the caller-supplied destination hints, and enrollment-gated
/// debug fields. Parsing errors cover malformed JSON and wrong value
/// kinds; validation errors cover limit and destination rule violations.
pub fn parse_source(
    registration: &PendingRegistration,
    source_type: SourceType,
    enrollment_id: &str,
    body: &str,
    limits: &LimitsConfig,
    debug: &DebugConfig,
) -> Result<Source, EntityStatus> {
    let json: Value = serde_json::from_str(body).map_err(|_| EntityStatus::ParsingError)?;
    let Value::Object(json) = json else {
        return Err(EntityStatus::ParsingError);
    };

    if util::json_field(&json, DESTINATION).is_none()
        && util::json_field(&json, WEB_DESTINATION).is_none()
    {
        debug!("source registration carries no destination");
        return Err(EntityStatus::ParsingError);
    }

    let event_time = registration.request_time;

    let mut event_id = 0u64;
    if let Some(value) = util::json_field(&json, SOURCE_EVENT_ID) {
        match util::parse_unsigned_long(&util::json_string(value)) {
            Some(parsed) => event_id = parsed,
            None => debug!("unparseable source_event_id, keeping default"),
        }
    }

    let expiry_secs = match util::json_field(&json, EXPIRY) {
        Some(value) => {
            let raw = util::json_long(value).ok_or(EntityStatus::ParsingError)?;
            let clamped = raw.clamp(
                limits.min_source_expiration_secs,
                limits.max_source_expiration_secs,
            );
            if source_type == SourceType::Event {
                round_seconds_to_whole_days(clamped)
            } else {
                clamped
            }
        }
        None => limits.max_source_expiration_secs,
    };
    let expiry_time = event_time + expiry_secs * 1_000;

    let event_report_window_secs = match util::json_field(&json, EVENT_REPORT_WINDOW) {
        Some(value) => {
            let raw = util::json_long(value).ok_or(EntityStatus::ParsingError)?;
            expiry_secs.min(raw.clamp(
                limits.min_source_expiration_secs,
                limits.max_source_expiration_secs,
            ))
        }
        None => expiry_secs,
    };
    let event_report_window = event_time + event_report_window_secs * 1_000;

    let aggregatable_report_window_secs = match util::json_field(&json, AGGREGATABLE_REPORT_WINDOW)
    {
        Some(value) => {
            let raw = util::json_long(value).ok_or(EntityStatus::ParsingError)?;
            expiry_secs.min(raw.clamp(
                limits.min_source_expiration_secs,
                limits.max_source_expiration_secs,
            ))
        }
        None => expiry_secs,
    };
    let aggregatable_report_window = event_time + aggregatable_report_window_secs * 1_000;

    let mut priority = 0i64;
    if let Some(value) = util::json_field(&json, PRIORITY) {
        priority = util::json_long(value).ok_or(EntityStatus::ParsingError)?;
    }

    let mut debug_reporting = false;
    if let Some(value) = util::json_field(&json, DEBUG_REPORTING) {
        debug_reporting = util::json_bool(value).unwrap_or(false);
    }

    let mut debug_key = None;
    if let Some(value) = util::json_field(&json, DEBUG_KEY) {
        debug_key = util::parse_unsigned_long(&util::json_string(value));
        if debug_key.is_none() {
            debug!("unparseable debug_key, dropping the field");
        }
    }

    let install_attribution_window = match util::json_field(&json, INSTALL_ATTRIBUTION_WINDOW) {
        Some(value) => util::json_long(value)
            .ok_or(EntityStatus::ParsingError)?
            .clamp(
                limits.min_install_attribution_window_secs,
                limits.max_install_attribution_window_secs,
            ),
        None => limits.max_install_attribution_window_secs,
    } * 1_000;

    let post_install_exclusivity_window =
        match util::json_field(&json, POST_INSTALL_EXCLUSIVITY_WINDOW) {
            Some(value) => util::json_long(value)
                .ok_or(EntityStatus::ParsingError)?
                .clamp(
                    limits.min_post_install_exclusivity_window_secs,
                    limits.max_post_install_exclusivity_window_secs,
                ),
            None => limits.min_post_install_exclusivity_window_secs,
        } * 1_000;

    let mut filter_data = None;
    if let Some(value) = util::json_field(&json, FILTER_DATA) {
        // A single filter map only; an array of maps is not accepted here.
        if !util::is_valid_attribution_filter_map(value, limits) {
            debug!("invalid source filter_data");
            return Err(EntityStatus::ValidationError);
        }
        filter_data = Some(value.clone());
    }

    let mut app_destination_full: Option<String> = None;
    if let Some(value) = util::json_field(&json, DESTINATION) {
        let raw = util::json_string(value);
        let app_uri = match Url::parse(&raw) {
            Ok(url) => {
                if url.scheme() != ANDROID_APP_SCHEME {
                    debug!(scheme = url.scheme(), "invalid scheme for app destination");
                    return Err(EntityStatus::ValidationError);
                }
                url
            }
            Err(_) => {
                debug!("app destination missing scheme, assuming android-app");
                let prefixed = format!("{ANDROID_APP_SCHEME}://{raw}");
                Url::parse(&prefixed).map_err(|_| EntityStatus::ValidationError)?
            }
        };
        app_destination_full = Some(app_uri.to_string());
    }

    let mut debug_ad_id = None;
    if debug.allows_debug_ad_id(enrollment_id) {
        if let Some(value) = util::json_field(&json, DEBUG_AD_ID) {
            debug_ad_id = Some(util::json_string(value));
        }
    }

    let mut debug_join_key = None;
    if debug.allows_debug_join_key(enrollment_id) {
        if let Some(value) = util::json_field(&json, DEBUG_JOIN_KEY) {
            debug_join_key = Some(util::json_string(value));
        }
    }

    if registration.kind.is_web() {
        if let Some(hint) = &registration.os_destination {
            if app_destination_full.as_deref() != Some(hint.as_str()) {
                debug!("os destination hint does not match the registration destination");
                return Err(EntityStatus::ValidationError);
            }
        }
    }

    let mut app_destinations = Vec::new();
    if let Some(full) = &app_destination_full {
        let base = util::base_origin(full).ok_or(EntityStatus::ValidationError)?;
        app_destinations.push(base);
    }

    let should_match_web_hint =
        registration.kind.is_web() && registration.web_destination.is_some();
    let mut matched_web_hint = false;
    let mut web_destinations: Vec<String> = Vec::new();
    if let Some(value) = util::json_field(&json, WEB_DESTINATION) {
        let raw_destinations: Vec<String> = match value {
            Value::String(single) => vec![single.clone()],
            Value::Array(entries) => entries.iter().map(util::json_string).collect(),
            _ => return Err(EntityStatus::ParsingError),
        };
        if raw_destinations.len() > limits.max_web_destinations_per_source_registration {
            debug!(
                count = raw_destinations.len(),
                "too many web destinations in source registration"
            );
            return Err(EntityStatus::ValidationError);
        }
        for raw in &raw_destinations {
            if should_match_web_hint
                && registration.web_destination.as_deref() == Some(raw.as_str())
            {
                matched_web_hint = true;
            }
            let Some(reduced) = util::top_private_domain_and_scheme(raw) else {
                debug!(destination = %raw, "web destination has no registrable domain");
                return Err(EntityStatus::ValidationError);
            };
            if !web_destinations.contains(&reduced) {
                web_destinations.push(reduced);
            }
        }
    }

    let mut coarse_event_report_destinations = false;
    if debug.enable_coarse_event_report_destinations {
        if let Some(value) = util::json_field(&json, COARSE_EVENT_REPORT_DESTINATIONS) {
            coarse_event_report_destinations =
                util::json_bool(value).ok_or(EntityStatus::ParsingError)?;
        }
    }

    if should_match_web_hint && !matched_web_hint {
        debug!("no web destination matched the request hint");
        return Err(EntityStatus::ValidationError);
    }

    let mut aggregation_keys = None;
    if let Some(value) = util::json_field(&json, AGGREGATION_KEYS) {
        let Value::Object(keys) = value else {
            return Err(EntityStatus::ParsingError);
        };
        if !are_valid_aggregation_keys(keys, limits) {
            return Err(EntityStatus::ValidationError);
        }
        aggregation_keys = Some(value.clone());
    }

    let mut shared_aggregation_keys = None;
    if debug.enable_shared_aggregation_keys {
        if let Some(value) = util::json_field(&json, SHARED_AGGREGATION_KEYS) {
            let Value::Array(_) = value else {
                return Err(EntityStatus::ParsingError);
            };
            shared_aggregation_keys = Some(value.to_string());
        }
    }

    let registration_origin = util::base_origin(&registration.registration_uri)
        .ok_or(EntityStatus::ParsingError)?;
    let publisher = util::base_origin(&registration.top_origin)
        .unwrap_or_else(|| registration.top_origin.clone());
    let publisher_type = if registration.kind.is_web() {
        SurfaceType::Web
    } else {
        SurfaceType::App
    };

    let platform_ad_id = if registration.ad_id_permission {
        registration
            .platform_ad_id
            .as_ref()
            .map(|ad_id| util::hashed_platform_ad_id(ad_id, enrollment_id))
    } else {
        None
    };

    let source = Source {
        id: Uuid::new_v4(),
        app_destinations,
        web_destinations,
        enrollment_id: enrollment_id.to_string(),
        publisher,
        publisher_type,
        registrant: registration.registrant.clone(),
        event_id,
        priority,
        event_time,
        expiry_time,
        event_report_window,
        aggregatable_report_window,
        install_attribution_window,
        post_install_exclusivity_window,
        source_type,
        status: SourceStatus::Active,
        attribution_mode: AttributionMode::Truthfully,
        debug_key,
        debug_reporting,
        ad_id_permission: registration.ad_id_permission,
        debug_key_allowed: registration.debug_key_allowed,
        debug_join_key,
        debug_ad_id,
        platform_ad_id,
        filter_data,
        aggregation_keys,
        shared_aggregation_keys,
        coarse_event_report_destinations,
        registration_origin,
        registration_id: registration.registration_id,
    };

    if !source.has_destinations() {
        debug!("source parsed without any destination");
        return Err(EntityStatus::ValidationError);
    }

    Ok(source)
}

fn are_valid_aggregation_keys(
    keys: &serde_json::Map<String, Value>,
    limits: &LimitsConfig,
) -> bool {
    if keys.len() > limits.max_aggregate_keys_per_registration {
        debug!(count = keys.len(), "too many aggregation keys");
        return false;
    }
    for (key_id, piece) in keys {
        if !util::is_valid_aggregate_key_id(key_id, limits.max_bytes_per_aggregate_key_id) {
            debug!(key_id, "invalid aggregation key id");
            return false;
        }
        if !util::is_valid_aggregate_key_piece(&util::json_string(piece)) {
            debug!(key_id, "invalid aggregation key piece");
            return false;
        }
    }
    true
}

/// Rounds a duration in seconds to whole days, ties rounding up.
fn round_seconds_to_whole_days(seconds: i64) -> i64 {
    let remainder = seconds % SECONDS_PER_DAY;
    let round_up = remainder >= SECONDS_PER_DAY / 2;
    seconds - remainder + if round_up { SECONDS_PER_DAY } else { 0 }
}
