//! Trigger registration fetcher.
//!
//! Counterpart to the source fetcher for the
//! `Attribution-Reporting-Register-Trigger` header. A trigger has no
//! mandatory fields; the structured payloads are normalized during
//! parsing (string-encoded numerics re-emitted, lone filter maps wrapped
//! into single-element sets, unusable numeric fields dropped) and stored
//! in that normalized form.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::config::{DebugConfig, LimitsConfig};
use crate::models::{
    EntityStatus, FetchStatus, PendingRegistration, RegistrationKind, ResponseStatus, SurfaceType,
    Trigger, TriggerStatus,
};
use crate::services::EnrollmentResolver;

use super::{
    execute_registration_request, util, FetchResult, TriggerFetch, AD_ID_HEADER,
    REGISTER_TRIGGER_HEADER,
};

// Registration JSON field names.
const EVENT_TRIGGER_DATA: &str = "event_trigger_data";
const AGGREGATABLE_TRIGGER_DATA: &str = "aggregatable_trigger_data";
const AGGREGATABLE_VALUES: &str = "aggregatable_values";
const AGGREGATABLE_DEDUPLICATION_KEYS: &str = "aggregatable_deduplication_keys";
const FILTERS: &str = "filters";
const NOT_FILTERS: &str = "not_filters";
const DEBUG_KEY: &str = "debug_key";
const DEBUG_REPORTING: &str = "debug_reporting";
const DEBUG_JOIN_KEY: &str = "debug_join_key";
const DEBUG_AD_ID: &str = "debug_ad_id";
const TRIGGER_DATA: &str = "trigger_data";
const PRIORITY: &str = "priority";
const DEDUPLICATION_KEY: &str = "deduplication_key";
const KEY_PIECE: &str = "key_piece";
const SOURCE_KEYS: &str = "source_keys";

pub struct TriggerFetcher {
    client: Client,
    limits: LimitsConfig,
    debug: DebugConfig,
    enrollment: Arc<dyn EnrollmentResolver>,
}

impl TriggerFetcher {
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
impl TriggerFetch for TriggerFetcher {
    async fn fetch_trigger(&self, registration: &PendingRegistration) -> FetchResult<Trigger> {
        if !registration.kind.is_trigger() {
            // Only a dispatch bug can route a source row here; drop it.
            debug!(id = %registration.id, kind = %registration.kind, "not a trigger registration");
            return FetchResult::failed(ResponseStatus::InvalidUrl);
        }

        let enrollment_id = self
            .enrollment
            .valid_enrollment_id(&registration.registration_uri)
            .await;

        let mut request_headers = HeaderMap::new();
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
            .get_all(REGISTER_TRIGGER_HEADER)
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
                "trigger registration header repeated"
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

        match parse_trigger(registration, &enrollment_id, body, &self.limits, &self.debug) {
            Ok(trigger) => {
                status.entity_status = EntityStatus::Success;
                FetchResult {
                    entity: Some(trigger),
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

/// Parses one trigger registration body.
///
/// No field is mandatory. Structured payloads fail the whole fetch when
/// their shape is wrong (parsing error) or a limit is exceeded
/// (validation error); merely unusable numerics inside event trigger
/// data degrade to defaults instead.
pub fn parse_trigger(
    registration: &PendingRegistration,
    enrollment_id: &str,
    body: &str,
    limits: &LimitsConfig,
    debug: &DebugConfig,
) -> Result<Trigger, EntityStatus> {
    let json: Value = serde_json::from_str(body).map_err(|_| EntityStatus::ParsingError)?;
    let Value::Object(json) = json else {
        return Err(EntityStatus::ParsingError);
    };

    let attribution_destination = match registration.kind {
        RegistrationKind::AppTrigger => util::base_origin(&registration.top_origin)
            .unwrap_or_else(|| registration.top_origin.clone()),
        _ => registration.top_origin.clone(),
    };
    let destination_type = if registration.kind.is_web() {
        SurfaceType::Web
    } else {
        SurfaceType::App
    };

    let event_triggers = match util::json_field(&json, EVENT_TRIGGER_DATA) {
        Some(Value::Array(entries)) => get_valid_event_trigger_data(entries, limits)?,
        Some(_) => return Err(EntityStatus::ParsingError),
        None => Value::Array(Vec::new()),
    };

    let mut aggregatable_trigger_data = None;
    if let Some(value) = util::json_field(&json, AGGREGATABLE_TRIGGER_DATA) {
        let Value::Array(entries) = value else {
            return Err(EntityStatus::ParsingError);
        };
        aggregatable_trigger_data = Some(get_valid_aggregatable_trigger_data(entries, limits)?);
    }

    let mut aggregatable_values = None;
    if let Some(value) = util::json_field(&json, AGGREGATABLE_VALUES) {
        let Value::Object(values) = value else {
            return Err(EntityStatus::ParsingError);
        };
        if !is_valid_aggregatable_values(values, limits) {
            return Err(EntityStatus::ValidationError);
        }
        aggregatable_values = Some(value.clone());
    }

    let mut aggregatable_deduplication_keys = None;
    if let Some(value) = util::json_field(&json, AGGREGATABLE_DEDUPLICATION_KEYS) {
        let Value::Array(entries) = value else {
            return Err(EntityStatus::ParsingError);
        };
        aggregatable_deduplication_keys =
            Some(get_valid_aggregatable_deduplication_keys(entries, limits)?);
    }

    let mut filters = None;
    if let Some(value) = util::json_field(&json, FILTERS) {
        let wrapped = maybe_wrap_filters(value).ok_or(EntityStatus::ParsingError)?;
        if !util::are_valid_attribution_filters(&wrapped, limits) {
            debug!("invalid trigger filters");
            return Err(EntityStatus::ValidationError);
        }
        filters = Some(wrapped);
    }

    let mut not_filters = None;
    if let Some(value) = util::json_field(&json, NOT_FILTERS) {
        let wrapped = maybe_wrap_filters(value).ok_or(EntityStatus::ParsingError)?;
        if !util::are_valid_attribution_filters(&wrapped, limits) {
            debug!("invalid trigger not-filters");
            return Err(EntityStatus::ValidationError);
        }
        not_filters = Some(wrapped);
    }

    let mut debug_reporting = false;
    if let Some(value) = util::json_field(&json, DEBUG_REPORTING) {
        debug_reporting = util::json_bool(value).unwrap_or(false);
    }

    let mut debug_key = None;
    if let Some(value) = util::json_field(&json, DEBUG_KEY) {
        debug_key = util::parse_unsigned_long(&util::json_string(value));
        if debug_key.is_none() {
            debug!("unparseable trigger debug_key, dropping the field");
        }
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

    let registration_origin = util::base_origin(&registration.registration_uri)
        .ok_or(EntityStatus::ParsingError)?;

    let platform_ad_id = if registration.ad_id_permission {
        registration
            .platform_ad_id
            .as_ref()
            .map(|ad_id| util::hashed_platform_ad_id(ad_id, enrollment_id))
    } else {
        None
    };

    Ok(Trigger {
        id: Uuid::new_v4(),
        attribution_destination,
        destination_type,
        enrollment_id: enrollment_id.to_string(),
        registrant: registration.registrant.clone(),
        trigger_time: registration.request_time,
        status: TriggerStatus::Pending,
        event_triggers: Some(event_triggers),
        aggregatable_trigger_data,
        aggregatable_values,
        aggregatable_deduplication_keys,
        filters,
        not_filters,
        debug_key,
        debug_reporting,
        ad_id_permission: registration.ad_id_permission,
        debug_key_allowed: registration.debug_key_allowed,
        debug_join_key,
        debug_ad_id,
        platform_ad_id,
        registration_origin,
        registration_id: registration.registration_id,
    })
}

/// A filter field accepts either one filter map or an array of them; a
/// lone map is wrapped into a single-element set. Anything else is `None`.
fn maybe_wrap_filters(value: &Value) -> Option<Value> {
    match value {
        Value::Object(_) => Some(Value::Array(vec![value.clone()])),
        Value::Array(_) => Some(value.clone()),
        _ => None,
    }
}

fn get_valid_event_trigger_data(
    entries: &[Value],
    limits: &LimitsConfig,
) -> Result<Value, EntityStatus> {
    if entries.len() > limits.max_event_trigger_data {
        debug!(count = entries.len(), "too many event trigger data entries");
        return Err(EntityStatus::ValidationError);
    }
    let mut valid = Vec::new();
    for entry in entries {
        if let Some(datum) = normalize_event_trigger_datum(entry, limits)? {
            valid.push(datum);
        }
    }
    Ok(Value::Array(valid))
}

/// Normalizes one event trigger datum. `Ok(None)` means the datum is
/// unusable and silently skipped; an invalid filter set fails the whole
/// registration.
fn normalize_event_trigger_datum(
    entry: &Value,
    limits: &LimitsConfig,
) -> Result<Option<Value>, EntityStatus> {
    let Value::Object(datum) = entry else {
        debug!("event trigger datum is not an object, skipping");
        return Ok(None);
    };

    let mut normalized = serde_json::Map::new();

    let mut trigger_data = 0u64;
    if let Some(value) = util::json_field(datum, TRIGGER_DATA) {
        match util::parse_unsigned_long(&util::json_string(value)) {
            Some(parsed) => trigger_data = parsed,
            None => debug!("unparseable trigger_data, keeping default"),
        }
    }
    normalized.insert(
        TRIGGER_DATA.to_string(),
        Value::String(trigger_data.to_string()),
    );

    if let Some(value) = util::json_field(datum, PRIORITY) {
        match util::json_string(value).parse::<i64>() {
            Ok(parsed) => {
                normalized.insert(PRIORITY.to_string(), Value::String(parsed.to_string()));
            }
            Err(_) => debug!("unparseable event trigger priority, dropping the field"),
        }
    }

    if let Some(value) = util::json_field(datum, DEDUPLICATION_KEY) {
        match util::parse_unsigned_long(&util::json_string(value)) {
            Some(parsed) => {
                normalized.insert(
                    DEDUPLICATION_KEY.to_string(),
                    Value::String(parsed.to_string()),
                );
            }
            None => debug!("unparseable deduplication_key, dropping the field"),
        }
    }

    for field in [FILTERS, NOT_FILTERS] {
        if let Some(value) = util::json_field(datum, field) {
            let Some(wrapped) = maybe_wrap_filters(value) else {
                debug!(field, "event trigger datum filter field malformed, skipping datum");
                return Ok(None);
            };
            if !util::are_valid_attribution_filters(&wrapped, limits) {
                debug!(field, "invalid event trigger datum filters");
                return Err(EntityStatus::ValidationError);
            }
            normalized.insert(field.to_string(), wrapped);
        }
    }

    Ok(Some(Value::Object(normalized)))
}

fn get_valid_aggregatable_trigger_data(
    entries: &[Value],
    limits: &LimitsConfig,
) -> Result<Value, EntityStatus> {
    if entries.len() > limits.max_aggregatable_trigger_data {
        debug!(
            count = entries.len(),
            "too many aggregatable trigger data entries"
        );
        return Err(EntityStatus::ValidationError);
    }
    let mut valid = Vec::new();
    for entry in entries {
        let Value::Object(datum) = entry else {
            return Err(EntityStatus::ParsingError);
        };

        let key_piece = datum
            .get(KEY_PIECE)
            .map(util::json_string)
            .unwrap_or_default();
        if !util::is_valid_aggregate_key_piece(&key_piece) {
            debug!(%key_piece, "invalid aggregatable trigger data key piece");
            return Err(EntityStatus::ValidationError);
        }

        let Some(Value::Array(source_keys)) = datum.get(SOURCE_KEYS) else {
            debug!("aggregatable trigger data source_keys missing or not a list");
            return Err(EntityStatus::ValidationError);
        };
        if source_keys.len() > limits.max_aggregate_keys_per_registration {
            debug!(count = source_keys.len(), "too many source keys");
            return Err(EntityStatus::ValidationError);
        }
        for key in source_keys {
            let key = util::json_string(key);
            if !util::is_valid_aggregate_key_id(&key, limits.max_bytes_per_aggregate_key_id) {
                debug!(%key, "invalid aggregatable trigger data source key");
                return Err(EntityStatus::ValidationError);
            }
        }

        let mut normalized = datum.clone();
        for field in [FILTERS, NOT_FILTERS] {
            if let Some(value) = util::json_field(datum, field) {
                let wrapped = maybe_wrap_filters(value).ok_or(EntityStatus::ParsingError)?;
                if !util::are_valid_attribution_filters(&wrapped, limits) {
                    debug!(field, "invalid aggregatable trigger data filters");
                    return Err(EntityStatus::ValidationError);
                }
                normalized.insert(field.to_string(), wrapped);
            }
        }
        valid.push(Value::Object(normalized));
    }
    Ok(Value::Array(valid))
}

fn is_valid_aggregatable_values(
    values: &serde_json::Map<String, Value>,
    limits: &LimitsConfig,
) -> bool {
    if values.len() > limits.max_aggregate_keys_per_registration {
        debug!(count = values.len(), "too many aggregatable values");
        return false;
    }
    values
        .keys()
        .all(|id| util::is_valid_aggregate_key_id(id, limits.max_bytes_per_aggregate_key_id))
}

fn get_valid_aggregatable_deduplication_keys(
    entries: &[Value],
    limits: &LimitsConfig,
) -> Result<Value, EntityStatus> {
    if entries.len() > limits.max_aggregatable_dedup_keys {
        debug!(
            count = entries.len(),
            "too many aggregatable deduplication keys"
        );
        return Err(EntityStatus::ValidationError);
    }
    let mut valid = Vec::new();
    for entry in entries {
        let Value::Object(datum) = entry else {
            return Err(EntityStatus::ParsingError);
        };
        let mut normalized = serde_json::Map::new();

        if let Some(value) = util::json_field(datum, DEDUPLICATION_KEY) {
            let key = util::json_string(value);
            if util::is_valid_aggregate_dedup_key(&key) {
                normalized.insert(DEDUPLICATION_KEY.to_string(), Value::String(key));
            } else {
                debug!("invalid aggregate deduplication_key, dropping the field");
            }
        }

        for field in [FILTERS, NOT_FILTERS] {
            if let Some(value) = util::json_field(datum, field) {
                let wrapped = maybe_wrap_filters(value).ok_or(EntityStatus::ParsingError)?;
                if !util::are_valid_attribution_filters(&wrapped, limits) {
                    debug!(field, "invalid aggregate deduplication key filters");
                    return Err(EntityStatus::ValidationError);
                }
                normalized.insert(field.to_string(), wrapped);
            }
        }
        valid.push(Value::Object(normalized));
    }
    Ok(Value::Array(valid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TRIGGER_TIME: i64 = 1_700_000_000_000;
    const ENROLLMENT: &str = "enrollment-1";

    fn app_registration() -> PendingRegistration {
        PendingRegistration {
            id: Uuid::new_v4(),
            registration_uri: "https://adtech.test/register/trigger".to_string(),
            registration_id: Uuid::new_v4(),
            kind: RegistrationKind::AppTrigger,
            registrant: "android-app://com.registrant.app".to_string(),
            top_origin: "android-app://com.registrant.app".to_string(),
            verified_destination: None,
            web_destination: None,
            os_destination: None,
            request_time: TRIGGER_TIME,
            retry_count: 0,
            ad_id_permission: false,
            platform_ad_id: None,
            debug_key_allowed: false,
        }
    }

    fn parse(body: &str) -> Result<Trigger, EntityStatus> {
        parse_trigger(
            &app_registration(),
            ENROLLMENT,
            body,
            &LimitsConfig::default(),
            &DebugConfig::default(),
        )
    }

    #[test]
    fn test_empty_registration_is_valid() {
        let trigger = parse("{}").unwrap();
        assert_eq!(trigger.event_triggers, Some(json!([])));
        assert_eq!(trigger.aggregatable_trigger_data, None);
        assert_eq!(trigger.aggregatable_values, None);
        assert_eq!(trigger.filters, None);
        assert_eq!(trigger.debug_key, None);
        assert_eq!(trigger.status, TriggerStatus::Pending);
        assert_eq!(trigger.trigger_time, TRIGGER_TIME);
        assert_eq!(trigger.enrollment_id, ENROLLMENT);
        assert_eq!(trigger.registration_origin, "https://adtech.test");
    }

    #[test]
    fn test_app_attribution_destination_reduced_to_base() {
        let mut registration = app_registration();
        registration.top_origin = "android-app://com.registrant.app/activity".to_string();
        let trigger = parse_trigger(
            &registration,
            ENROLLMENT,
            "{}",
            &LimitsConfig::default(),
            &DebugConfig::default(),
        )
        .unwrap();
        assert_eq!(
            trigger.attribution_destination,
            "android-app://com.registrant.app"
        );
        assert_eq!(trigger.destination_type, SurfaceType::App);
    }

    #[test]
    fn test_web_attribution_destination_kept_as_is() {
        let mut registration = app_registration();
        registration.kind = RegistrationKind::WebTrigger;
        registration.top_origin = "https://shop.example/cart?step=2".to_string();
        let trigger = parse_trigger(
            &registration,
            ENROLLMENT,
            "{}",
            &LimitsConfig::default(),
            &DebugConfig::default(),
        )
        .unwrap();
        assert_eq!(trigger.attribution_destination, "https://shop.example/cart?step=2");
        assert_eq!(trigger.destination_type, SurfaceType::Web);
    }

    #[test]
    fn test_event_trigger_data_normalized() {
        let trigger = parse(
            r#"{"event_trigger_data":[
                {"trigger_data":"5","priority":"101","deduplication_key":"34"}]}"#,
        )
        .unwrap();
        assert_eq!(
            trigger.event_triggers,
            Some(json!([
                {"trigger_data":"5","priority":"101","deduplication_key":"34"}
            ]))
        );
    }

    #[test]
    fn test_event_trigger_datum_defaults_to_zero_trigger_data() {
        let trigger = parse(r#"{"event_trigger_data":[{}]}"#).unwrap();
        assert_eq!(trigger.event_triggers, Some(json!([{"trigger_data":"0"}])));
    }

    #[test]
    fn test_event_trigger_datum_drops_unusable_numerics() {
        let trigger = parse(
            r#"{"event_trigger_data":[
                {"trigger_data":"abc","priority":"1.5","deduplication_key":"-1"}]}"#,
        )
        .unwrap();
        assert_eq!(trigger.event_triggers, Some(json!([{"trigger_data":"0"}])));
    }

    #[test]
    fn test_event_trigger_data_skips_non_object_entries() {
        let trigger =
            parse(r#"{"event_trigger_data":[5,{"trigger_data":"7"},"text"]}"#).unwrap();
        assert_eq!(trigger.event_triggers, Some(json!([{"trigger_data":"7"}])));
    }

    #[test]
    fn test_too_many_event_trigger_data_entries() {
        let entries: Vec<String> = (0..17).map(|i| format!(r#"{{"trigger_data":"{i}"}}"#)).collect();
        let body = format!(r#"{{"event_trigger_data":[{}]}}"#, entries.join(","));
        assert_eq!(parse(&body), Err(EntityStatus::ValidationError));
    }

    #[test]
    fn test_event_trigger_data_must_be_array() {
        assert_eq!(
            parse(r#"{"event_trigger_data":{"trigger_data":"1"}}"#),
            Err(EntityStatus::ParsingError)
        );
    }

    #[test]
    fn test_event_trigger_datum_filters_wrapped() {
        let trigger = parse(
            r#"{"event_trigger_data":[
                {"trigger_data":"2","filters":{"source_type":["navigation"]}}]}"#,
        )
        .unwrap();
        assert_eq!(
            trigger.event_triggers,
            Some(json!([
                {"trigger_data":"2","filters":[{"source_type":["navigation"]}]}
            ]))
        );
    }

    #[test]
    fn test_event_trigger_datum_scalar_filters_skip_datum() {
        let trigger = parse(
            r#"{"event_trigger_data":[
                {"trigger_data":"2","filters":"bogus"},{"trigger_data":"3"}]}"#,
        )
        .unwrap();
        assert_eq!(trigger.event_triggers, Some(json!([{"trigger_data":"3"}])));
    }

    #[test]
    fn test_event_trigger_datum_invalid_filters_fail_registration() {
        // Six filter maps exceed the per-set limit.
        let trigger = parse(
            r#"{"event_trigger_data":[{"filters":[
                {"a":["1"]},{"b":["1"]},{"c":["1"]},{"d":["1"]},{"e":["1"]},{"f":["1"]}]}]}"#,
        );
        assert_eq!(trigger, Err(EntityStatus::ValidationError));
    }

    #[test]
    fn test_aggregatable_trigger_data_validated_and_normalized() {
        let trigger = parse(
            r#"{"aggregatable_trigger_data":[
                {"key_piece":"0x400","source_keys":["campaignCounts"],
                 "filters":{"product":["1234"]}}]}"#,
        )
        .unwrap();
        assert_eq!(
            trigger.aggregatable_trigger_data,
            Some(json!([
                {"key_piece":"0x400","source_keys":["campaignCounts"],
                 "filters":[{"product":["1234"]}]}
            ]))
        );
    }

    #[test]
    fn test_aggregatable_trigger_data_requires_source_keys() {
        assert_eq!(
            parse(r#"{"aggregatable_trigger_data":[{"key_piece":"0x400"}]}"#),
            Err(EntityStatus::ValidationError)
        );
    }

    #[test]
    fn test_aggregatable_trigger_data_rejects_bad_key_piece() {
        assert_eq!(
            parse(r#"{"aggregatable_trigger_data":[{"key_piece":"400","source_keys":[]}]}"#),
            Err(EntityStatus::ValidationError)
        );
    }

    #[test]
    fn test_aggregatable_trigger_data_non_object_entry_is_parsing_error() {
        assert_eq!(
            parse(r#"{"aggregatable_trigger_data":["scalar"]}"#),
            Err(EntityStatus::ParsingError)
        );
    }

    #[test]
    fn test_aggregatable_values_keys_validated() {
        let trigger =
            parse(r#"{"aggregatable_values":{"campaignCounts":32768,"geoValue":1664}}"#).unwrap();
        assert_eq!(
            trigger.aggregatable_values,
            Some(json!({"campaignCounts":32768,"geoValue":1664}))
        );

        let long_key = "k".repeat(26);
        let body = format!(r#"{{"aggregatable_values":{{"{long_key}":1}}}}"#);
        assert_eq!(parse(&body), Err(EntityStatus::ValidationError));

        assert_eq!(
            parse(r#"{"aggregatable_values":[1]}"#),
            Err(EntityStatus::ParsingError)
        );
    }

    #[test]
    fn test_aggregatable_deduplication_keys_normalized() {
        let trigger = parse(
            r#"{"aggregatable_deduplication_keys":[
                {"deduplication_key":"3","filters":{"category":["1"]},"extra":"dropped"}]}"#,
        )
        .unwrap();
        assert_eq!(
            trigger.aggregatable_deduplication_keys,
            Some(json!([
                {"deduplication_key":"3","filters":[{"category":["1"]}]}
            ]))
        );
    }

    #[test]
    fn test_invalid_aggregatable_deduplication_key_dropped_entry_kept() {
        let trigger =
            parse(r#"{"aggregatable_deduplication_keys":[{"deduplication_key":"-9"}]}"#).unwrap();
        assert_eq!(trigger.aggregatable_deduplication_keys, Some(json!([{}])));
    }

    #[test]
    fn test_top_level_filters_wrapped_and_stored() {
        let trigger = parse(r#"{"filters":{"source_type":["navigation"]}}"#).unwrap();
        assert_eq!(trigger.filters, Some(json!([{"source_type":["navigation"]}])));

        let trigger = parse(r#"{"not_filters":[{"a":["1"]},{"b":["2"]}]}"#).unwrap();
        assert_eq!(trigger.not_filters, Some(json!([{"a":["1"]},{"b":["2"]}])));
    }

    #[test]
    fn test_top_level_scalar_filters_are_parsing_error() {
        assert_eq!(parse(r#"{"filters":7}"#), Err(EntityStatus::ParsingError));
        assert_eq!(
            parse(r#"{"not_filters":"x"}"#),
            Err(EntityStatus::ParsingError)
        );
    }

    #[test]
    fn test_debug_key_unsigned_semantics() {
        let trigger = parse(r#"{"debug_key":"18446744073709551615"}"#).unwrap();
        assert_eq!(trigger.debug_key, Some(u64::MAX));

        let trigger = parse(r#"{"debug_key":"-1"}"#).unwrap();
        assert_eq!(trigger.debug_key, None);
    }

    #[test]
    fn test_debug_fields_gated_by_enrollment_lists() {
        let trigger =
            parse(r#"{"debug_ad_id":"ad-1","debug_join_key":"jk-1"}"#).unwrap();
        assert_eq!(trigger.debug_ad_id, None);
        assert_eq!(trigger.debug_join_key, None);

        let debug = DebugConfig {
            ad_id_matching_blocklist: Vec::new(),
            join_key_enrollment_allowlist: vec![ENROLLMENT.to_string()],
            ..DebugConfig::default()
        };
        let trigger = parse_trigger(
            &app_registration(),
            ENROLLMENT,
            r#"{"debug_ad_id":"ad-1","debug_join_key":"jk-1"}"#,
            &LimitsConfig::default(),
            &debug,
        )
        .unwrap();
        assert_eq!(trigger.debug_ad_id.as_deref(), Some("ad-1"));
        assert_eq!(trigger.debug_join_key.as_deref(), Some("jk-1"));
    }

    #[test]
    fn test_debug_reporting_flag() {
        let trigger = parse(r#"{"debug_reporting":"true"}"#).unwrap();
        assert!(trigger.debug_reporting);
        let trigger = parse(r#"{"debug_reporting":"bogus"}"#).unwrap();
        assert!(!trigger.debug_reporting);
    }

    #[test]
    fn test_malformed_body_is_parsing_error() {
        assert_eq!(parse("no json"), Err(EntityStatus::ParsingError));
        assert_eq!(parse(r#"[1,2]"#), Err(EntityStatus::ParsingError));
    }
}
