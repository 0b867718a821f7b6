//! Shared helpers for response classification, redirect extraction, URI
//! normalization and registration field validation.
//!
//! Everything here is pure over parsed inputs so the fetchers and the queue
//! runner can be exercised without sockets.

use reqwest::header::HeaderMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

use crate::config::LimitsConfig;
use crate::models::{RedirectType, Redirects};

/// Header carrying list-type redirect URIs, one URI per occurrence.
pub const REDIRECT_LIST_HEADER: &str = "Attribution-Reporting-Redirect";

/// Standard location header, used for location-type redirects.
pub const REDIRECT_LOCATION_HEADER: &str = "Location";

/// HTTP statuses treated as a completed registration response.
pub fn is_success(status: u16) -> bool {
    (200..=299).contains(&status)
}

/// HTTP statuses treated as a redirect hop worth following once.
pub fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// True when the URI parses and uses a scheme we will open a connection for.
pub fn is_web_scheme(uri: &str) -> bool {
    match Url::parse(uri) {
        Ok(url) => matches!(url.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

/// Collects both redirect flavors from response headers.
///
/// List-type redirects take every occurrence of
/// `Attribution-Reporting-Redirect`; location-type takes the first `Location`
/// value only. Values that are not valid header strings are skipped.
pub fn parse_redirects(headers: &HeaderMap) -> Redirects {
    let mut redirects = Redirects::new();
    for value in headers.get_all(REDIRECT_LIST_HEADER) {
        if let Ok(uri) = value.to_str() {
            redirects.push(RedirectType::List, uri.trim().to_string());
        }
    }
    if let Some(value) = headers.get(REDIRECT_LOCATION_HEADER) {
        if let Ok(uri) = value.to_str() {
            redirects.push(RedirectType::Location, uri.trim().to_string());
        }
    }
    redirects
}

/// Total character length of all response headers, counting each header name
/// once plus every value occurrence.
pub fn header_size(headers: &HeaderMap) -> u64 {
    let mut total: u64 = 0;
    for name in headers.keys() {
        total += name.as_str().len() as u64;
        for value in headers.get_all(name) {
            total += value.as_bytes().len() as u64;
        }
    }
    total
}

/// Strips a URI down to `scheme://host[:port]`, dropping path, query and
/// fragment. Returns `None` when the URI has no host.
///
/// Hand-assembled rather than taken from [`Url::origin`] because custom
/// schemes such as `android-app` are opaque to the origin computation.
pub fn base_origin(uri: &str) -> Option<String> {
    let url = Url::parse(uri).ok()?;
    let host = url.host_str()?;
    match url.port() {
        Some(port) => Some(format!("{}://{}:{}", url.scheme(), host, port)),
        None => Some(format!("{}://{}", url.scheme(), host)),
    }
}

/// Reduces a web URI to `scheme://eTLD+1` using the public suffix list.
///
/// Returns `None` for non-web schemes, URIs without a host, or hosts the
/// suffix list cannot produce a registrable domain for (IP literals,
/// lone suffixes).
pub fn top_private_domain_and_scheme(uri: &str) -> Option<String> {
    let url = Url::parse(uri).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = match url.host() {
        Some(url::Host::Domain(domain)) => domain,
        _ => return None,
    };
    let domain = psl::domain_str(host)?;
    Some(format!("{}://{}", url.scheme(), domain))
}

/// Parses a decimal string as u64, covering the full unsigned range.
pub fn parse_unsigned_long(value: &str) -> Option<u64> {
    value.parse::<u64>().ok()
}

/// Aggregate key identifiers must be non-empty and fit the byte budget.
pub fn is_valid_aggregate_key_id(id: &str, max_bytes: usize) -> bool {
    !id.is_empty() && id.len() <= max_bytes
}

/// Aggregate key pieces are hex strings `0x` through `0x` + 32 digits.
pub fn is_valid_aggregate_key_piece(piece: &str) -> bool {
    if piece.len() < 3 || piece.len() > 34 {
        return false;
    }
    let Some(digits) = piece.strip_prefix("0x").or_else(|| piece.strip_prefix("0X")) else {
        return false;
    };
    digits.chars().all(|c| c.is_ascii_hexdigit())
}

/// Deduplication keys are unsigned 64-bit decimal strings.
pub fn is_valid_aggregate_dedup_key(key: &str) -> bool {
    parse_unsigned_long(key).is_some()
}

/// Validates a filter value: either a single filter map or an array of them.
///
/// A filter map is a JSON object keyed by filter name, each value a JSON
/// array of strings. Limits on map count, key count, string lengths and
/// values per key come from configuration.
pub fn are_valid_attribution_filters(json: &Value, limits: &LimitsConfig) -> bool {
    match json {
        Value::Array(maps) => {
            if maps.len() > limits.max_filter_maps_per_filter_set {
                return false;
            }
            maps.iter().all(|map| is_valid_attribution_filter_map(map, limits))
        }
        Value::Object(_) => is_valid_attribution_filter_map(json, limits),
        _ => false,
    }
}

/// Validates a single filter map. Source filter data must be exactly one
/// map, never an array of them.
pub fn is_valid_attribution_filter_map(json: &Value, limits: &LimitsConfig) -> bool {
    let Value::Object(map) = json else {
        return false;
    };
    if map.len() > limits.max_attribution_filters {
        return false;
    }
    for (key, values) in map {
        if key.len() > limits.max_bytes_per_attribution_filter_string {
            return false;
        }
        let Value::Array(values) = values else {
            return false;
        };
        if values.len() > limits.max_values_per_attribution_filter {
            return false;
        }
        for value in values {
            let Value::String(value) = value else {
                return false;
            };
            if value.len() > limits.max_bytes_per_attribution_filter_string {
                return false;
            }
        }
    }
    true
}

/// Field lookup that treats an explicit JSON `null` as absent.
pub fn json_field<'a>(
    json: &'a serde_json::Map<String, Value>,
    field: &str,
) -> Option<&'a Value> {
    json.get(field).filter(|value| !value.is_null())
}

/// Coerces any non-null JSON scalar to its string form; numbers and
/// booleans read as their literal text.
pub fn json_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Signed 64-bit coercion: numbers truncate toward zero, numeric strings
/// parse through double precision, anything else is `None`.
pub fn json_long(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        Value::String(text) => text.trim().parse::<f64>().ok().map(|float| float as i64),
        _ => None,
    }
}

/// Boolean coercion accepting real booleans and `"true"`/`"false"` strings.
pub fn json_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) if text.eq_ignore_ascii_case("true") => Some(true),
        Value::String(text) if text.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

/// Hashes a device advertising identifier together with the reporting
/// origin's enrollment so distinct registrations cannot be joined on it.
pub fn hashed_platform_ad_id(ad_id: &str, enrollment_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ad_id.as_bytes());
    hasher.update(enrollment_id.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use reqwest::header::{HeaderName, HeaderValue};

    use super::*;

    fn limits() -> LimitsConfig {
        LimitsConfig::default()
    }

    #[test]
    fn test_is_success() {
        assert!(is_success(200));
        assert!(is_success(201));
        assert!(is_success(202));
        assert!(is_success(204));
        assert!(!is_success(404));
        assert!(!is_success(500));
        assert!(!is_success(0));
    }

    #[test]
    fn test_is_redirect() {
        assert!(is_redirect(301));
        assert!(is_redirect(302));
        assert!(is_redirect(303));
        assert!(is_redirect(307));
        assert!(is_redirect(308));
        assert!(!is_redirect(200));
        assert!(!is_redirect(404));
        assert!(!is_redirect(500));
        assert!(!is_redirect(0));
    }

    #[test]
    fn test_is_web_scheme() {
        assert!(is_web_scheme("https://example.com/path"));
        assert!(is_web_scheme("http://example.com"));
        assert!(!is_web_scheme("ftp://example.com"));
        assert!(!is_web_scheme("android-app://com.example"));
        assert!(!is_web_scheme("not a uri"));
    }

    #[test]
    fn test_parse_redirects_both_types() {
        let mut headers = HeaderMap::new();
        headers.append(
            REDIRECT_LIST_HEADER,
            HeaderValue::from_static("https://example.test/1"),
        );
        headers.append(
            REDIRECT_LIST_HEADER,
            HeaderValue::from_static("https://example.test/2"),
        );
        headers.insert(
            REDIRECT_LOCATION_HEADER,
            HeaderValue::from_static("https://example.test/located"),
        );
        let redirects = parse_redirects(&headers);
        assert_eq!(
            redirects.get(RedirectType::List),
            &[
                "https://example.test/1".to_string(),
                "https://example.test/2".to_string()
            ]
        );
        assert_eq!(
            redirects.get(RedirectType::Location),
            &["https://example.test/located".to_string()]
        );
    }

    #[test]
    fn test_parse_redirects_empty_headers() {
        let redirects = parse_redirects(&HeaderMap::new());
        assert!(redirects.is_empty());
    }

    #[test]
    fn test_header_size_counts_keys_once_and_all_values() {
        let mut headers = HeaderMap::new();
        let key1 = HeaderName::from_static("key1");
        let key2 = HeaderName::from_static("key2");
        headers.append(key1.clone(), HeaderValue::from_static("val11"));
        headers.append(key1, HeaderValue::from_static("val12"));
        headers.append(key2.clone(), HeaderValue::from_static("val21"));
        headers.append(key2, HeaderValue::from_static("val22"));
        assert_eq!(header_size(&headers), 28);
    }

    #[test]
    fn test_header_size_empty() {
        assert_eq!(header_size(&HeaderMap::new()), 0);
    }

    #[test]
    fn test_base_origin() {
        assert_eq!(
            base_origin("https://subdomain.example.test/path?q=1").as_deref(),
            Some("https://subdomain.example.test")
        );
        assert_eq!(
            base_origin("https://example.test:8080/path").as_deref(),
            Some("https://example.test:8080")
        );
        assert_eq!(
            base_origin("android-app://com.example.app").as_deref(),
            Some("android-app://com.example.app")
        );
        assert_eq!(base_origin("not a uri"), None);
    }

    #[test]
    fn test_top_private_domain_and_scheme() {
        assert_eq!(
            top_private_domain_and_scheme("https://sub.example.com/path").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            top_private_domain_and_scheme("http://a.b.example.co.uk").as_deref(),
            Some("http://example.co.uk")
        );
        assert_eq!(
            top_private_domain_and_scheme("https://sub.example.test").as_deref(),
            Some("https://example.test")
        );
        assert_eq!(
            top_private_domain_and_scheme("android-app://com.example.app"),
            None
        );
        assert_eq!(top_private_domain_and_scheme("https://127.0.0.1"), None);
        assert_eq!(top_private_domain_and_scheme("https://[::1]/page"), None);
        assert_eq!(top_private_domain_and_scheme("not a uri"), None);
    }

    #[test]
    fn test_parse_unsigned_long() {
        assert_eq!(parse_unsigned_long("0"), Some(0));
        assert_eq!(parse_unsigned_long("987654321"), Some(987654321));
        assert_eq!(
            parse_unsigned_long("18446744073709551615"),
            Some(u64::MAX)
        );
        assert_eq!(parse_unsigned_long("18446744073709551616"), None);
        assert_eq!(parse_unsigned_long("-1"), None);
        assert_eq!(parse_unsigned_long("8l2"), None);
        assert_eq!(parse_unsigned_long(""), None);
    }

    #[test]
    fn test_is_valid_aggregate_key_id() {
        assert!(is_valid_aggregate_key_id("campaignCounts", 25));
        assert!(is_valid_aggregate_key_id("a".repeat(25).as_str(), 25));
        assert!(!is_valid_aggregate_key_id("a".repeat(26).as_str(), 25));
        assert!(!is_valid_aggregate_key_id("", 25));
    }

    #[test]
    fn test_is_valid_aggregate_key_piece() {
        assert!(is_valid_aggregate_key_piece("0x159"));
        assert!(is_valid_aggregate_key_piece("0X159"));
        assert!(is_valid_aggregate_key_piece("0x5"));
        assert!(is_valid_aggregate_key_piece(&format!(
            "0x{}",
            "f".repeat(32)
        )));
        assert!(!is_valid_aggregate_key_piece(&format!(
            "0x{}",
            "f".repeat(33)
        )));
        assert!(!is_valid_aggregate_key_piece("0x"));
        assert!(!is_valid_aggregate_key_piece("159"));
        assert!(!is_valid_aggregate_key_piece("0xg5"));
        assert!(!is_valid_aggregate_key_piece(""));
    }

    #[test]
    fn test_is_valid_aggregate_dedup_key() {
        assert!(is_valid_aggregate_dedup_key("100"));
        assert!(is_valid_aggregate_dedup_key("18446744073709551615"));
        assert!(!is_valid_aggregate_dedup_key("-1"));
        assert!(!is_valid_aggregate_dedup_key("abc"));
    }

    #[test]
    fn test_filters_single_map() {
        let json: Value = serde_json::json!({
            "conversion_subdomain": ["electronics.megastore"],
            "product": ["1234", "2345"],
        });
        assert!(are_valid_attribution_filters(&json, &limits()));
    }

    #[test]
    fn test_filters_list_of_maps() {
        let json: Value = serde_json::json!([
            {"product": ["1234"]},
            {"conversion_subdomain": ["electronics.megastore"]},
        ]);
        assert!(are_valid_attribution_filters(&json, &limits()));
    }

    #[test]
    fn test_filters_too_many_maps() {
        let maps: Vec<Value> = (0..6)
            .map(|i| serde_json::json!({ (i.to_string()): ["x"] }))
            .collect();
        let json = Value::Array(maps);
        assert!(!are_valid_attribution_filters(&json, &limits()));
    }

    #[test]
    fn test_filters_too_many_keys() {
        let mut map = serde_json::Map::new();
        for i in 0..51 {
            map.insert(format!("filter-{i}"), serde_json::json!(["value"]));
        }
        assert!(!are_valid_attribution_filters(&Value::Object(map), &limits()));
    }

    #[test]
    fn test_filters_key_too_long() {
        let long_key = "a".repeat(26);
        let json = serde_json::json!({ (long_key): ["value"] });
        assert!(!are_valid_attribution_filters(&json, &limits()));
    }

    #[test]
    fn test_filters_too_many_values() {
        let values: Vec<String> = (0..51).map(|i| i.to_string()).collect();
        let json = serde_json::json!({ "product": values });
        assert!(!are_valid_attribution_filters(&json, &limits()));
    }

    #[test]
    fn test_filters_value_too_long() {
        let json = serde_json::json!({ "product": ["a".repeat(26)] });
        assert!(!are_valid_attribution_filters(&json, &limits()));
    }

    #[test]
    fn test_filters_value_not_a_string() {
        let json = serde_json::json!({ "product": [1234] });
        assert!(!are_valid_attribution_filters(&json, &limits()));
    }

    #[test]
    fn test_filters_value_not_an_array() {
        let json = serde_json::json!({ "product": "1234" });
        assert!(!are_valid_attribution_filters(&json, &limits()));
    }

    #[test]
    fn test_filters_not_an_object() {
        let json = serde_json::json!("product");
        assert!(!are_valid_attribution_filters(&json, &limits()));
    }

    #[test]
    fn test_json_long_coercions() {
        assert_eq!(json_long(&serde_json::json!(42)), Some(42));
        assert_eq!(json_long(&serde_json::json!(-7)), Some(-7));
        assert_eq!(json_long(&serde_json::json!("123")), Some(123));
        assert_eq!(json_long(&serde_json::json!("1.5")), Some(1));
        assert_eq!(json_long(&serde_json::json!(" 9 ")), Some(9));
        assert_eq!(json_long(&serde_json::json!("abc")), None);
        assert_eq!(json_long(&serde_json::json!(["nope"])), None);
    }

    #[test]
    fn test_json_string_coerces_scalars() {
        assert_eq!(json_string(&serde_json::json!("text")), "text");
        assert_eq!(json_string(&serde_json::json!(987654321u64)), "987654321");
        assert_eq!(json_string(&serde_json::json!(true)), "true");
    }

    #[test]
    fn test_json_bool_accepts_strings() {
        assert_eq!(json_bool(&serde_json::json!(true)), Some(true));
        assert_eq!(json_bool(&serde_json::json!("TRUE")), Some(true));
        assert_eq!(json_bool(&serde_json::json!("false")), Some(false));
        assert_eq!(json_bool(&serde_json::json!("yes")), None);
        assert_eq!(json_bool(&serde_json::json!(1)), None);
    }

    #[test]
    fn test_json_field_skips_nulls() {
        let value = serde_json::json!({"present": 1, "missing": null});
        let Value::Object(map) = value else { panic!() };
        assert!(json_field(&map, "present").is_some());
        assert!(json_field(&map, "missing").is_none());
        assert!(json_field(&map, "absent").is_none());
    }

    #[test]
    fn test_hashed_platform_ad_id_is_stable_hex() {
        let first = hashed_platform_ad_id("11111111-2222-3333-4444-555555555555", "enrollment-id");
        let second = hashed_platform_ad_id("11111111-2222-3333-4444-555555555555", "enrollment-id");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        let other = hashed_platform_ad_id("11111111-2222-3333-4444-555555555555", "other");
        assert_ne!(first, other);
    }
}
