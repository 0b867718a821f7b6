//! Network fetch layer for attribution registrations.
//!
//! A pending registration is resolved by issuing a POST to its registration
//! URI and reading the response headers. The interesting payload lives
//! entirely in headers: the registration JSON
//! (`Attribution-Reporting-Register-Source` / `-Trigger`), chained
//! registration lists (`Attribution-Reporting-Redirect`) and the standard
//! `Location` header. Redirects are never followed automatically by the
//! HTTP client; this module decides which single extra hop, if any, is
//! worth taking and records the rest for re-enqueueing.

pub mod source;
pub mod trigger;
pub mod util;

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::header::HeaderMap;
use reqwest::Client;
use tracing::debug;

use crate::config::NetworkConfig;
use crate::error::Result;
use crate::models::{
    FetchStatus, PendingRegistration, RedirectType, Redirects, ResponseStatus, Source, Trigger,
};

pub use source::SourceFetcher;
pub use trigger::TriggerFetcher;

/// Response header carrying the source registration JSON.
pub const REGISTER_SOURCE_HEADER: &str = "Attribution-Reporting-Register-Source";
/// Response header carrying the trigger registration JSON.
pub const REGISTER_TRIGGER_HEADER: &str = "Attribution-Reporting-Register-Trigger";
/// Request header telling the ad tech which source surface triggered the
/// registration (`event` or `navigation`).
pub const SOURCE_INFO_HEADER: &str = "Attribution-Reporting-Source-Info";
/// Request header carrying the hashed platform advertising id.
pub const AD_ID_HEADER: &str = "Attribution-Reporting-Ad-Id";

/// Outcome of one fetch attempt: the parsed entity when everything lined
/// up, the full status breakdown either way, and any redirects discovered
/// along the way (populated even when the entity itself failed to parse).
#[derive(Debug, Clone)]
pub struct FetchResult<T> {
    pub entity: Option<T>,
    pub status: FetchStatus,
    pub redirects: Redirects,
}

impl<T> FetchResult<T> {
    /// A fetch that never produced a usable response.
    pub fn failed(response_status: ResponseStatus) -> Self {
        Self {
            entity: None,
            status: FetchStatus::new(response_status),
            redirects: Redirects::new(),
        }
    }
}

/// Fetches and parses source registrations.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SourceFetch: Send + Sync {
    async fn fetch_source(&self, registration: &PendingRegistration) -> FetchResult<Source>;
}

/// Fetches and parses trigger registrations.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TriggerFetch: Send + Sync {
    async fn fetch_trigger(&self, registration: &PendingRegistration) -> FetchResult<Trigger>;
}

/// Builds the HTTP client shared by the fetchers.
///
/// Automatic redirect following is disabled: redirect responses carry
/// registration state of their own and must flow through the redirect
/// accumulator rather than being chased silently.
pub fn build_client(network: &NetworkConfig) -> Result<Client> {
    let client = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_millis(network.connect_timeout_ms))
        .timeout(Duration::from_millis(network.request_timeout_ms))
        .build()?;
    Ok(client)
}

/// Raw result of driving the registration request, before any entity
/// parsing. Headers and status code describe the final hop reached.
#[derive(Debug)]
pub(crate) struct RegistrationResponse {
    pub response_status: ResponseStatus,
    pub status_code: u16,
    pub headers: HeaderMap,
    pub redirects: Redirects,
    pub response_size: u64,
}

impl RegistrationResponse {
    fn unreachable(response_status: ResponseStatus, redirects: Redirects, size: u64) -> Self {
        Self {
            response_status,
            status_code: 0,
            headers: HeaderMap::new(),
            redirects,
            response_size: size,
        }
    }
}

/// Issues the registration POST and resolves at most one `Location` hop.
///
/// List-type redirect headers are only ever recorded. A `Location` on the
/// first response is consumed by following it when it points at a web
/// scheme; a `Location` that cannot be followed (second hop, or a
/// non-web target) is recorded for re-enqueueing instead. Redirect
/// headers from every hop are merged without duplication and the header
/// sizes of all hops are accumulated.
pub(crate) async fn execute_registration_request(
    client: &Client,
    registration_uri: &str,
    request_headers: &HeaderMap,
) -> RegistrationResponse {
    if !util::is_web_scheme(registration_uri) {
        debug!(uri = registration_uri, "registration uri is not fetchable");
        return RegistrationResponse::unreachable(ResponseStatus::InvalidUrl, Redirects::new(), 0);
    }

    let mut redirects = Redirects::new();
    let mut response_size = 0u64;
    let mut uri = registration_uri.to_string();
    let mut hops = 0u8;

    loop {
        let response = match client
            .post(&uri)
            .headers(request_headers.clone())
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                debug!(uri = %uri, %error, "registration request failed");
                return RegistrationResponse::unreachable(
                    ResponseStatus::NetworkError,
                    redirects,
                    response_size,
                );
            }
        };

        let status_code = response.status().as_u16();
        let headers = response.headers().clone();
        response_size += util::header_size(&headers);

        if !util::is_success(status_code) && !util::is_redirect(status_code) {
            debug!(uri = %uri, status_code, "registration endpoint unavailable");
            return RegistrationResponse {
                response_status: ResponseStatus::ServerUnavailable,
                status_code,
                headers,
                redirects,
                response_size,
            };
        }

        let hop_redirects = util::parse_redirects(&headers);
        let location = hop_redirects.get(RedirectType::Location).first().cloned();
        for list_uri in hop_redirects.get(RedirectType::List) {
            redirects.push(RedirectType::List, list_uri.clone());
        }

        if util::is_redirect(status_code) {
            if let Some(location) = location {
                if hops == 0 && util::is_web_scheme(&location) {
                    debug!(uri = %uri, location = %location, "following registration redirect");
                    uri = location;
                    hops += 1;
                    continue;
                }
                redirects.push(RedirectType::Location, location);
            }
        }

        return RegistrationResponse {
            response_status: ResponseStatus::Success,
            status_code,
            headers,
            redirects,
            response_size,
        };
    }
}
