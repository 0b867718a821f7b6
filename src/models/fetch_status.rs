//! Outcome tracking for a single registration fetch attempt.
//!
//! A fetch produces two orthogonal statuses: the transport-level
//! [`ResponseStatus`] (did we reach the server and get a usable response?) and
//! the [`EntityStatus`] (did the response headers yield a valid entity?). The
//! queue runner reads both to pick the retry/delete branch.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport-level outcome of one fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Server responded with a 2xx or recognized redirect code
    Success,
    /// Connection or I/O failure before a response was read
    NetworkError,
    /// Server responded with a non-success, non-redirect code
    ServerUnavailable,
    /// Registration URI failed scheme validation; no network call was made
    InvalidUrl,
}

impl ResponseStatus {
    /// Transient failures are retried by the queue runner.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkError | Self::ServerUnavailable)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::NetworkError => write!(f, "network_error"),
            Self::ServerUnavailable => write!(f, "server_unavailable"),
            Self::InvalidUrl => write!(f, "invalid_url"),
        }
    }
}

/// Parse/validation outcome for the registration entity carried in the
/// response headers. Only meaningful once the response itself succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    /// No entity processing has happened yet
    Unknown,
    Success,
    /// Malformed JSON, duplicated registration header, or unusable mandatory field
    ParsingError,
    /// Well-formed content that violates a structural or privacy limit
    ValidationError,
    /// The registration header was absent entirely
    HeaderMissing,
    /// No enrollment is registered for the reporting origin
    InvalidEnrollment,
    /// Persistence failed after a successful fetch
    StorageError,
}

impl EntityStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Failures that delete the pending row while still honoring any
    /// redirects discovered during the attempt.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            Self::ParsingError | Self::ValidationError | Self::HeaderMissing | Self::InvalidEnrollment
        )
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Success => write!(f, "success"),
            Self::ParsingError => write!(f, "parsing_error"),
            Self::ValidationError => write!(f, "validation_error"),
            Self::HeaderMissing => write!(f, "header_missing"),
            Self::InvalidEnrollment => write!(f, "invalid_enrollment"),
            Self::StorageError => write!(f, "storage_error"),
        }
    }
}

impl Default for EntityStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Result-of-fetch record produced by a fetcher and consumed by the queue
/// runner and the header-metrics emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchStatus {
    pub response_status: ResponseStatus,
    pub entity_status: EntityStatus,
    /// Milliseconds between enqueue (request time) and processing
    pub registration_delay_ms: Option<i64>,
    /// Total response header size in characters (keys plus values)
    pub response_size: u64,
    /// Set when a redirect batch was dropped because the group hit its cap
    pub redirect_error: bool,
}

impl FetchStatus {
    pub fn new(response_status: ResponseStatus) -> Self {
        Self {
            response_status,
            entity_status: EntityStatus::Unknown,
            registration_delay_ms: None,
            response_size: 0,
            redirect_error: false,
        }
    }

    /// The queue runner treats the attempt as delete-eligible only when the
    /// request itself succeeded; transient transport failures keep the row.
    pub fn is_request_success(&self) -> bool {
        self.response_status.is_success()
    }

    pub fn should_retry(&self) -> bool {
        self.response_status.is_retryable()
    }
}
