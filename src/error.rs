//! # Pipeline Error Types
//!
//! Top-level error type for pipeline operations. Fetch outcomes are states
//! (`FetchStatus`), not errors; this type covers storage, configuration, and
//! infrastructure failures that abort an operation outright.

use thiserror::Error;

use crate::datastore::errors::DatastoreError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Datastore error: {0}")]
    Datastore(#[from] DatastoreError),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("HTTP client error: {message}")]
    HttpClient { message: String },

    #[error("Enrollment lookup error: {message}")]
    Enrollment { message: String },

    #[error("Invalid registration request: {message}")]
    InvalidRequest { message: String },

    #[error("Internal pipeline error: {message}")]
    Internal { message: String },
}

impl PipelineError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an HTTP client error
    pub fn http_client(message: impl Into<String>) -> Self {
        Self::HttpClient {
            message: message.into(),
        }
    }

    /// Create an enrollment lookup error
    pub fn enrollment(message: impl Into<String>) -> Self {
        Self::Enrollment {
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::http_client(err.to_string())
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        PipelineError::configuration(err.to_string())
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
