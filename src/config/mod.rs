//! # Pipeline Configuration
//!
//! Explicit configuration for the registration pipeline. Every limit the
//! fetchers, admission checks, and queue runner enforce lives here; there is
//! no process-wide flags singleton. Components receive the config struct (or
//! the section they need) at construction time.
//!
//! ## Usage
//!
//! ```rust
//! use attribution_pipeline::config::PipelineConfig;
//!
//! let config = PipelineConfig::default();
//! assert_eq!(config.runner.max_registration_redirects, 20);
//! ```
//!
//! Deployments can override defaults from a file and environment variables
//! via [`PipelineConfig::load`] (`ATTRIBUTION__RUNNER__RETRY_LIMIT=3` style
//! overrides).

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{PipelineError, Result};

/// Root configuration for the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// HTTP fetch behavior
    #[serde(default)]
    pub network: NetworkConfig,

    /// Queue runner batch and retry behavior
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Privacy and system-health limits enforced during parsing and admission
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Debug-reporting gates and feature toggles
    #[serde(default)]
    pub debug: DebugConfig,
}

/// HTTP client settings for the fetchers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connection establishment timeout in milliseconds
    #[serde(default = "NetworkConfig::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Full-request timeout in milliseconds
    #[serde(default = "NetworkConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl NetworkConfig {
    fn default_connect_timeout_ms() -> u64 {
        30_000
    }

    fn default_request_timeout_ms() -> u64 {
        30_000
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            request_timeout_ms: Self::default_request_timeout_ms(),
        }
    }
}

/// Queue runner invocation bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Upper bound on rows processed by one batch-drain invocation
    #[serde(default = "RunnerConfig::default_max_registrations_per_invocation")]
    pub max_registrations_per_invocation: u32,

    /// Rows at or above this retry count are no longer dequeued
    #[serde(default = "RunnerConfig::default_retry_limit")]
    pub retry_limit: i64,

    /// Cap on cumulative redirect-spawned rows per registration group
    #[serde(default = "RunnerConfig::default_max_registration_redirects")]
    pub max_registration_redirects: u32,
}

impl RunnerConfig {
    fn default_max_registrations_per_invocation() -> u32 {
        100
    }

    fn default_retry_limit() -> i64 {
        5
    }

    fn default_max_registration_redirects() -> u32 {
        20
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_registrations_per_invocation: Self::default_max_registrations_per_invocation(),
            retry_limit: Self::default_retry_limit(),
            max_registration_redirects: Self::default_max_registration_redirects(),
        }
    }
}

/// Privacy-parameter and system-health limits. Defaults mirror the platform
/// values the admission checks and field validators were designed around.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_sources_per_publisher: i64,
    pub max_triggers_per_destination: i64,
    pub max_distinct_destinations_in_active_source: i64,
    pub max_distinct_reporting_origins_per_publisher_destination: i64,
    pub min_source_expiration_secs: i64,
    pub max_source_expiration_secs: i64,
    pub min_install_attribution_window_secs: i64,
    pub max_install_attribution_window_secs: i64,
    pub min_post_install_exclusivity_window_secs: i64,
    pub max_post_install_exclusivity_window_secs: i64,
    /// Window behind event time for the distinct-enrollments admission count
    pub rate_limit_window_ms: i64,
    /// Recency window for the one-origin-per-publisher-per-enrollment check
    pub min_reporting_origin_update_window_ms: i64,
    pub max_aggregate_keys_per_registration: usize,
    pub max_attribution_filters: usize,
    pub max_values_per_attribution_filter: usize,
    pub max_filter_maps_per_filter_set: usize,
    pub max_bytes_per_attribution_filter_string: usize,
    pub max_bytes_per_aggregate_key_id: usize,
    pub max_web_destinations_per_source_registration: usize,
    pub max_event_trigger_data: usize,
    pub max_aggregatable_trigger_data: usize,
    pub max_aggregatable_dedup_keys: usize,
    /// Above this header size the metrics record names the offending origin
    pub max_response_header_size_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_sources_per_publisher: 1024,
            max_triggers_per_destination: 1024,
            max_distinct_destinations_in_active_source: 100,
            max_distinct_reporting_origins_per_publisher_destination: 100,
            min_source_expiration_secs: 86_400,
            max_source_expiration_secs: 2_592_000,
            min_install_attribution_window_secs: 86_400,
            max_install_attribution_window_secs: 2_592_000,
            min_post_install_exclusivity_window_secs: 0,
            max_post_install_exclusivity_window_secs: 2_592_000,
            rate_limit_window_ms: 30 * 24 * 60 * 60 * 1000,
            min_reporting_origin_update_window_ms: 24 * 60 * 60 * 1000,
            max_aggregate_keys_per_registration: 50,
            max_attribution_filters: 50,
            max_values_per_attribution_filter: 50,
            max_filter_maps_per_filter_set: 5,
            max_bytes_per_attribution_filter_string: 25,
            max_bytes_per_aggregate_key_id: 25,
            max_web_destinations_per_source_registration: 3,
            max_event_trigger_data: 16,
            max_aggregatable_trigger_data: 50,
            max_aggregatable_dedup_keys: 50,
            max_response_header_size_bytes: 16_384,
        }
    }
}

/// Debug-field gates and flag-guarded parsing features.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Enrollments allowed to carry a debug_join_key; empty disables the field
    pub join_key_enrollment_allowlist: Vec<String>,

    /// Enrollments whose debug_ad_id is dropped; the entry `*` blocks all
    pub ad_id_matching_blocklist: Vec<String>,

    pub enable_coarse_event_report_destinations: bool,

    pub enable_shared_aggregation_keys: bool,
}

impl DebugConfig {
    /// A `*` entry blocks every enrollment regardless of the rest.
    pub fn ad_id_blocklist_matches_all(&self) -> bool {
        self.ad_id_matching_blocklist.iter().any(|entry| entry == "*")
    }

    pub fn allows_debug_ad_id(&self, enrollment_id: &str) -> bool {
        !self.ad_id_blocklist_matches_all()
            && !self
                .ad_id_matching_blocklist
                .iter()
                .any(|entry| entry == enrollment_id)
    }

    pub fn allows_debug_join_key(&self, enrollment_id: &str) -> bool {
        self.join_key_enrollment_allowlist
            .iter()
            .any(|entry| entry == enrollment_id)
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            join_key_enrollment_allowlist: Vec::new(),
            ad_id_matching_blocklist: vec!["*".to_string()],
            enable_coarse_event_report_destinations: true,
            enable_shared_aggregation_keys: false,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from an optional file plus `ATTRIBUTION__*`
    /// environment overrides, falling back to defaults for anything unset.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path));
        }
        let settings = builder
            .add_source(Environment::with_prefix("ATTRIBUTION").separator("__"))
            .build()
            .map_err(|e| PipelineError::configuration(e.to_string()))?;

        let config: PipelineConfig = settings
            .try_deserialize()
            .map_err(|e| PipelineError::configuration(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations whose bounds are inverted or degenerate.
    pub fn validate(&self) -> Result<()> {
        if self.limits.min_source_expiration_secs > self.limits.max_source_expiration_secs {
            return Err(PipelineError::configuration(
                "min_source_expiration_secs exceeds max_source_expiration_secs",
            ));
        }
        if self.limits.min_install_attribution_window_secs
            > self.limits.max_install_attribution_window_secs
        {
            return Err(PipelineError::configuration(
                "min_install_attribution_window_secs exceeds max_install_attribution_window_secs",
            ));
        }
        if self.limits.min_post_install_exclusivity_window_secs
            > self.limits.max_post_install_exclusivity_window_secs
        {
            return Err(PipelineError::configuration(
                "min_post_install_exclusivity_window_secs exceeds max_post_install_exclusivity_window_secs",
            ));
        }
        if self.runner.max_registrations_per_invocation == 0 {
            return Err(PipelineError::configuration(
                "max_registrations_per_invocation must be positive",
            ));
        }
        if self.runner.retry_limit < 1 {
            return Err(PipelineError::configuration("retry_limit must be at least 1"));
        }
        Ok(())
    }
}
