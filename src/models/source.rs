//! The persisted source entity: one ad impression or click registration,
//! eligible to be matched against later triggers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Whether an origin belongs to the app surface or the web surface.
/// Used for publishers, destinations, and the count queries keyed by them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceType {
    App,
    Web,
}

impl fmt::Display for SurfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::App => write!(f, "app"),
            Self::Web => write!(f, "web"),
        }
    }
}

impl std::str::FromStr for SurfaceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "app" => Ok(Self::App),
            "web" => Ok(Self::Web),
            _ => Err(format!("Invalid surface type: {s}")),
        }
    }
}

/// How the source was registered. EVENT sources get their expiry rounded to
/// whole days; NAVIGATION sources keep the exact clamped value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Event,
    Navigation,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event => write!(f, "event"),
            Self::Navigation => write!(f, "navigation"),
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event" => Ok(Self::Event),
            "navigation" => Ok(Self::Navigation),
            _ => Err(format!("Invalid source type: {s}")),
        }
    }
}

/// Assigned by the noise collaborator when the source is stored, never by
/// the fetcher itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionMode {
    /// Real triggers will be attributed normally
    Truthfully,
    /// Fake reports were generated; real triggers are suppressed
    Falsely,
    /// No reports will ever be generated for this source
    Never,
}

impl AttributionMode {
    pub fn is_truthful(&self) -> bool {
        matches!(self, Self::Truthfully)
    }
}

impl fmt::Display for AttributionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truthfully => write!(f, "truthfully"),
            Self::Falsely => write!(f, "falsely"),
            Self::Never => write!(f, "never"),
        }
    }
}

impl std::str::FromStr for AttributionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "truthfully" => Ok(Self::Truthfully),
            "falsely" => Ok(Self::Falsely),
            "never" => Ok(Self::Never),
            _ => Err(format!("Invalid attribution mode: {s}")),
        }
    }
}

impl Default for AttributionMode {
    fn default() -> Self {
        Self::Truthfully
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Active,
    Ignored,
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Ignored => write!(f, "ignored"),
        }
    }
}

impl std::str::FromStr for SourceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "ignored" => Ok(Self::Ignored),
            _ => Err(format!("Invalid source status: {s}")),
        }
    }
}

impl Default for SourceStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// A fully parsed and validated source registration. Times are epoch
/// milliseconds; `event_id` and `debug_key` carry unsigned 64-bit semantics
/// end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    /// App destinations, base URIs, first-occurrence order
    pub app_destinations: Vec<String>,
    /// Web destinations reduced to top private domain + scheme
    pub web_destinations: Vec<String>,
    pub enrollment_id: String,
    pub publisher: String,
    pub publisher_type: SurfaceType,
    pub registrant: String,
    pub event_id: u64,
    pub priority: i64,
    pub event_time: i64,
    pub expiry_time: i64,
    pub event_report_window: i64,
    pub aggregatable_report_window: i64,
    pub install_attribution_window: i64,
    pub post_install_exclusivity_window: i64,
    pub source_type: SourceType,
    pub status: SourceStatus,
    pub attribution_mode: AttributionMode,
    pub debug_key: Option<u64>,
    pub debug_reporting: bool,
    pub ad_id_permission: bool,
    pub debug_key_allowed: bool,
    pub debug_join_key: Option<String>,
    pub debug_ad_id: Option<String>,
    pub platform_ad_id: Option<String>,
    pub filter_data: Option<serde_json::Value>,
    pub aggregation_keys: Option<serde_json::Value>,
    pub shared_aggregation_keys: Option<String>,
    pub coarse_event_report_destinations: bool,
    /// Scheme + host + port of the registration URI, path stripped
    pub registration_origin: String,
    /// Group id propagated from the originating pending registration
    pub registration_id: Uuid,
}

impl Source {
    /// Destination lists paired with their surface type, app first,
    /// skipping empty lists. Admission checks and rate-limit bookkeeping
    /// iterate these.
    pub fn destinations(&self) -> Vec<(SurfaceType, &[String])> {
        let mut result = Vec::new();
        if !self.app_destinations.is_empty() {
            result.push((SurfaceType::App, self.app_destinations.as_slice()));
        }
        if !self.web_destinations.is_empty() {
            result.push((SurfaceType::Web, self.web_destinations.as_slice()));
        }
        result
    }

    pub fn has_destinations(&self) -> bool {
        !self.app_destinations.is_empty() || !self.web_destinations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_type_string_conversion() {
        assert_eq!(SourceType::Navigation.to_string(), "navigation");
        assert_eq!("event".parse::<SourceType>().unwrap(), SourceType::Event);
        assert!("click".parse::<SourceType>().is_err());
    }

    #[test]
    fn test_attribution_mode_default_is_truthful() {
        assert!(AttributionMode::default().is_truthful());
        assert!(!AttributionMode::Falsely.is_truthful());
        assert!(!AttributionMode::Never.is_truthful());
    }

    #[test]
    fn test_surface_type_serde() {
        let json = serde_json::to_string(&SurfaceType::Web).unwrap();
        assert_eq!(json, "\"web\"");
        let parsed: SurfaceType = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, SurfaceType::Web);
    }
}
