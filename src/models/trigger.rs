//! The persisted trigger entity: one conversion registration, matched
//! against prior sources by the downstream attribution job.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::source::SurfaceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Pending,
    Ignored,
    Attributed,
}

impl fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ignored => write!(f, "ignored"),
            Self::Attributed => write!(f, "attributed"),
        }
    }
}

impl std::str::FromStr for TriggerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ignored" => Ok(Self::Ignored),
            "attributed" => Ok(Self::Attributed),
            _ => Err(format!("Invalid trigger status: {s}")),
        }
    }
}

impl Default for TriggerStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// A fully parsed and validated trigger registration. The structured JSON
/// payloads are stored normalized (defaults applied, invalid numeric fields
/// dropped) exactly as parsing left them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    pub attribution_destination: String,
    pub destination_type: SurfaceType,
    pub enrollment_id: String,
    pub registrant: String,
    /// Epoch milliseconds; the enqueue-side request time
    pub trigger_time: i64,
    pub status: TriggerStatus,
    pub event_triggers: Option<serde_json::Value>,
    pub aggregatable_trigger_data: Option<serde_json::Value>,
    pub aggregatable_values: Option<serde_json::Value>,
    pub aggregatable_deduplication_keys: Option<serde_json::Value>,
    pub filters: Option<serde_json::Value>,
    pub not_filters: Option<serde_json::Value>,
    pub debug_key: Option<u64>,
    pub debug_reporting: bool,
    pub ad_id_permission: bool,
    pub debug_key_allowed: bool,
    pub debug_join_key: Option<String>,
    pub debug_ad_id: Option<String>,
    pub platform_ad_id: Option<String>,
    pub registration_origin: String,
    pub registration_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_status_default() {
        assert_eq!(TriggerStatus::default(), TriggerStatus::Pending);
        assert_eq!(TriggerStatus::Attributed.to_string(), "attributed");
    }
}
