//! Event reports. This pipeline only creates the placeholder rows backing
//! fake reports; real report generation happens downstream.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::source::SourceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventReportStatus {
    Pending,
    Delivered,
    MarkedToDelete,
}

impl fmt::Display for EventReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Delivered => write!(f, "delivered"),
            Self::MarkedToDelete => write!(f, "marked_to_delete"),
        }
    }
}

impl std::str::FromStr for EventReportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "marked_to_delete" => Ok(Self::MarkedToDelete),
            _ => Err(format!("Invalid event report status: {s}")),
        }
    }
}

impl Default for EventReportStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// One fake report produced by the noise collaborator: a synthetic trigger
/// datum, when it should be delivered, and which destinations it names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FakeReport {
    pub trigger_data: u64,
    /// Epoch milliseconds
    pub reporting_time: i64,
    pub destinations: Vec<String>,
}

/// A persisted event report row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventReport {
    pub id: Uuid,
    pub source_id: Uuid,
    pub source_event_id: u64,
    pub trigger_data: u64,
    pub trigger_priority: i64,
    pub trigger_dedup_key: Option<u64>,
    /// Epoch milliseconds; fake reports use the source's event time
    pub trigger_time: i64,
    pub report_time: i64,
    pub attribution_destinations: Vec<String>,
    pub enrollment_id: String,
    pub source_type: SourceType,
    pub randomized_trigger_rate: f64,
    pub registration_origin: String,
    pub status: EventReportStatus,
}
