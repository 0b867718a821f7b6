//! Attribution rate-limit records: one row per (source, destination origin)
//! consumed by the downstream rate-limit privacy checks.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    pub id: Uuid,
    /// Top-level publisher site (top private domain for web publishers)
    pub source_site: String,
    /// The publisher origin as registered
    pub source_origin: String,
    pub destination_site: String,
    pub destination_origin: String,
    pub enrollment_id: String,
    /// Epoch milliseconds; source-insertion rows use the source event time
    pub trigger_time: i64,
    pub registrant: String,
    pub source_id: Option<Uuid>,
    /// None for rows created at source insertion; no trigger exists yet
    pub trigger_id: Option<Uuid>,
}
