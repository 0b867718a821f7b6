//! Verbose debug report scheduling. The pipeline only decides *that* a report
//! of a given kind is due; delivery belongs to a separate reporting job, so
//! the default implementation records the decision as a structured log event.
//!
//! Scheduling is fire-and-forget: a failure here never fails the admission
//! check that raised it.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::fmt;
use tracing::debug;

use crate::models::{Source, Trigger};

/// Report kinds raised by admission checks and the store path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebugReportKind {
    /// Source stored without noise
    SourceSuccess,
    /// Publisher hit the stored-source ceiling
    SourceStorageLimit,
    /// Distinct-destination privacy bound exceeded
    SourceDestinationLimit,
    /// Distinct reporting-origin bound exceeded
    SourceReportingOriginLimit,
    /// Fake reports were planted for this source
    SourceNoised,
    SourceUnknownError,
    TriggerUnknownError,
}

impl fmt::Display for DebugReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceSuccess => write!(f, "source-success"),
            Self::SourceStorageLimit => write!(f, "source-storage-limit"),
            Self::SourceDestinationLimit => write!(f, "source-destination-limit"),
            Self::SourceReportingOriginLimit => write!(f, "source-reporting-origin-limit"),
            Self::SourceNoised => write!(f, "source-noised"),
            Self::SourceUnknownError => write!(f, "source-unknown-error"),
            Self::TriggerUnknownError => write!(f, "trigger-unknown-error"),
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DebugReporter: Send + Sync {
    async fn schedule_source_report(&self, kind: DebugReportKind, source: &Source);

    async fn schedule_trigger_report(&self, kind: DebugReportKind, trigger: &Trigger);
}

/// Default reporter: emits the scheduling decision as a log record.
///
/// Callers raise reports unconditionally; the opt-in gate lives here.
/// Entities whose registration did not set `debug_reporting` are dropped
/// silently.
#[derive(Debug, Default, Clone)]
pub struct LoggingDebugReporter;

#[async_trait]
impl DebugReporter for LoggingDebugReporter {
    async fn schedule_source_report(&self, kind: DebugReportKind, source: &Source) {
        if !source.debug_reporting {
            return;
        }
        debug!(
            kind = %kind,
            source_id = %source.id,
            enrollment_id = %source.enrollment_id,
            registration_origin = %source.registration_origin,
            "Scheduled source debug report"
        );
    }

    async fn schedule_trigger_report(&self, kind: DebugReportKind, trigger: &Trigger) {
        if !trigger.debug_reporting {
            return;
        }
        debug!(
            kind = %kind,
            trigger_id = %trigger.id,
            enrollment_id = %trigger.enrollment_id,
            registration_origin = %trigger.registration_origin,
            "Scheduled trigger debug report"
        );
    }
}
