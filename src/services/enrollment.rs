//! Enrollment resolution: maps a registration origin to the ad-tech
//! enrollment identity that must exist before any entity is persisted.

use std::collections::HashMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::fetcher::util::base_origin;

/// Enrollment id handed out when the enrollment check is disabled.
pub const FAKE_ENROLLMENT: &str = "fake_enrollment";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait EnrollmentResolver: Send + Sync {
    /// Enrollment id for the registration URI's origin, or None when the
    /// origin is not enrolled.
    async fn valid_enrollment_id(&self, registration_uri: &str) -> Option<String>;
}

/// Table-backed resolver keyed by base origin. Construction with
/// [`StaticEnrollmentResolver::check_disabled`] answers every lookup with
/// [`FAKE_ENROLLMENT`], mirroring deployments that turn the check off.
#[derive(Debug, Default, Clone)]
pub struct StaticEnrollmentResolver {
    entries: HashMap<String, String>,
    check_disabled: bool,
}

impl StaticEnrollmentResolver {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self {
            entries,
            check_disabled: false,
        }
    }

    pub fn check_disabled() -> Self {
        Self {
            entries: HashMap::new(),
            check_disabled: true,
        }
    }

    pub fn with_enrollment(
        mut self,
        origin: impl Into<String>,
        enrollment_id: impl Into<String>,
    ) -> Self {
        self.entries.insert(origin.into(), enrollment_id.into());
        self
    }
}

#[async_trait]
impl EnrollmentResolver for StaticEnrollmentResolver {
    async fn valid_enrollment_id(&self, registration_uri: &str) -> Option<String> {
        if self.check_disabled {
            return Some(FAKE_ENROLLMENT.to_string());
        }
        let origin = base_origin(registration_uri)?;
        self.entries.get(&origin).cloned()
    }
}
