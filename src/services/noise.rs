//! Noise assignment for admitted sources: the collaborator decides the
//! attribution mode and fabricates any fake reports before the source row is
//! written, so downstream attribution cannot tell a noised source apart.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::models::{AttributionMode, FakeReport, Source};

/// Outcome of noise assignment for one admitted source.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseAssignment {
    pub attribution_mode: AttributionMode,
    pub fake_reports: Vec<FakeReport>,
    /// Recorded on every fake report row for downstream debugging
    pub randomized_trigger_rate: f64,
}

impl NoiseAssignment {
    pub fn truthful() -> Self {
        Self {
            attribution_mode: AttributionMode::Truthfully,
            fake_reports: Vec::new(),
            randomized_trigger_rate: 0.0,
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait NoiseAssigner: Send + Sync {
    async fn assign(&self, source: &Source) -> NoiseAssignment;
}

/// Default assigner: every source keeps truthful attribution and no fake
/// reports are planted. Deployments wire in their privacy mechanism here.
#[derive(Debug, Default, Clone)]
pub struct TruthfulNoiseAssigner;

#[async_trait]
impl NoiseAssigner for TruthfulNoiseAssigner {
    async fn assign(&self, _source: &Source) -> NoiseAssignment {
        NoiseAssignment::truthful()
    }
}
