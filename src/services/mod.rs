//! Collaborator seams consumed by the fetchers and the queue runner:
//! enrollment resolution, debug-report scheduling, noise assignment, and the
//! post-enqueue work notification. Each is a trait with a default
//! implementation; embedders swap in their own.

pub mod debug_report;
pub mod enrollment;
pub mod noise;
pub mod notifier;

pub use debug_report::{DebugReportKind, DebugReporter, LoggingDebugReporter};
pub use enrollment::{EnrollmentResolver, StaticEnrollmentResolver, FAKE_ENROLLMENT};
pub use noise::{NoiseAssigner, NoiseAssignment, TruthfulNoiseAssigner};
pub use notifier::{LoggingNotifier, Notifier, PENDING_REGISTRATION_URI, TRIGGER_URI};
