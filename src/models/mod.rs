pub mod attribution;
pub mod event_report;
pub mod fetch_status;
pub mod key_value;
pub mod pending_registration;
pub mod redirects;
pub mod source;
pub mod trigger;

// Re-export core models for easy access
pub use attribution::Attribution;
pub use event_report::{EventReport, EventReportStatus, FakeReport};
pub use fetch_status::{EntityStatus, FetchStatus, ResponseStatus};
pub use key_value::{KeyValueData, KeyValueDataType};
pub use pending_registration::{PendingRegistration, RegistrationKind};
pub use redirects::{RedirectType, Redirects};
pub use source::{AttributionMode, Source, SourceStatus, SourceType, SurfaceType};
pub use trigger::{Trigger, TriggerStatus};
