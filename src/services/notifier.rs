//! Work-pending notifications: tell an external scheduler that queued work
//! exists. Purely advisory; the queue itself is the source of truth.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

/// Channel URI fired after registrations are enqueued.
pub const PENDING_REGISTRATION_URI: &str = "attribution://queue/pending-registrations";

/// Channel URI fired after a trigger row is stored.
pub const TRIGGER_URI: &str = "attribution://queue/triggers";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// The URI names a wake-up channel and carries no other meaning.
    /// Implementations log failures and never propagate them.
    async fn notify(&self, uri: &str);
}

#[derive(Debug, Default, Clone)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, uri: &str) {
        debug!(uri = %uri, "Queued work is pending");
    }
}
