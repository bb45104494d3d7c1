//! Operator notifications for kill-switch transitions.

use async_trait::async_trait;
use tracing::warn;

/// Delivers a message to an operator channel (chat, pager, email).
///
/// Delivery is best effort: the risk gate logs a failure and moves on.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<(), NotifyError>;
}

#[derive(Debug, thiserror::Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Notifier that only writes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        warn!(notification = %message, "Operator notification");
        Ok(())
    }
}
