use async_trait::async_trait;

use crate::error::TransportError;

/// Pushes payloads to whatever live sessions a recipient currently has.
///
/// Implementations are shared by every poller task and must be safe for
/// concurrent use.
#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    /// Deliver `payload` to every active target of `recipient_id`.
    ///
    /// Returns `Ok(true)` if at least one target accepted the payload and
    /// `Ok(false)` if the recipient has no active target. Pushes may be
    /// repeated for the same notification, so targets must tolerate
    /// duplicates.
    async fn deliver(&self, recipient_id: i64, payload: &str) -> Result<bool, TransportError>;
}
