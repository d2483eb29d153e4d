//! The handler seam.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;
use crate::message::Delivery;

/// A message consumer, registered at startup and resolved by topic.
///
/// Handlers for distinct messages may run concurrently; the claim protocol
/// guarantees the same message is never handled twice at once. Handlers are
/// expected to be idempotent, since delivery is at-least-once.
#[async_trait]
pub trait Handler: Send + Sync {
    /// The topic this handler consumes. Case-sensitive, matched exactly
    /// against the enqueued topic.
    fn topic(&self) -> &str;

    /// Process one delivery. `cancel` fires when the dispatch scope is torn
    /// down (shutdown, or the store's dispatch lease was lost); long-running
    /// handlers should watch it and bail out cooperatively.
    async fn handle(
        &self,
        delivery: &Delivery,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError>;
}
