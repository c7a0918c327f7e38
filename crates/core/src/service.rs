//! Service lifecycle trait.

use async_trait::async_trait;

use crate::error::CoreResult;

/// A long-lived component with an explicit start/close lifecycle.
///
/// Implementations are started at most once and closed at most once; a
/// second `start` or a `close` before `start` fails with a lifecycle error.
#[async_trait]
pub trait Service: Send + Sync {
    /// Stable name for logs and health output.
    fn name(&self) -> &'static str;

    /// Starts the service's background work.
    async fn start(&self) -> CoreResult<()>;

    /// Stops the service and waits for its background work to finish.
    async fn close(&self) -> CoreResult<()>;
}
