//! Publisher trait — delivers notification text to a connector.

use async_trait::async_trait;

use crate::error::Result;

/// A connector's outbound side, keyed by connector name in the dispatcher.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;

    /// Send `message` to the connector-specific conversation `external_id`.
    async fn publish(&self, external_id: &str, message: &str) -> Result<()>;
}
