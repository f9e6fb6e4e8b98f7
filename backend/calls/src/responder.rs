use anyhow::Result;
use async_trait::async_trait;

use callforge_core::CallRecord;

/// Decides what the bot says next in a conversation-mode call.
///
/// Consulted when a final user transcript arrives and nobody is waiting
/// for it. `Ok(None)` means stay silent.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, call: &CallRecord, user_text: &str) -> Result<Option<String>>;
}
