use async_trait::async_trait;

use crate::UploadPacket;

/// Where a command's answer goes. Implemented by each chat platform adapter.
#[async_trait]
pub trait ChatReply: Send + Sync {
    /// Sends a plain text message.
    async fn say(&self, text: &str) -> anyhow::Result<()>;

    /// Sends a message with attached files.
    async fn upload(&self, text: &str, files: Vec<UploadPacket>) -> anyhow::Result<()>;
}
