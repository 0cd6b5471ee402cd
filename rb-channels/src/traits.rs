use crate::types::{InboundMessage, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier, e.g. "telegram".
    fn channel_id(&self) -> &str;

    /// Start receiving updates in the background. Every inbound message is
    /// pushed to `tx` until `shutdown` fires or the receiver is dropped.
    async fn start(
        &self,
        tx: mpsc::Sender<InboundMessage>,
        shutdown: CancellationToken,
    ) -> Result<()>;

    /// Deliver a message to a chat on this platform.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()>;
}
