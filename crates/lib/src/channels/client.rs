//! Channel client: the outbound side of a channel (send, reply, history).

use async_trait::async_trait;

use crate::channels::inbound::HistoryMessage;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("channel api error: {status} {body}")]
    Api { status: u16, body: String },
    #[error("{0} not configured")]
    NotConfigured(&'static str),
    #[error("channel error: {0}")]
    Other(String),
}

/// Outbound operations the dispatch pipeline needs from a channel.
#[async_trait]
pub trait ChannelClient: Send + Sync {
    /// Channel id (e.g. "discord").
    fn id(&self) -> &str;

    /// Post `text` to the channel.
    async fn send(&self, channel_id: &str, text: &str) -> Result<(), ChannelError>;

    /// Post `text` as a reply to `message_id`.
    async fn reply(&self, channel_id: &str, message_id: &str, text: &str)
        -> Result<(), ChannelError>;

    /// Up to `limit` messages before `before_id` (or the most recent when `None`), oldest first.
    async fn fetch_history(
        &self,
        channel_id: &str,
        before_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, ChannelError>;

    /// Show a typing indicator. Default does nothing.
    async fn typing(&self, _channel_id: &str) -> Result<(), ChannelError> {
        Ok(())
    }
}
