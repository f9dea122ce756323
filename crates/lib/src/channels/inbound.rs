//! Inbound message from a channel: delivered to the gateway for dispatch.

use std::collections::HashSet;

/// A message posted in a channel, as seen by the relay. Immutable once received.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Platform-assigned message id (unique).
    pub id: String,
    /// Channel the message was posted in; replies go back here.
    pub channel_id: String,
    pub author_id: String,
    /// Display name used when rendering the prompt.
    pub author_name: String,
    /// True for bots and webhooks.
    pub author_is_automated: bool,
    pub text: String,
    /// User ids the platform parsed as explicit mentions.
    pub mentioned_user_ids: HashSet<String>,
    /// ISO-8601 creation time as reported by the platform.
    pub created_at: String,
}

/// A prior message returned by a channel history fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMessage {
    pub id: String,
    pub author_name: String,
    pub author_is_automated: bool,
    pub text: String,
    pub created_at: String,
}

/// Event produced by a channel connector.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The connector is authenticated and knows the handling identity.
    Ready { self_id: String },
    Message(InboundMessage),
}
