//! Conversation context: turn a triggering message plus channel history into an
//! ordered record, and render that record as the task prompt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channels::{ChannelClient, ChannelError, HistoryMessage, InboundMessage};

/// One way of asking the channel for the messages preceding the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStrategy {
    /// Page of messages strictly before the triggering message id.
    Before,
    /// Latest page of the channel, cut at the triggering message.
    Recent,
}

impl HistoryStrategy {
    /// One attempt, no retry. Returns at most `limit` messages, oldest first.
    async fn fetch(
        self,
        channel: &dyn ChannelClient,
        trigger: &InboundMessage,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, ChannelError> {
        match self {
            HistoryStrategy::Before => {
                channel
                    .fetch_history(&trigger.channel_id, Some(&trigger.id), limit)
                    .await
            }
            HistoryStrategy::Recent => {
                let page = channel
                    .fetch_history(&trigger.channel_id, None, limit + 1)
                    .await?;
                let mut prior = match page.iter().position(|m| m.id == trigger.id) {
                    Some(cut) => page.into_iter().take(cut).collect::<Vec<_>>(),
                    None => {
                        let trigger_at = parse_timestamp(&trigger.created_at);
                        page.into_iter()
                            .filter(|m| match (parse_timestamp(&m.created_at), trigger_at) {
                                (Some(at), Some(cutoff)) => at < cutoff,
                                _ => true,
                            })
                            .collect()
                    }
                };
                if prior.len() > limit {
                    prior.drain(..prior.len() - limit);
                }
                Ok(prior)
            }
        }
    }
}

/// A single line of conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationEntry {
    pub author_name: String,
    pub content: String,
    /// ISO-8601 as reported by the channel; may be malformed.
    pub timestamp: String,
}

impl From<&InboundMessage> for ConversationEntry {
    fn from(m: &InboundMessage) -> Self {
        Self {
            author_name: m.author_name.clone(),
            content: m.text.clone(),
            timestamp: m.created_at.clone(),
        }
    }
}

impl From<HistoryMessage> for ConversationEntry {
    fn from(m: HistoryMessage) -> Self {
        Self {
            author_name: m.author_name,
            content: m.text,
            timestamp: m.created_at,
        }
    }
}

/// Ordered conversation, oldest first, triggering message last. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    entries: Vec<ConversationEntry>,
}

impl ConversationRecord {
    /// Record holding only the triggering message.
    pub fn single(message: &InboundMessage) -> Self {
        Self {
            entries: vec![ConversationEntry::from(message)],
        }
    }

    /// Prior history plus the trigger. Keeps the newest `max_prior` history messages.
    fn with_history(
        mut history: Vec<HistoryMessage>,
        message: &InboundMessage,
        max_prior: usize,
    ) -> Self {
        history.retain(|m| m.id != message.id);
        if history
            .iter()
            .all(|m| parse_timestamp(&m.created_at).is_some())
        {
            history.sort_by_key(|m| parse_timestamp(&m.created_at));
        }
        if history.len() > max_prior {
            history.drain(..history.len() - max_prior);
        }
        let mut entries: Vec<ConversationEntry> =
            history.into_iter().map(ConversationEntry::from).collect();
        entries.push(ConversationEntry::from(message));
        Self { entries }
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The triggering message.
    pub fn latest(&self) -> &ConversationEntry {
        // Constructors always push the trigger last.
        &self.entries[self.entries.len() - 1]
    }
}

/// Builds conversation records within a fixed history window.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    max_history: usize,
    strategies: Vec<HistoryStrategy>,
}

impl ContextAssembler {
    /// `max_history` counts the triggering message; 1 disables history.
    pub fn new(max_history: usize, strategies: Vec<HistoryStrategy>) -> Self {
        Self {
            max_history: max_history.max(1),
            strategies,
        }
    }

    /// Try each strategy in order until one yields messages; fall back to the trigger alone.
    /// Fetch failures are logged and never returned.
    pub async fn build_context(
        &self,
        message: &InboundMessage,
        channel: &dyn ChannelClient,
    ) -> ConversationRecord {
        let max_prior = self.max_history - 1;
        if max_prior == 0 {
            return ConversationRecord::single(message);
        }
        for strategy in &self.strategies {
            match strategy.fetch(channel, message, max_prior).await {
                Ok(history) if !history.is_empty() => {
                    log::debug!(
                        "context: {:?} returned {} message(s) for {}",
                        strategy,
                        history.len(),
                        message.id
                    );
                    return ConversationRecord::with_history(history, message, max_prior);
                }
                Ok(_) => log::debug!("context: {:?} returned no history for {}", strategy, message.id),
                Err(e) => log::warn!(
                    "context: {:?} history fetch failed for {}: {}",
                    strategy,
                    message.id,
                    e
                ),
            }
        }
        if !self.strategies.is_empty() {
            log::warn!("context: using single-message context for {}", message.id);
        }
        ConversationRecord::single(message)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Human-readable time; malformed input is shown as-is.
fn display_time(raw: &str) -> String {
    match parse_timestamp(raw) {
        Some(t) => t.format("%Y-%m-%d %H:%M UTC").to_string(),
        None if raw.trim().is_empty() => "unknown time".to_string(),
        None => raw.to_string(),
    }
}

fn display_content(content: &str) -> &str {
    if content.trim().is_empty() {
        "(no text)"
    } else {
        content
    }
}

/// Marks the line the task should answer in a transcript.
pub const LATEST_MARKER: &str = ">>> ";

/// Render the record as the task prompt: a short form for a lone message, a
/// transcript (one line per entry, latest marked) otherwise.
pub fn build_prompt(record: &ConversationRecord, preamble: Option<&str>) -> String {
    let mut prompt = String::new();
    if let Some(p) = preamble.filter(|p| !p.trim().is_empty()) {
        prompt.push_str(p.trim_end());
        prompt.push_str("\n\n");
    }

    if record.len() == 1 {
        let entry = record.latest();
        prompt.push_str(&format!(
            "Message from {} at {}:\n\n{}",
            entry.author_name,
            display_time(&entry.timestamp),
            display_content(&entry.content)
        ));
        return prompt;
    }

    prompt.push_str(&format!(
        "Recent channel conversation ({} messages, oldest first). Respond to the latest message, marked with \"{}\".\n\n",
        record.len(),
        LATEST_MARKER.trim_end()
    ));
    let last = record.len() - 1;
    for (i, entry) in record.entries().iter().enumerate() {
        if i == last {
            prompt.push_str(LATEST_MARKER);
        }
        prompt.push_str(&format!(
            "[{}] {}: {}",
            display_time(&entry.timestamp),
            entry.author_name,
            display_content(&entry.content)
        ));
        if i != last {
            prompt.push('\n');
        }
    }
    prompt
}
