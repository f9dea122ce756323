//! Console channel: local stand-in for a chat channel, used by `relay-bot chat`.
//!
//! Outbound text is written to stdout; every message (user lines and relay output)
//! is kept in memory so later turns see a real history.

use crate::channels::client::{ChannelClient, ChannelError};
use crate::channels::inbound::{HistoryMessage, InboundMessage};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

const CONSOLE_SELF_ID: &str = "relay";
const CONSOLE_CHANNEL_ID: &str = "console";
const CONSOLE_USER_ID: &str = "local-user";

pub struct ConsoleChannel {
    id: String,
    user_name: String,
    history: Mutex<Vec<HistoryMessage>>,
    next_id: Mutex<u64>,
}

impl ConsoleChannel {
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            id: "console".to_string(),
            user_name: user_name.into(),
            history: Mutex::new(Vec::new()),
            next_id: Mutex::new(1),
        }
    }

    /// Identity the relay answers to on the console.
    pub fn self_id(&self) -> &str {
        CONSOLE_SELF_ID
    }

    fn allocate_id(&self) -> String {
        let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
        let id = *next;
        *next += 1;
        id.to_string()
    }

    fn record(&self, author_name: &str, author_is_automated: bool, text: &str) -> HistoryMessage {
        let entry = HistoryMessage {
            id: self.allocate_id(),
            author_name: author_name.to_string(),
            author_is_automated,
            text: text.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        entry
    }

    /// Turn a typed line into an inbound message that mentions the relay.
    pub fn inbound(&self, text: &str) -> InboundMessage {
        let entry = self.record(&self.user_name, false, text);
        InboundMessage {
            id: entry.id,
            channel_id: CONSOLE_CHANNEL_ID.to_string(),
            author_id: CONSOLE_USER_ID.to_string(),
            author_name: entry.author_name,
            author_is_automated: false,
            text: entry.text,
            mentioned_user_ids: HashSet::from([CONSOLE_SELF_ID.to_string()]),
            created_at: entry.created_at,
        }
    }

    async fn print(&self, text: &str) -> Result<(), ChannelError> {
        let mut stdout = tokio::io::stdout();
        let line = format!("< {}\n", text);
        stdout
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ChannelError::Other(e.to_string()))?;
        stdout
            .flush()
            .await
            .map_err(|e| ChannelError::Other(e.to_string()))
    }
}

#[async_trait]
impl ChannelClient for ConsoleChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, _channel_id: &str, text: &str) -> Result<(), ChannelError> {
        self.record(CONSOLE_SELF_ID, true, text);
        self.print(text).await
    }

    async fn reply(
        &self,
        _channel_id: &str,
        _message_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.record(CONSOLE_SELF_ID, true, text);
        self.print(text).await
    }

    async fn fetch_history(
        &self,
        _channel_id: &str,
        before_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, ChannelError> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let end = match before_id {
            Some(id) => history.iter().position(|m| m.id == id).unwrap_or(history.len()),
            None => history.len(),
        };
        let start = end.saturating_sub(limit);
        Ok(history[start..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_before_excludes_the_trigger() {
        let console = ConsoleChannel::new("me");
        console.inbound("one");
        console.inbound("two");
        let trigger = console.inbound("three");
        assert!(trigger.mentioned_user_ids.contains(console.self_id()));

        let history = console
            .fetch_history("console", Some(&trigger.id), 10)
            .await
            .unwrap();
        let texts: Vec<&str> = history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);

        let history = console
            .fetch_history("console", Some(&trigger.id), 1)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text, "two");
    }
}
