//! Rate-limited, ordered delivery of chunks back to the channel.

use std::time::Duration;

use crate::channels::{ChannelClient, ChannelError, InboundMessage};
use crate::dispatch::chunker::Chunk;
use crate::dispatch::classifier::mention_token;

/// Longest continuation marker that still leaves room for text: half the limit.
pub fn fit_marker(marker: &str, max_message_length: usize) -> String {
    marker.chars().take(max_message_length / 2).collect()
}

/// Sends chunks in order: the first as a reply to the trigger, the rest as plain
/// posts carrying the continuation marker. Sleeps `1000 / rate` ms between sends.
/// No framed message exceeds `max_message_length`.
#[derive(Debug, Clone)]
pub struct DeliveryScheduler {
    interval: Duration,
    max_message_length: usize,
    mention_reply: bool,
    continuation_marker: String,
}

impl DeliveryScheduler {
    pub fn new(
        rate_per_second: u32,
        max_message_length: usize,
        mention_reply: bool,
        continuation_marker: impl AsRef<str>,
    ) -> Self {
        let rate = u64::from(rate_per_second.max(1));
        let max_message_length = max_message_length.max(1);
        Self {
            interval: Duration::from_millis(1000 / rate),
            max_message_length,
            mention_reply,
            continuation_marker: fit_marker(continuation_marker.as_ref(), max_message_length),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Mention prefix for the first chunk; dropped when it would take over half the limit.
    fn first_prefix(&self, trigger: &InboundMessage) -> String {
        if !self.mention_reply {
            return String::new();
        }
        let prefix = format!("{} ", mention_token(&trigger.author_id));
        if prefix.chars().count() * 2 > self.max_message_length {
            String::new()
        } else {
            prefix
        }
    }

    /// Text of `chunk` as it will be posted.
    pub fn frame(&self, trigger: &InboundMessage, chunk: &Chunk) -> String {
        if chunk.is_first() {
            format!("{}{}", self.first_prefix(trigger), chunk.text)
        } else {
            format!("{}{}", self.continuation_marker, chunk.text)
        }
    }

    /// Largest chunk length that still fits the message limit once framed.
    pub fn chunk_budget(&self, trigger: &InboundMessage) -> usize {
        let overhead = self
            .first_prefix(trigger)
            .chars()
            .count()
            .max(self.continuation_marker.chars().count());
        self.max_message_length.saturating_sub(overhead).max(1)
    }

    /// Deliver every chunk in order. The first failure stops delivery and is returned;
    /// nothing is retried.
    pub async fn deliver(
        &self,
        channel: &dyn ChannelClient,
        trigger: &InboundMessage,
        chunks: &[Chunk],
    ) -> Result<(), ChannelError> {
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.interval).await;
            }
            let text = self.frame(trigger, chunk);
            let sent = if chunk.is_first() {
                channel.reply(&trigger.channel_id, &trigger.id, &text).await
            } else {
                channel.send(&trigger.channel_id, &text).await
            };
            if let Err(e) = sent {
                log::warn!(
                    "delivery: chunk {}/{} for {} failed: {}",
                    chunk.index + 1,
                    chunks.len(),
                    trigger.id,
                    e
                );
                return Err(e);
            }
        }
        log::debug!("delivery: sent {} chunk(s) for {}", chunks.len(), trigger.id);
        Ok(())
    }
}
