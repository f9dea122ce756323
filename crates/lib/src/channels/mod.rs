//! Communication channels (Discord, local console).
//!
//! Connectors push [`ChannelEvent`]s to the gateway; the dispatch pipeline talks
//! back through the [`ChannelClient`] trait.

mod client;
mod console;
mod discord;
mod inbound;

pub use client::{ChannelClient, ChannelError};
pub use console::ConsoleChannel;
pub use discord::{DiscordChannel, DISCORD_API_BASE};
pub use inbound::{ChannelEvent, HistoryMessage, InboundMessage};
