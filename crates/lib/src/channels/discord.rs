//! Discord channel: gateway websocket for inbound events, REST API for replies and history.

use crate::channels::client::{ChannelClient, ChannelError};
use crate::channels::inbound::{ChannelEvent, HistoryMessage, InboundMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
const DISCORD_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_MS: u64 = 41_250;
/// Discord caps `GET /channels/{id}/messages` at 100 per page.
const MAX_HISTORY_PAGE: usize = 100;
/// Longer 429 waits are reported as failures instead of stalling delivery.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(10);

/// GUILDS | GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT
const GATEWAY_INTENTS: u64 = (1 << 0) | (1 << 9) | (1 << 12) | (1 << 15);

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const OP_HEARTBEAT_ACK: u8 = 11;

type GatewaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Gateway frame: `{ "op", "d", "s", "t" }`.
#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: serde_json::Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReadyPayload {
    user: DiscordUser,
}

#[derive(Debug, Deserialize)]
pub struct DiscordUser {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Deserialize)]
pub struct DiscordMember {
    #[serde(default)]
    pub nick: Option<String>,
}

/// Message object as returned by REST and carried by MESSAGE_CREATE.
#[derive(Debug, Deserialize)]
pub struct DiscordMessage {
    pub id: String,
    pub channel_id: String,
    pub author: DiscordUser,
    #[serde(default)]
    pub content: String,
    pub timestamp: String,
    #[serde(default)]
    pub mentions: Vec<DiscordUser>,
    #[serde(default)]
    pub member: Option<DiscordMember>,
    #[serde(default)]
    pub webhook_id: Option<String>,
}

impl DiscordMessage {
    /// Guild nickname, then global display name, then username.
    fn author_display_name(&self) -> String {
        self.member
            .as_ref()
            .and_then(|m| m.nick.clone())
            .or_else(|| self.author.global_name.clone())
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| self.author.username.clone())
    }

    fn is_automated(&self) -> bool {
        self.author.bot || self.webhook_id.is_some()
    }

    fn into_inbound(self) -> InboundMessage {
        let author_name = self.author_display_name();
        let author_is_automated = self.is_automated();
        InboundMessage {
            id: self.id,
            channel_id: self.channel_id,
            author_id: self.author.id,
            author_name,
            author_is_automated,
            text: self.content,
            mentioned_user_ids: self.mentions.into_iter().map(|u| u.id).collect(),
            created_at: self.timestamp,
        }
    }

    fn into_history(self) -> HistoryMessage {
        let author_name = self.author_display_name();
        let author_is_automated = self.is_automated();
        HistoryMessage {
            id: self.id,
            author_name,
            author_is_automated,
            text: self.content,
            created_at: self.timestamp,
        }
    }
}

/// Discord returns newest first; history is handed out oldest first.
fn history_from_page(page: Vec<DiscordMessage>) -> Vec<HistoryMessage> {
    page.into_iter().rev().map(DiscordMessage::into_history).collect()
}

/// Translate a gateway dispatch (`op` 0) into a channel event. Unknown events are ignored.
fn parse_dispatch(event: Option<&str>, data: serde_json::Value) -> Option<ChannelEvent> {
    match event? {
        "READY" => match serde_json::from_value::<ReadyPayload>(data) {
            Ok(ready) => Some(ChannelEvent::Ready {
                self_id: ready.user.id,
            }),
            Err(e) => {
                log::warn!("discord: malformed READY payload: {}", e);
                None
            }
        },
        "MESSAGE_CREATE" => match serde_json::from_value::<DiscordMessage>(data) {
            Ok(msg) => Some(ChannelEvent::Message(msg.into_inbound())),
            Err(e) => {
                log::debug!("discord: skipping malformed MESSAGE_CREATE: {}", e);
                None
            }
        },
        _ => None,
    }
}

fn heartbeat_frame(seq: Option<u64>) -> serde_json::Value {
    json!({ "op": OP_HEARTBEAT, "d": seq })
}

fn identify_frame(token: &str) -> serde_json::Value {
    json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": token,
            "intents": GATEWAY_INTENTS,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "relay",
                "device": "relay",
            }
        }
    })
}

/// How a gateway session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// Server asked us to reconnect, invalidated the session, or closed the socket.
    Reconnect,
    /// `stop()` was called.
    Stopped,
    /// Nobody is listening for events any more.
    ReceiverClosed,
}

/// Discord channel connector: gateway session for inbound messages, REST for outbound.
pub struct DiscordChannel {
    id: String,
    token: Option<String>,
    api_base: String,
    gateway_url: String,
    running: AtomicBool,
    shutdown: Notify,
    client: reqwest::Client,
}

impl DiscordChannel {
    pub fn new(token: Option<String>, api_base: Option<String>) -> Self {
        let api_base = api_base
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DISCORD_API_BASE.to_string());
        Self {
            id: "discord".to_string(),
            token,
            api_base,
            gateway_url: DISCORD_GATEWAY_URL.to_string(),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            client: reqwest::Client::new(),
        }
    }

    /// Connect the inbound session to another gateway endpoint (e.g. a local test server).
    pub fn with_gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = url.into();
        self
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn token(&self) -> Result<&str, ChannelError> {
        self.token
            .as_deref()
            .ok_or(ChannelError::NotConfigured("discord bot token"))
    }

    /// Stop the gateway loop (current session is closed).
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Start the gateway loop and forward events to the gateway. Returns a handle to await on shutdown.
    pub fn start_inbound(self: Arc<Self>, events_tx: mpsc::Sender<ChannelEvent>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("discord channel: starting gateway session loop");
        tokio::spawn(async move {
            run_gateway_loop(self, events_tx).await;
        })
    }

    async fn run_session(
        &self,
        events_tx: &mpsc::Sender<ChannelEvent>,
    ) -> Result<SessionEnd, ChannelError> {
        let token = self.token()?;
        let (mut ws, _) = tokio_tungstenite::connect_async(self.gateway_url.as_str())
            .await
            .map_err(|e| ChannelError::Other(format!("gateway connect failed: {}", e)))?;
        log::debug!("discord: gateway connected");

        let mut heartbeat: Option<Interval> = None;
        let mut seq: Option<u64> = None;
        // Set when a heartbeat goes out, cleared by op 11.
        let mut awaiting_ack = false;
        loop {
            // notify_waiters is lost while we are parked in events_tx.send.
            if !self.running() {
                let _ = ws.close(None).await;
                return Ok(SessionEnd::Stopped);
            }
            tokio::select! {
                _ = self.shutdown.notified() => {
                    let _ = ws.close(None).await;
                    return Ok(SessionEnd::Stopped);
                }
                _ = next_heartbeat(&mut heartbeat) => {
                    if awaiting_ack {
                        log::warn!("discord: no heartbeat ack since last beat, dropping session");
                        let _ = ws.close(None).await;
                        return Ok(SessionEnd::Reconnect);
                    }
                    send_frame(&mut ws, heartbeat_frame(seq)).await?;
                    awaiting_ack = true;
                }
                frame = ws.next() => {
                    let Some(frame) = frame else {
                        return Ok(SessionEnd::Reconnect);
                    };
                    let frame = frame
                        .map_err(|e| ChannelError::Other(format!("gateway read failed: {}", e)))?;
                    let text = match frame {
                        Message::Text(text) => text,
                        Message::Close(close) => {
                            log::info!("discord: gateway closed: {:?}", close);
                            return Ok(SessionEnd::Reconnect);
                        }
                        _ => continue,
                    };
                    let payload: GatewayPayload = match serde_json::from_str(&text) {
                        Ok(p) => p,
                        Err(e) => {
                            log::debug!("discord: unparseable gateway frame: {}", e);
                            continue;
                        }
                    };
                    if payload.s.is_some() {
                        seq = payload.s;
                    }
                    match payload.op {
                        OP_HELLO => {
                            let ms = payload
                                .d
                                .get("heartbeat_interval")
                                .and_then(|v| v.as_u64())
                                .unwrap_or(DEFAULT_HEARTBEAT_MS);
                            let mut interval = tokio::time::interval(Duration::from_millis(ms));
                            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                            heartbeat = Some(interval);
                            awaiting_ack = false;
                            send_frame(&mut ws, identify_frame(token)).await?;
                        }
                        OP_HEARTBEAT => {
                            send_frame(&mut ws, heartbeat_frame(seq)).await?;
                        }
                        OP_RECONNECT | OP_INVALID_SESSION => {
                            log::info!("discord: gateway requested reconnect (op {})", payload.op);
                            return Ok(SessionEnd::Reconnect);
                        }
                        OP_HEARTBEAT_ACK => awaiting_ack = false,
                        OP_DISPATCH => {
                            if let Some(event) = parse_dispatch(payload.t.as_deref(), payload.d) {
                                if events_tx.send(event).await.is_err() {
                                    return Ok(SessionEnd::ReceiverClosed);
                                }
                            }
                        }
                        other => log::debug!("discord: ignoring gateway op {}", other),
                    }
                }
            }
        }
    }

    async fn post_message(&self, channel_id: &str, body: serde_json::Value) -> Result<(), ChannelError> {
        let url = format!("{}/channels/{}/messages", self.api_base, channel_id);
        self.execute(|| self.client.post(&url).json(&body)).await?;
        Ok(())
    }

    /// Send an authorized request. A 429 is waited out once (per `retry_after`) and
    /// retried; any other non-success status is an `Api` error.
    async fn execute<F>(&self, build: F) -> Result<reqwest::Response, ChannelError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let auth = format!("Bot {}", self.token()?);
        let res = build()
            .header(reqwest::header::AUTHORIZATION, &auth)
            .send()
            .await?;
        if res.status() != reqwest::StatusCode::TOO_MANY_REQUESTS {
            return check_status(res).await;
        }

        let header_wait = retry_after_header(&res);
        let body = res.text().await.unwrap_or_default();
        let wait = header_wait.or_else(|| retry_after_body(&body));
        match wait {
            Some(wait) if wait <= MAX_RETRY_AFTER => {
                log::warn!(
                    "discord: rate limited, retrying in {}ms",
                    wait.as_millis()
                );
                tokio::time::sleep(wait).await;
            }
            _ => {
                log::warn!("discord: rate limited, not retrying (retry_after {:?})", wait);
                return Err(ChannelError::Api { status: 429, body });
            }
        }

        let res = build()
            .header(reqwest::header::AUTHORIZATION, &auth)
            .send()
            .await?;
        check_status(res).await
    }
}

/// `Retry-After` header, in seconds (Discord may send fractions).
fn retry_after_header(res: &reqwest::Response) -> Option<Duration> {
    res.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(seconds)
}

/// `retry_after` from a 429 JSON body, in seconds.
fn retry_after_body(body: &str) -> Option<Duration> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("retry_after")?
        .as_f64()
        .and_then(seconds)
}

fn seconds(secs: f64) -> Option<Duration> {
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs.min(3600.0)))
    } else {
        None
    }
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn send_frame(ws: &mut GatewaySocket, frame: serde_json::Value) -> Result<(), ChannelError> {
    ws.send(Message::Text(frame.to_string()))
        .await
        .map_err(|e| ChannelError::Other(format!("gateway write failed: {}", e)))
}

async fn check_status(res: reqwest::Response) -> Result<reqwest::Response, ChannelError> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status().as_u16();
    let body = res.text().await.unwrap_or_default();
    Err(ChannelError::Api { status, body })
}

async fn run_gateway_loop(channel: Arc<DiscordChannel>, events_tx: mpsc::Sender<ChannelEvent>) {
    while channel.running() {
        match channel.run_session(&events_tx).await {
            Ok(SessionEnd::Stopped) => break,
            Ok(SessionEnd::ReceiverClosed) => {
                log::debug!("discord: event channel closed, stopping loop");
                return;
            }
            Ok(SessionEnd::Reconnect) => {
                log::info!("discord: reconnecting in {}s", RECONNECT_DELAY.as_secs());
            }
            Err(ChannelError::NotConfigured(what)) => {
                log::warn!("discord: {} not configured, gateway loop stopped", what);
                return;
            }
            Err(e) => {
                log::warn!("discord gateway error: {}", e);
            }
        }
        if !channel.running() {
            break;
        }
        tokio::select! {
            _ = channel.shutdown.notified() => break,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
    log::info!("discord channel: gateway loop stopped");
}

#[async_trait]
impl ChannelClient for DiscordChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, channel_id: &str, text: &str) -> Result<(), ChannelError> {
        let body = json!({
            "content": text,
            "allowed_mentions": { "parse": ["users"] },
        });
        self.post_message(channel_id, body).await
    }

    async fn reply(
        &self,
        channel_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        let body = json!({
            "content": text,
            "allowed_mentions": { "parse": ["users"] },
            "message_reference": { "message_id": message_id, "fail_if_not_exists": false },
        });
        self.post_message(channel_id, body).await
    }

    async fn fetch_history(
        &self,
        channel_id: &str,
        before_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, ChannelError> {
        let limit = limit.clamp(1, MAX_HISTORY_PAGE);
        let mut url = format!(
            "{}/channels/{}/messages?limit={}",
            self.api_base, channel_id, limit
        );
        if let Some(before) = before_id {
            url = format!("{}&before={}", url, before);
        }
        let page: Vec<DiscordMessage> = self.execute(|| self.client.get(&url)).await?.json().await?;
        Ok(history_from_page(page))
    }

    async fn typing(&self, channel_id: &str) -> Result<(), ChannelError> {
        let url = format!("{}/channels/{}/typing", self.api_base, channel_id);
        self.execute(|| self.client.post(&url)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_json(id: &str, author: serde_json::Value, content: &str) -> serde_json::Value {
        json!({
            "id": id,
            "channel_id": "c1",
            "author": author,
            "content": content,
            "timestamp": "2024-05-01T12:00:00.000000+00:00",
        })
    }

    #[test]
    fn message_create_becomes_inbound_message() {
        let mut data = message_json(
            "m1",
            json!({ "id": "u1", "username": "alice", "global_name": "Alice" }),
            "<@42> hello",
        );
        data["mentions"] = json!([{ "id": "42", "username": "relay", "bot": true }]);
        let event = parse_dispatch(Some("MESSAGE_CREATE"), data);
        let Some(ChannelEvent::Message(msg)) = event else {
            panic!("expected message event, got {:?}", event);
        };
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.channel_id, "c1");
        assert_eq!(msg.author_id, "u1");
        assert_eq!(msg.author_name, "Alice");
        assert!(!msg.author_is_automated);
        assert!(msg.mentioned_user_ids.contains("42"));
        assert_eq!(msg.text, "<@42> hello");
    }

    #[test]
    fn ready_yields_self_id() {
        let data = json!({ "v": 10, "user": { "id": "42", "username": "relay", "bot": true } });
        match parse_dispatch(Some("READY"), data) {
            Some(ChannelEvent::Ready { self_id }) => assert_eq!(self_id, "42"),
            other => panic!("expected ready, got {:?}", other),
        }
    }

    #[test]
    fn unknown_dispatch_is_ignored() {
        assert!(parse_dispatch(Some("TYPING_START"), json!({})).is_none());
        assert!(parse_dispatch(None, json!({})).is_none());
    }

    #[test]
    fn display_name_prefers_nick_then_global_name() {
        let mut data = message_json(
            "m1",
            json!({ "id": "u1", "username": "alice", "global_name": "Alice" }),
            "hi",
        );
        data["member"] = json!({ "nick": "Al" });
        let msg: DiscordMessage = serde_json::from_value(data).unwrap();
        assert_eq!(msg.author_display_name(), "Al");

        let data = message_json("m2", json!({ "id": "u1", "username": "alice" }), "hi");
        let msg: DiscordMessage = serde_json::from_value(data).unwrap();
        assert_eq!(msg.author_display_name(), "alice");
    }

    #[test]
    fn webhook_messages_count_as_automated() {
        let mut data = message_json("m1", json!({ "id": "w1", "username": "hook" }), "hi");
        data["webhook_id"] = json!("w1");
        let msg: DiscordMessage = serde_json::from_value(data).unwrap();
        assert!(msg.is_automated());
    }

    #[test]
    fn history_page_is_reversed_to_oldest_first() {
        let page: Vec<DiscordMessage> = serde_json::from_value(json!([
            message_json("3", json!({ "id": "u1", "username": "a" }), "third"),
            message_json("2", json!({ "id": "u2", "username": "b", "bot": true }), "second"),
            message_json("1", json!({ "id": "u1", "username": "a" }), "first"),
        ]))
        .unwrap();
        let history = history_from_page(page);
        let ids: Vec<&str> = history.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert!(history[1].author_is_automated);
    }

    #[test]
    fn identify_frame_requests_message_content_intent() {
        let frame = identify_frame("tok");
        assert_eq!(frame["op"], json!(OP_IDENTIFY));
        assert_eq!(frame["d"]["token"], json!("tok"));
        let intents = frame["d"]["intents"].as_u64().unwrap();
        assert_ne!(intents & (1 << 15), 0);
        assert_ne!(intents & (1 << 9), 0);
    }

    #[test]
    fn heartbeat_carries_last_sequence() {
        assert_eq!(heartbeat_frame(Some(7)), json!({ "op": 1, "d": 7 }));
        assert_eq!(heartbeat_frame(None), json!({ "op": 1, "d": null }));
    }

    #[tokio::test]
    async fn rest_calls_without_token_are_not_configured() {
        let channel = DiscordChannel::new(None, None);
        let err = channel.send("c1", "hi").await.unwrap_err();
        assert!(matches!(err, ChannelError::NotConfigured(_)));
    }

    #[test]
    fn retry_after_is_read_from_the_body() {
        let body = r#"{"message":"You are being rate limited.","retry_after":0.25,"global":false}"#;
        assert_eq!(retry_after_body(body), Some(Duration::from_millis(250)));
        assert_eq!(retry_after_body("not json"), None);
        assert_eq!(retry_after_body(r#"{"retry_after":-1}"#), None);
    }
}
