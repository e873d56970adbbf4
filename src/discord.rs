//! Discord transport: gateway websocket for inbound events, REST for
//! everything outbound.
//!
//! Unlike the engagement gate upstream, the transport filters nothing:
//! the bot's own messages and other bots' messages are forwarded with
//! flags set, because episode tracking needs to see them.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::error::{BanterError, Result};
use crate::memory::types::now_epoch_secs;
use crate::transport::{ChannelMessage, ChatTransport};

const API_BASE: &str = "https://discord.com/api/v10";

/// GUILDS | GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT
const GATEWAY_INTENTS: u64 = 1 | 512 | 4_096 | 32_768;

const RECONNECT_MIN: Duration = Duration::from_secs(2);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Discord client speaking gateway v10 + REST v10.
pub struct DiscordTransport {
    token: String,
    bot_user_id: String,
    client: reqwest::Client,
}

impl DiscordTransport {
    #[must_use]
    pub fn new(token: String) -> Self {
        let bot_user_id = bot_user_id_from_token(&token).unwrap_or_default();
        if bot_user_id.is_empty() {
            warn!("could not derive bot user id from token; self-detection degraded");
        }
        Self {
            token,
            bot_user_id,
            client: reqwest::Client::new(),
        }
    }

    /// Pump gateway events into `inbound` until the receiver is dropped,
    /// reconnecting with capped exponential backoff on any session failure.
    pub async fn run(&self, inbound: mpsc::Sender<ChannelMessage>) {
        let mut backoff = RECONNECT_MIN;
        loop {
            let session_start = Instant::now();
            if let Err(e) = self.connect_and_pump(&inbound).await {
                if inbound.is_closed() {
                    info!("inbound channel closed, gateway task exiting");
                    return;
                }
                warn!(error = %e, "gateway session ended, reconnecting");
            }
            // A session that held for a while earns a fresh backoff.
            if session_start.elapsed() >= RECONNECT_MAX {
                backoff = RECONNECT_MIN;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }

    async fn connect_and_pump(&self, inbound: &mpsc::Sender<ChannelMessage>) -> Result<()> {
        let gateway_resp: Value = self
            .client
            .get(format!("{API_BASE}/gateway/bot"))
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| BanterError::Discord(format!("gateway discovery failed: {e}")))?
            .json()
            .await
            .map_err(|e| BanterError::Discord(format!("gateway discovery parse failed: {e}")))?;
        let gateway_url = gateway_resp
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or("wss://gateway.discord.gg");
        let ws_url = format!("{gateway_url}/?v=10&encoding=json");

        let (stream, _) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .map_err(|e| BanterError::Discord(format!("gateway connect failed: {e}")))?;
        let (mut write, mut read) = stream.split();

        let hello = read
            .next()
            .await
            .ok_or_else(|| BanterError::Discord("gateway closed before hello".to_owned()))?
            .map_err(|e| BanterError::Discord(format!("gateway hello failed: {e}")))?;
        let Message::Text(hello_text) = hello else {
            return Err(BanterError::Discord("unexpected hello payload".to_owned()));
        };
        let hello_json: Value = serde_json::from_str(&hello_text)
            .map_err(|e| BanterError::Discord(format!("hello parse failed: {e}")))?;
        let heartbeat_interval_ms = hello_json
            .get("d")
            .and_then(|v| v.get("heartbeat_interval"))
            .and_then(Value::as_u64)
            .unwrap_or(41_250);

        let identify = json!({
            "op": 2,
            "d": {
                "token": self.token,
                "intents": GATEWAY_INTENTS,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "banter",
                    "device": "banter"
                }
            }
        });
        write
            .send(Message::Text(identify.to_string()))
            .await
            .map_err(|e| BanterError::Discord(format!("identify failed: {e}")))?;
        info!(heartbeat_ms = heartbeat_interval_ms, "gateway session established");

        let (hb_tx, mut hb_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(heartbeat_interval_ms));
            loop {
                interval.tick().await;
                if hb_tx.send(()).await.is_err() {
                    break;
                }
            }
        });

        let mut last_seq: Option<u64> = None;
        loop {
            tokio::select! {
                _ = hb_rx.recv() => {
                    let heartbeat = json!({"op": 1, "d": last_seq});
                    if write.send(Message::Text(heartbeat.to_string())).await.is_err() {
                        return Err(BanterError::Discord("heartbeat send failed".to_owned()));
                    }
                }
                maybe_msg = read.next() => {
                    let raw = match maybe_msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(BanterError::Discord("gateway closed".to_owned()));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            return Err(BanterError::Discord(format!("gateway read failed: {e}")));
                        }
                    };

                    let payload: Value = match serde_json::from_str(&raw) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    if let Some(seq) = payload.get("s").and_then(Value::as_u64) {
                        last_seq = Some(seq);
                    }
                    if payload.get("t").and_then(Value::as_str) != Some("MESSAGE_CREATE") {
                        continue;
                    }
                    let Some(data) = payload.get("d") else { continue };
                    let Some(message) = parse_message_create(data, &self.bot_user_id) else {
                        continue;
                    };
                    if inbound.send(message).await.is_err() {
                        return Err(BanterError::Discord("inbound channel closed".to_owned()));
                    }
                }
            }
        }
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.token)
    }
}

#[async_trait]
impl ChatTransport for DiscordTransport {
    async fn recent_messages(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<ChannelMessage>> {
        let limit = limit.clamp(1, 100);
        let url = format!("{API_BASE}/channels/{channel_id}/messages?limit={limit}");
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| BanterError::Discord(format!("history fetch failed: {e}")))?;
        let response = expect_success(response, "history fetch").await?;
        let rows: Value = response
            .json()
            .await
            .map_err(|e| BanterError::Discord(format!("history parse failed: {e}")))?;

        // History rows carry no guild id, so their DM flag is meaningless;
        // they never re-enter the engagement gate.
        let mut messages: Vec<ChannelMessage> = rows
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|row| parse_message_create(row, &self.bot_user_id))
                    .collect()
            })
            .unwrap_or_default();
        // The API returns newest first.
        messages.reverse();
        Ok(messages)
    }

    async fn send_message(&self, channel_id: &str, text: &str) -> Result<()> {
        let url = format!("{API_BASE}/channels/{channel_id}/messages");
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth())
            .json(&json!({ "content": text }))
            .send()
            .await
            .map_err(|e| BanterError::Discord(format!("send failed: {e}")))?;
        expect_success(response, "send").await?;
        Ok(())
    }

    async fn trigger_typing(&self, channel_id: &str) -> Result<()> {
        let url = format!("{API_BASE}/channels/{channel_id}/typing");
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| BanterError::Discord(format!("typing failed: {e}")))?;
        expect_success(response, "typing").await?;
        Ok(())
    }

    async fn add_reaction(&self, channel_id: &str, message_id: &str, emoji: &str) -> Result<()> {
        let url = format!(
            "{API_BASE}/channels/{channel_id}/messages/{message_id}/reactions/{}/@me",
            encode_emoji(emoji)
        );
        let response = self
            .client
            .put(&url)
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| BanterError::Discord(format!("reaction failed: {e}")))?;
        expect_success(response, "reaction").await?;
        Ok(())
    }
}

async fn expect_success(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(BanterError::Discord(format!("{what} failed ({status}): {body}")))
}

/// Bot tokens start with the base64url of the bot's user id.
fn bot_user_id_from_token(token: &str) -> Option<String> {
    let first = token.split('.').next()?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(first)
        .ok()?;
    String::from_utf8(decoded).ok()
}

/// Map one MESSAGE_CREATE payload (or REST history row, same shape) into a
/// [`ChannelMessage`]. Returns `None` when the minimum fields are missing.
fn parse_message_create(data: &Value, bot_user_id: &str) -> Option<ChannelMessage> {
    let channel_id = data.get("channel_id")?.as_str()?.to_owned();
    let author = data.get("author")?;
    let author_id = author.get("id")?.as_str()?.to_owned();

    let message_id = data
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let username = author
        .get("username")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let global_name = author.get("global_name").and_then(Value::as_str);
    let nick = data
        .get("member")
        .and_then(|m| m.get("nick"))
        .and_then(Value::as_str);
    let author_name = nick
        .filter(|n| !n.is_empty())
        .or_else(|| global_name.filter(|n| !n.is_empty()))
        .unwrap_or(username)
        .to_owned();

    let guild_id = data
        .get("guild_id")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let is_direct = guild_id.is_none();
    let is_self = !bot_user_id.is_empty() && author_id == bot_user_id;
    let is_bot = is_self
        || author
            .get("bot")
            .and_then(Value::as_bool)
            .unwrap_or(false);

    let content = data
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let mentions_me = !bot_user_id.is_empty()
        && (data
            .get("mentions")
            .and_then(Value::as_array)
            .is_some_and(|arr| {
                arr.iter()
                    .any(|m| m.get("id").and_then(Value::as_str) == Some(bot_user_id))
            })
            || content.contains(&format!("<@{bot_user_id}>"))
            || content.contains(&format!("<@!{bot_user_id}>")));

    let timestamp = data
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .unwrap_or_else(now_epoch_secs);

    Some(ChannelMessage {
        channel_id,
        message_id,
        guild_id,
        author_id,
        author_name,
        content,
        is_self,
        is_bot,
        mentions_me,
        is_direct,
        timestamp,
    })
}

fn parse_timestamp(raw: &str) -> Option<u64> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .and_then(|dt| u64::try_from(dt.timestamp()).ok())
}

/// Percent-encode an emoji for the reaction endpoint path segment.
fn encode_emoji(emoji: &str) -> String {
    let mut out = String::new();
    for byte in emoji.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(*byte as char);
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
