//! Engagement controller: decides whether the bot speaks at all.
//!
//! Three ways in: a direct address (mention or permitted DM), a follow-up
//! inside the engagement window after the bot's own reply, or a rare
//! keyword-boosted chime-in. Every failure path degrades to staying silent.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::BotConfig;
use crate::llm::{ChatMessage, LlmClient};
use crate::memory::types::now_epoch_secs;
use crate::transport::{ChannelMessage, ChatTransport};

/// Messages shown to the relevance check.
const RELEVANCE_TAIL: usize = 5;

const RELEVANCE_PROMPT: &str = "You are a chat bot deciding whether to keep talking. \
Given the last few messages of a channel, answer YES if the newest message is still \
part of the conversation you were engaged in, and NO otherwise. \
Answer with YES or NO only.";

/// Outcome of the engagement decision for one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engagement {
    /// Explicit mention or permitted direct message. Bypasses every other
    /// check.
    Mentioned,
    /// Follow-up inside the engagement window.
    Engaged,
    /// Unprompted probabilistic chime-in.
    ChimeIn,
    /// Stay silent.
    Pass,
}

impl Engagement {
    /// Whether this outcome produces a reply.
    #[must_use]
    pub fn responds(self) -> bool {
        !matches!(self, Self::Pass)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ChannelState {
    /// Most recent bot reply, epoch seconds. Zero means never.
    last_engaged_at: u64,
    /// Most recent unprompted chime-in, epoch seconds. Zero means never.
    last_unprompted_at: u64,
}

/// Per-channel engagement state machine. Owned by the coordinator; state is
/// transient and resets on restart.
pub struct EngagementController {
    window_secs: u64,
    grace_secs: u64,
    cooldown_secs: u64,
    base_chance: f64,
    keyword_chance: f64,
    keywords: Vec<String>,
    allow_dms: bool,
    relevance_max_tokens: u32,
    llm: Option<LlmClient>,
    transport: Arc<dyn ChatTransport>,
    channels: HashMap<String, ChannelState>,
}

impl EngagementController {
    #[must_use]
    pub fn new(
        config: &BotConfig,
        llm: Option<LlmClient>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        let keywords = config
            .engagement
            .keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self {
            window_secs: config.engagement.window_secs,
            grace_secs: config.engagement.grace_secs,
            cooldown_secs: config.engagement.chime_in_cooldown_secs,
            base_chance: config.engagement.base_chime_in_chance,
            keyword_chance: config.engagement.keyword_chime_in_chance,
            keywords,
            allow_dms: config.discord.allow_dms,
            relevance_max_tokens: config.llm.relevance_max_tokens,
            llm,
            transport,
            channels: HashMap::new(),
        }
    }

    /// Decide whether to respond to one inbound message.
    pub async fn decide(&mut self, message: &ChannelMessage) -> Engagement {
        self.decide_at(message, now_epoch_secs(), rand::random::<f64>())
            .await
    }

    /// Record a successful bot reply, re-opening the engagement window.
    pub fn note_reply(&mut self, channel_id: &str, now: u64) {
        self.channels
            .entry(channel_id.to_owned())
            .or_default()
            .last_engaged_at = now;
    }

    async fn decide_at(&mut self, message: &ChannelMessage, now: u64, roll: f64) -> Engagement {
        // The bot's own messages and other bots never engage the controller.
        if message.is_bot {
            return Engagement::Pass;
        }

        if message.is_direct {
            return if self.allow_dms {
                Engagement::Mentioned
            } else {
                Engagement::Pass
            };
        }
        if message.mentions_me {
            return Engagement::Mentioned;
        }

        let state = self
            .channels
            .get(&message.channel_id)
            .copied()
            .unwrap_or_default();

        if state.last_engaged_at > 0 {
            let engaged_age = now.saturating_sub(state.last_engaged_at);
            if engaged_age < self.window_secs {
                if engaged_age < self.grace_secs {
                    // Directed follow-up right after the bot spoke.
                    return Engagement::Engaged;
                }
                return if self.is_relevant(&message.channel_id).await {
                    Engagement::Engaged
                } else {
                    Engagement::Pass
                };
            }
            // Window expired: drop the stale engagement mark.
            if let Some(entry) = self.channels.get_mut(&message.channel_id) {
                entry.last_engaged_at = 0;
            }
        }

        let chance = if self.matches_keyword(&message.content) {
            self.keyword_chance
        } else {
            self.base_chance
        };
        let cooldown_elapsed = state.last_unprompted_at == 0
            || now.saturating_sub(state.last_unprompted_at) >= self.cooldown_secs;
        if roll < chance && cooldown_elapsed {
            self.channels
                .entry(message.channel_id.clone())
                .or_default()
                .last_unprompted_at = now;
            return Engagement::ChimeIn;
        }
        Engagement::Pass
    }

    /// Cheap YES/NO continuation check over the channel tail. Any failure
    /// (no client, history fetch error, transport error, non-YES answer)
    /// means NO.
    async fn is_relevant(&self, channel_id: &str) -> bool {
        let Some(llm) = self.llm.as_ref() else {
            return false;
        };
        let tail = match self
            .transport
            .recent_messages(channel_id, RELEVANCE_TAIL)
            .await
        {
            Ok(tail) => tail,
            Err(e) => {
                debug!(error = %e, "relevance history fetch failed, staying silent");
                return false;
            }
        };
        if tail.is_empty() {
            return false;
        }
        let transcript = tail
            .iter()
            .map(|m| format!("{}: {}", m.author_name, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        match llm
            .complete(
                Some(RELEVANCE_PROMPT),
                &[ChatMessage::user(transcript)],
                self.relevance_max_tokens,
            )
            .await
        {
            Ok(answer) => answer.trim().to_ascii_uppercase().starts_with("YES"),
            Err(e) => {
                debug!(error = %e, "relevance check failed, staying silent");
                false
            }
        }
    }

    fn matches_keyword(&self, content: &str) -> bool {
        if self.keywords.is_empty() {
            return false;
        }
        let lower = content.to_lowercase();
        self.keywords.iter().any(|k| lower.contains(k.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::LlmConfig;
    use crate::error::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Transport that serves a fixed history and swallows sends.
    struct FixedHistory(Vec<ChannelMessage>);

    #[async_trait]
    impl ChatTransport for FixedHistory {
        async fn recent_messages(
            &self,
            _channel_id: &str,
            limit: usize,
        ) -> Result<Vec<ChannelMessage>> {
            let start = self.0.len().saturating_sub(limit);
            Ok(self.0[start..].to_vec())
        }

        async fn send_message(&self, _channel_id: &str, _text: &str) -> Result<()> {
            Ok(())
        }

        async fn trigger_typing(&self, _channel_id: &str) -> Result<()> {
            Ok(())
        }

        async fn add_reaction(
            &self,
            _channel_id: &str,
            _message_id: &str,
            _emoji: &str,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn message(channel_id: &str, content: &str) -> ChannelMessage {
        ChannelMessage {
            channel_id: channel_id.to_owned(),
            message_id: "m1".to_owned(),
            guild_id: Some("g1".to_owned()),
            author_id: "u1".to_owned(),
            author_name: "Dave".to_owned(),
            content: content.to_owned(),
            is_self: false,
            is_bot: false,
            mentions_me: false,
            is_direct: false,
            timestamp: 0,
        }
    }

    fn controller(llm: Option<LlmClient>, history: Vec<ChannelMessage>) -> EngagementController {
        EngagementController::new(&BotConfig::default(), llm, Arc::new(FixedHistory(history)))
    }

    fn mock_client(base_url: &str) -> LlmClient {
        let config = LlmConfig {
            api_key: "test-key".to_owned(),
            base_url: base_url.to_owned(),
            ..LlmConfig::default()
        };
        LlmClient::from_config(&config)
            .expect("client")
            .expect("key set")
    }

    fn text_response(text: &str) -> serde_json::Value {
        json!({
            "content": [{"type": "text", "text": text}],
            "stop_reason": "end_turn"
        })
    }

    #[tokio::test]
    async fn mention_bypasses_every_check() {
        let mut ctl = controller(None, vec![]);
        let mut msg = message("c1", "oi bot");
        msg.mentions_me = true;

        // Even with the worst roll and no model, a mention responds.
        assert_eq!(ctl.decide_at(&msg, 1_000, 0.99).await, Engagement::Mentioned);
    }

    #[tokio::test]
    async fn dms_gated_by_config() {
        let mut ctl = controller(None, vec![]);
        let mut msg = message("c1", "hello");
        msg.is_direct = true;
        assert_eq!(ctl.decide_at(&msg, 1_000, 0.99).await, Engagement::Pass);

        let mut config = BotConfig::default();
        config.discord.allow_dms = true;
        let mut ctl = EngagementController::new(&config, None, Arc::new(FixedHistory(vec![])));
        assert_eq!(ctl.decide_at(&msg, 1_000, 0.99).await, Engagement::Mentioned);
    }

    #[tokio::test]
    async fn other_bots_never_engage() {
        let mut ctl = controller(None, vec![]);
        let mut msg = message("c1", "banter bot noob");
        msg.is_bot = true;
        msg.mentions_me = true;
        assert_eq!(ctl.decide_at(&msg, 1_000, 0.0).await, Engagement::Pass);
    }

    #[tokio::test]
    async fn grace_window_continues_without_model() {
        let mut ctl = controller(None, vec![]);
        ctl.note_reply("c1", 1_000);

        let msg = message("c1", "and another thing");
        // 20s after the reply: inside grace, no relevance call needed.
        assert_eq!(ctl.decide_at(&msg, 1_020, 0.99).await, Engagement::Engaged);
    }

    #[tokio::test]
    async fn beyond_grace_without_model_stays_silent() {
        let mut ctl = controller(None, vec![message("c1", "earlier")]);
        ctl.note_reply("c1", 1_000);

        let msg = message("c1", "so anyway");
        // 50s after: inside the window but past grace; no client means NO.
        assert_eq!(ctl.decide_at(&msg, 1_050, 0.99).await, Engagement::Pass);
    }

    #[tokio::test]
    async fn relevance_yes_continues_the_conversation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_response("YES")))
            .expect(1)
            .mount(&server)
            .await;

        let history = vec![
            message("c1", "earlier"),
            message("c1", "what about the other one"),
        ];
        let mut ctl = controller(Some(mock_client(&server.uri())), history);
        ctl.note_reply("c1", 1_000);

        let msg = message("c1", "what about the other one");
        assert_eq!(ctl.decide_at(&msg, 1_050, 0.99).await, Engagement::Engaged);
    }

    #[tokio::test]
    async fn relevance_non_yes_answer_stays_silent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_response("No, unrelated.")))
            .expect(1)
            .mount(&server)
            .await;

        let mut ctl = controller(
            Some(mock_client(&server.uri())),
            vec![message("c1", "completely new topic")],
        );
        ctl.note_reply("c1", 1_000);

        let msg = message("c1", "completely new topic");
        assert_eq!(ctl.decide_at(&msg, 1_050, 0.99).await, Engagement::Pass);
    }

    #[tokio::test]
    async fn relevance_error_stays_silent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let mut ctl = controller(Some(mock_client(&server.uri())), vec![message("c1", "hm")]);
        ctl.note_reply("c1", 1_000);

        let msg = message("c1", "hm");
        assert_eq!(ctl.decide_at(&msg, 1_050, 0.99).await, Engagement::Pass);
    }

    #[tokio::test]
    async fn empty_history_fails_the_relevance_check() {
        let server = MockServer::start().await;
        // No mock mounted: the check must not even reach the model.
        let mut ctl = controller(Some(mock_client(&server.uri())), vec![]);
        ctl.note_reply("c1", 1_000);

        let msg = message("c1", "anything");
        assert_eq!(ctl.decide_at(&msg, 1_050, 0.99).await, Engagement::Pass);
    }

    #[tokio::test]
    async fn keyword_boosts_chime_chance() {
        let mut ctl = controller(None, vec![]);

        // 0.1 clears the boosted 0.15 but not the base 0.02.
        let keyword_msg = message("c1", "you absolute NOOB");
        assert_eq!(
            ctl.decide_at(&keyword_msg, 1_000, 0.10).await,
            Engagement::ChimeIn
        );

        let plain_msg = message("c2", "morning all");
        assert_eq!(ctl.decide_at(&plain_msg, 1_000, 0.10).await, Engagement::Pass);
    }

    #[tokio::test]
    async fn base_rate_chime_and_cooldown() {
        let mut ctl = controller(None, vec![]);
        let msg = message("c1", "quiet in here");

        assert_eq!(ctl.decide_at(&msg, 1_000, 0.01).await, Engagement::ChimeIn);
        // 50s later: cooldown (120s) still running, even with a lucky roll.
        assert_eq!(ctl.decide_at(&msg, 1_050, 0.001).await, Engagement::Pass);
        // 120s after the first chime the cooldown has elapsed.
        assert_eq!(ctl.decide_at(&msg, 1_120, 0.01).await, Engagement::ChimeIn);
    }

    #[tokio::test]
    async fn cooldowns_are_per_channel() {
        let mut ctl = controller(None, vec![]);

        assert_eq!(
            ctl.decide_at(&message("c1", "hello"), 1_000, 0.01).await,
            Engagement::ChimeIn
        );
        // A different channel has its own cooldown clock.
        assert_eq!(
            ctl.decide_at(&message("c2", "hello"), 1_010, 0.01).await,
            Engagement::ChimeIn
        );
    }

    #[tokio::test]
    async fn expired_window_falls_through_to_chime_roll() {
        let mut ctl = controller(None, vec![]);
        ctl.note_reply("c1", 1_000);

        let msg = message("c1", "old topic");
        // 200s later the window (120s) is gone; an unlucky roll passes.
        assert_eq!(ctl.decide_at(&msg, 1_200, 0.99).await, Engagement::Pass);
        // A lucky roll chimes in instead of engaging.
        assert_eq!(ctl.decide_at(&msg, 1_201, 0.01).await, Engagement::ChimeIn);
    }

    #[tokio::test]
    async fn reply_reopens_the_window() {
        let mut ctl = controller(None, vec![]);
        let msg = message("c1", "nice one");

        assert_eq!(ctl.decide_at(&msg, 1_000, 0.99).await, Engagement::Pass);
        ctl.note_reply("c1", 1_000);
        assert_eq!(ctl.decide_at(&msg, 1_010, 0.99).await, Engagement::Engaged);
    }
}
