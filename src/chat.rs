//! Top-level message handler.
//!
//! One handler consumes the inbound event stream sequentially and owns every
//! piece of per-channel mutable state (engagement windows, episode buffers),
//! so no locking is needed around them. Slow work (model calls, memory
//! extraction, episode summarization) either happens inline on the reply
//! path, where the user is waiting anyway, or goes to the background queue.
//!
//! Nothing in here is allowed to crash the process: the worst outcome of
//! any failure is that the bot says nothing.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::background::TaskQueue;
use crate::config::BotConfig;
use crate::context::ContextAssembler;
use crate::embedding::SharedEmbedder;
use crate::engagement::EngagementController;
use crate::episodes::{Episode, EpisodeMessage, EpisodeSummarizer, EpisodeTracker};
use crate::llm::LlmClient;
use crate::memory::types::now_epoch_secs;
use crate::memory::{Extractor, MemoryStore, Retriever};
use crate::reply::{BotReply, parse_reply};
use crate::repost::RepostDetector;
use crate::transport::{ChannelMessage, ChatTransport, participants_of};

/// Channel history pulled for each reply.
const HISTORY_LIMIT: usize = 20;

/// Wires the whole pipeline together around one transport.
pub struct ChatHandler {
    transport: Arc<dyn ChatTransport>,
    engagement: EngagementController,
    assembler: ContextAssembler,
    episodes: EpisodeTracker,
    repost: Option<RepostDetector>,
    extractor: Option<Arc<Extractor>>,
    summarizer: Option<Arc<EpisodeSummarizer>>,
    llm: Option<LlmClient>,
    queue: TaskQueue,
    bot_name: String,
    reply_max_tokens: u32,
}

impl ChatHandler {
    /// Assemble the pipeline. Each absent collaborator switches off the
    /// features that need it: no model means no replies, no store means no
    /// memory and no repost ledger, no embedder means recency-only
    /// retrieval.
    #[must_use]
    pub fn new(
        config: &BotConfig,
        transport: Arc<dyn ChatTransport>,
        llm: Option<LlmClient>,
        store: Option<Arc<MemoryStore>>,
        embedder: Option<SharedEmbedder>,
        queue: TaskQueue,
    ) -> Self {
        let retriever = store
            .as_ref()
            .map(|s| Arc::new(Retriever::new(Arc::clone(s), embedder.clone(), &config.memory)));
        let repost = if config.repost.enabled {
            store
                .as_ref()
                .map(|s| RepostDetector::new(Arc::clone(s), &config.repost))
        } else {
            None
        };
        let extractor = match (store.as_ref(), llm.as_ref()) {
            (Some(s), Some(l)) => Some(Arc::new(Extractor::new(
                Arc::clone(s),
                l.clone(),
                embedder.clone(),
                config,
            ))),
            _ => None,
        };
        let summarizer = match (store.as_ref(), llm.as_ref()) {
            (Some(s), Some(l)) => Some(Arc::new(EpisodeSummarizer::new(
                Arc::clone(s),
                l.clone(),
                embedder,
                config.llm.summary_max_tokens,
            ))),
            _ => None,
        };

        Self {
            engagement: EngagementController::new(config, llm.clone(), Arc::clone(&transport)),
            assembler: ContextAssembler::new(config, retriever),
            episodes: EpisodeTracker::new(&config.episodes),
            repost,
            extractor,
            summarizer,
            llm,
            queue,
            bot_name: config.persona.bot_name.clone(),
            reply_max_tokens: config.llm.reply_max_tokens,
            transport,
        }
    }

    /// Consume the inbound stream until the transport drops it.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<ChannelMessage>) {
        while let Some(message) = inbound.recv().await {
            self.handle(message).await;
        }
        info!("inbound stream ended");
    }

    /// Process one inbound message end to end.
    pub async fn handle(&mut self, message: ChannelMessage) {
        // Link ledger first: a repost callout is a service the bot performs,
        // not a conversational choice, so it skips the engagement gate and
        // leaves engagement state untouched.
        if let Some(repost) = self.repost.as_ref()
            && let Some(callout) = repost.check(&message)
        {
            match self
                .transport
                .send_message(&message.channel_id, &callout)
                .await
            {
                Ok(()) => info!(channel_id = %message.channel_id, "repost called out"),
                Err(e) => warn!(error = %e, "repost callout failed"),
            }
        }

        // Episode tracking sees every message, the bot's own included.
        let closed = self
            .episodes
            .observe(&message.channel_id, episode_message(&message));
        self.dispatch_episodes(closed);

        // Without a model there is nothing more to do.
        let Some(llm) = self.llm.clone() else {
            return;
        };

        let decision = self.engagement.decide(&message).await;
        if !decision.responds() {
            return;
        }

        // Best-effort typing indicator while the model thinks.
        if let Err(e) = self.transport.trigger_typing(&message.channel_id).await {
            debug!(error = %e, "typing indicator failed");
        }

        let recent = match self
            .transport
            .recent_messages(&message.channel_id, HISTORY_LIMIT)
            .await
        {
            Ok(recent) if !recent.is_empty() => recent,
            Ok(_) => vec![message.clone()],
            Err(e) => {
                warn!(error = %e, "history fetch failed, skipping reply");
                return;
            }
        };

        let conversation = self.assembler.conversation(&recent, message.mentions_me);
        if conversation.is_empty() {
            return;
        }
        let participants = participants_of(&recent);
        let system = self
            .assembler
            .system_prompt(&participants, &recent, &message.channel_id)
            .await;

        let raw = match llm
            .complete(Some(&system), &conversation, self.reply_max_tokens)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "reply generation failed");
                return;
            }
        };

        match parse_reply(&raw, &self.bot_name) {
            BotReply::Speak(text) => {
                if let Err(e) = self.transport.send_message(&message.channel_id, &text).await {
                    warn!(error = %e, "reply send failed");
                    return;
                }
                self.engagement
                    .note_reply(&message.channel_id, now_epoch_secs());
                info!(
                    channel_id = %message.channel_id,
                    outcome = ?decision,
                    "reply sent"
                );
                self.spawn_extraction(&recent, &text);
            }
            BotReply::React(emoji) => {
                // A reaction acknowledges without inviting follow-ups, so it
                // does not re-open the engagement window.
                if let Err(e) = self
                    .transport
                    .add_reaction(&message.channel_id, &message.message_id, &emoji)
                    .await
                {
                    warn!(error = %e, "reaction failed");
                } else {
                    info!(channel_id = %message.channel_id, "reacted instead of replying");
                }
            }
        }
    }

    fn dispatch_episodes(&self, episodes: Vec<Episode>) {
        let Some(summarizer) = self.summarizer.as_ref() else {
            return;
        };
        for episode in episodes {
            let summarizer = Arc::clone(summarizer);
            self.queue.spawn("episode summary", async move {
                summarizer.summarize(episode).await
            });
        }
    }

    fn spawn_extraction(&self, window: &[ChannelMessage], reply: &str) {
        let Some(extractor) = self.extractor.as_ref() else {
            return;
        };
        let extractor = Arc::clone(extractor);
        let window = window.to_vec();
        let reply = reply.to_owned();
        self.queue.spawn("memory extraction", async move {
            extractor.run(&window, &reply).await
        });
    }
}

fn episode_message(message: &ChannelMessage) -> EpisodeMessage {
    EpisodeMessage {
        author_name: message.author_name.clone(),
        author_id: message.author_id.clone(),
        content: message.content.clone(),
        is_bot: message.is_bot,
        seen_at: now_epoch_secs(),
        sent_at: message.timestamp,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
