//! Episode segmentation and summarization.
//!
//! Every tracked message lands in a per-channel buffer. A long silence
//! closes the buffered run before the new message is appended; a volume
//! limit closes it right after. Closed runs that are too short, or in which
//! the bot never spoke, are dropped. The rest are summarized by the model
//! and persisted as episodic summaries, off the message-handling path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::EpisodeConfig;
use crate::embedding::SharedEmbedder;
use crate::error::Result;
use crate::llm::{ChatMessage, LlmClient};
use crate::memory::store::{MemoryStore, NewSummary};

/// The episode summary system prompt (loaded from `Prompts/episode_summary.md`).
const SUMMARY_PROMPT: &str = include_str!("../Prompts/episode_summary.md");

/// One buffered message record.
#[derive(Debug, Clone)]
pub struct EpisodeMessage {
    pub author_name: String,
    pub author_id: String,
    pub content: String,
    pub is_bot: bool,
    /// When the record was buffered, local clock epoch seconds. Drives the
    /// gap trigger.
    pub seen_at: u64,
    /// The message's own timestamp, epoch seconds. Drives the stored
    /// episode bounds.
    pub sent_at: u64,
}

/// A closed run of buffered messages that qualifies for summarization.
#[derive(Debug, Clone)]
pub struct Episode {
    pub channel_id: String,
    pub messages: Vec<EpisodeMessage>,
}

#[derive(Debug, Default)]
struct ChannelBuffer {
    messages: Vec<EpisodeMessage>,
    counter: usize,
}

/// Per-channel episode state machine. Owned by the coordinator; not
/// internally synchronized.
#[derive(Debug)]
pub struct EpisodeTracker {
    gap_secs: u64,
    flush_volume: usize,
    min_messages: usize,
    buffers: HashMap<String, ChannelBuffer>,
}

impl EpisodeTracker {
    #[must_use]
    pub fn new(config: &EpisodeConfig) -> Self {
        Self {
            gap_secs: config.gap_secs,
            flush_volume: config.flush_volume,
            min_messages: config.min_messages,
            buffers: HashMap::new(),
        }
    }

    /// Record one message and return any episodes it closed.
    ///
    /// The gap trigger is checked before the message is appended, so a
    /// message arriving after a long silence closes the previous run and
    /// starts a fresh one containing only itself. The volume trigger is
    /// checked after the append.
    pub fn observe(&mut self, channel_id: &str, message: EpisodeMessage) -> Vec<Episode> {
        let mut closed = Vec::new();

        let gap_expired = self.buffers.get(channel_id).is_some_and(|buffer| {
            buffer.messages.last().is_some_and(|last| {
                message.seen_at.saturating_sub(last.seen_at) > self.gap_secs
            })
        });
        if gap_expired && let Some(episode) = self.flush(channel_id) {
            closed.push(episode);
        }

        let volume_reached = {
            let buffer = self.buffers.entry(channel_id.to_owned()).or_default();
            buffer.messages.push(message);
            buffer.counter += 1;
            buffer.counter >= self.flush_volume
        };
        if volume_reached && let Some(episode) = self.flush(channel_id) {
            closed.push(episode);
        }

        closed
    }

    /// Close the buffer for one channel. Runs that are too short or that
    /// the bot never took part in are dropped silently.
    fn flush(&mut self, channel_id: &str) -> Option<Episode> {
        let buffer = self.buffers.get_mut(channel_id)?;
        let messages = std::mem::take(&mut buffer.messages);
        buffer.counter = 0;

        if messages.len() < self.min_messages {
            debug!(channel_id, count = messages.len(), "episode too short, dropped");
            return None;
        }
        if !messages.iter().any(|m| m.is_bot) {
            debug!(channel_id, "episode without bot participation, dropped");
            return None;
        }
        Some(Episode {
            channel_id: channel_id.to_owned(),
            messages,
        })
    }
}

/// Turns closed episodes into stored summaries.
pub struct EpisodeSummarizer {
    store: Arc<MemoryStore>,
    llm: LlmClient,
    embedder: Option<SharedEmbedder>,
    max_tokens: u32,
}

impl EpisodeSummarizer {
    pub fn new(
        store: Arc<MemoryStore>,
        llm: LlmClient,
        embedder: Option<SharedEmbedder>,
        max_tokens: u32,
    ) -> Self {
        Self {
            store,
            llm,
            embedder,
            max_tokens,
        }
    }

    /// Ask the model for a short abstractive summary and persist it.
    ///
    /// # Errors
    ///
    /// Returns an error when the model call or the store write fails.
    pub async fn summarize(&self, episode: Episode) -> Result<()> {
        let (Some(first), Some(last)) = (episode.messages.first(), episode.messages.last())
        else {
            return Ok(());
        };
        let started_at = first.sent_at;
        let ended_at = last.sent_at;

        let raw = self
            .llm
            .complete(
                Some(SUMMARY_PROMPT),
                &[ChatMessage::user(transcript(&episode))],
                self.max_tokens,
            )
            .await?;
        let summary = raw.trim();
        if summary.is_empty() {
            warn!(channel_id = %episode.channel_id, "empty episode summary, dropped");
            return Ok(());
        }

        let embedding = match self.embedder.as_ref() {
            Some(embedder) => match embedder.embed(summary).await {
                Ok(vector) => Some(vector),
                Err(e) => {
                    warn!(error = %e, "summary embedding failed");
                    None
                }
            },
            None => None,
        };

        let participant_ids = participant_ids(&episode);
        let id = self.store.insert_summary(&NewSummary {
            channel_id: &episode.channel_id,
            summary,
            participant_ids: &participant_ids,
            message_count: episode.messages.len() as i64,
            started_at,
            ended_at,
            embedding: embedding.as_deref(),
        })?;
        info!(summary_id = id, channel_id = %episode.channel_id, "episodic summary stored");
        Ok(())
    }
}

/// Transcript handed to the model. Blank messages are dropped.
fn transcript(episode: &Episode) -> String {
    episode
        .messages
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| format!("{}: {}", m.author_name, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Unique non-bot author ids, first-seen order.
fn participant_ids(episode: &Episode) -> Vec<String> {
    let mut seen = HashSet::new();
    episode
        .messages
        .iter()
        .filter(|m| !m.is_bot)
        .filter(|m| seen.insert(m.author_id.clone()))
        .map(|m| m.author_id.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
