//! Context assembly for reply generation.
//!
//! Turns the raw channel tail into the two halves of a completion request:
//! a strictly alternating message sequence, and a system prompt that layers
//! retrieved memory on top of the static persona.

use std::sync::Arc;

use tracing::warn;

use crate::config::BotConfig;
use crate::llm::{ChatMessage, Role};
use crate::memory::Retriever;
use crate::transport::{ChannelMessage, Participant};

/// Messages pulled into the conversation sequence.
const CONTEXT_WINDOW: usize = 20;

/// Appended to the final user turn when the bot was addressed directly.
const MENTION_DIRECTIVE: &str = "\n[You were @mentioned directly - respond to this person.]";

const DEFAULT_PERSONA: &str = include_str!("../Prompts/persona.md");

const MEMORY_PREAMBLE: &str = "You remember the following from past conversations. \
Use them naturally when relevant but never mention having a memory system or database:";

/// Builds the message sequence and system prompt for each reply.
pub struct ContextAssembler {
    persona: String,
    retriever: Option<Arc<Retriever>>,
}

impl ContextAssembler {
    /// Load the persona (custom file if configured, built-in otherwise) and
    /// attach the retriever. `None` for the retriever means the memory store
    /// is disabled and the persona is used as-is.
    #[must_use]
    pub fn new(config: &BotConfig, retriever: Option<Arc<Retriever>>) -> Self {
        let persona = match &config.persona.prompt_path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(text) => text.trim().to_owned(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "persona file unreadable, using built-in");
                    DEFAULT_PERSONA.trim().to_owned()
                }
            },
            None => DEFAULT_PERSONA.trim().to_owned(),
        };
        Self { persona, retriever }
    }

    /// Build the alternating message sequence from the channel tail.
    ///
    /// The bot's own messages become unprefixed assistant turns; everyone
    /// else becomes a user turn prefixed with their display name. Consecutive
    /// same-role turns merge, blank turns drop, and the sequence is trimmed
    /// to start and end on a user turn. An empty result means there is
    /// nothing to reply to.
    #[must_use]
    pub fn conversation(&self, recent: &[ChannelMessage], mentioned: bool) -> Vec<ChatMessage> {
        let start = recent.len().saturating_sub(CONTEXT_WINDOW);
        let mut sequence: Vec<ChatMessage> = Vec::new();

        for message in &recent[start..] {
            let text = message.content.trim();
            if text.is_empty() {
                continue;
            }
            let (role, entry) = if message.is_self {
                (Role::Assistant, text.to_owned())
            } else {
                (Role::User, format!("{}: {}", message.author_name, text))
            };
            match sequence.last_mut() {
                Some(last) if last.role == role => {
                    last.content.push('\n');
                    last.content.push_str(&entry);
                }
                _ => sequence.push(ChatMessage { role, content: entry }),
            }
        }

        // The completion call requires the sequence to open and close on a
        // user turn. Merging above means at most one entry each end.
        if sequence
            .first()
            .is_some_and(|m| m.role == Role::Assistant)
        {
            sequence.remove(0);
        }
        if sequence.last().is_some_and(|m| m.role == Role::Assistant) {
            sequence.pop();
        }

        if mentioned && let Some(last) = sequence.last_mut() {
            last.content.push_str(MENTION_DIRECTIVE);
        }

        sequence
    }

    /// Build the system prompt: persona text plus any retrieved memory.
    ///
    /// Without a retriever, or when retrieval comes back empty, the persona
    /// is returned unchanged.
    pub async fn system_prompt(
        &self,
        participants: &[Participant],
        recent: &[ChannelMessage],
        channel_id: &str,
    ) -> String {
        let Some(retriever) = self.retriever.as_ref() else {
            return self.persona.clone();
        };

        let (facts, summaries) = retriever.retrieve(participants, recent, channel_id).await;
        let sentiment = retriever.sentiment_framing(participants);
        if facts.is_empty() && summaries.is_empty() && sentiment.is_empty() {
            return self.persona.clone();
        }

        let mut prompt = self.persona.clone();
        prompt.push_str("\n\n");
        prompt.push_str(MEMORY_PREAMBLE);
        if !facts.is_empty() {
            prompt.push_str("\n\nThings you know:\n");
            prompt.push_str(&facts.join("\n"));
        }
        if !summaries.is_empty() {
            prompt.push_str("\n\nPast conversations:\n");
            prompt.push_str(&summaries.join("\n"));
        }
        if !sentiment.is_empty() {
            prompt.push_str("\n\nHow you feel about people:\n");
            prompt.push_str(&sentiment.join("\n"));
        }
        prompt
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
