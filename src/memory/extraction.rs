//! Post-reply memory extraction.
//!
//! After each successful reply the coordinator hands the conversation window
//! plus the reply to an [`Extractor`] task. The extractor asks the model to
//! propose durable facts and sentiment adjustments, parses the structured
//! response (tolerating fences and stray prose), and merges the proposals
//! into the store. Extraction is best-effort: a parse failure abandons the
//! whole pass with no partial writes, and a failure on one row never aborts
//! the remaining rows.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::BotConfig;
use crate::embedding::{SharedEmbedder, cosine_similarity};
use crate::error::Result;
use crate::llm::{ChatMessage, LlmClient};
use crate::memory::store::{MemoryError, MemoryStore};
use crate::memory::types::{GroupFactCategory, Importance, SentimentScore, clamp_delta};
use crate::transport::{ChannelMessage, Participant, participants_of};

/// The extraction system prompt (loaded from `Prompts/extraction.md` at compile time).
const EXTRACTION_PROMPT: &str = include_str!("../../Prompts/extraction.md");

/// Conversation turns included in the condensed transcript.
const EXTRACTION_WINDOW: usize = 10;

/// Existing rows per scope shown to the model for context.
const EXISTING_FACT_LIMIT: usize = 15;

/// Proposals parsed from one extraction response.
#[derive(Debug, Default, Deserialize)]
struct ExtractionPayload {
    #[serde(default)]
    user_memories: Vec<ProposedUserFact>,
    #[serde(default)]
    bot_memories: Vec<ProposedGroupFact>,
    #[serde(default)]
    sentiment_updates: Vec<ProposedSentiment>,
}

impl ExtractionPayload {
    fn is_empty(&self) -> bool {
        self.user_memories.is_empty()
            && self.bot_memories.is_empty()
            && self.sentiment_updates.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct ProposedUserFact {
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    user_name: String,
    #[serde(default)]
    fact: String,
    #[serde(default = "default_importance")]
    importance: i64,
    #[serde(default)]
    update_existing: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProposedGroupFact {
    #[serde(default)]
    category: String,
    #[serde(default)]
    fact: String,
    #[serde(default)]
    related_user_ids: Option<RelatedIds>,
    #[serde(default = "default_importance")]
    importance: i64,
    #[serde(default)]
    update_existing: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProposedSentiment {
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    delta: f64,
    #[serde(default)]
    reason: String,
}

fn default_importance() -> i64 {
    Importance::Standard.as_i64()
}

/// Related user ids arrive either as a JSON list or a comma-separated string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RelatedIds {
    List(Vec<String>),
    Csv(String),
}

impl RelatedIds {
    fn to_vec(&self) -> Vec<String> {
        match self {
            Self::List(ids) => ids
                .iter()
                .map(|id| id.trim().to_owned())
                .filter(|id| !id.is_empty())
                .collect(),
            Self::Csv(raw) => raw
                .split(',')
                .map(|id| id.trim().to_owned())
                .filter(|id| !id.is_empty())
                .collect(),
        }
    }
}

/// A row whose embedding must be recomputed after a content change.
enum Reembed {
    UserFact(i64, String),
    GroupFact(i64, String),
}

/// Turns one conversation exchange into durable memory writes.
pub struct Extractor {
    store: Arc<MemoryStore>,
    llm: LlmClient,
    embedder: Option<SharedEmbedder>,
    bot_name: String,
    similarity_threshold: f32,
    max_tokens: u32,
}

impl Extractor {
    pub fn new(
        store: Arc<MemoryStore>,
        llm: LlmClient,
        embedder: Option<SharedEmbedder>,
        config: &BotConfig,
    ) -> Self {
        Self {
            store,
            llm,
            embedder,
            bot_name: config.persona.bot_name.clone(),
            similarity_threshold: config.memory.similarity_threshold,
            max_tokens: config.llm.extraction_max_tokens,
        }
    }

    /// Run one extraction pass over a conversation window and the reply the
    /// bot just sent.
    ///
    /// # Errors
    ///
    /// Returns an error only when the model call itself fails. An
    /// unparseable response is not an error: the pass is abandoned with
    /// nothing written.
    pub async fn run(&self, window: &[ChannelMessage], reply: &str) -> Result<()> {
        let start = window.len().saturating_sub(EXTRACTION_WINDOW);
        let tail = &window[start..];
        let participants = participants_of(tail);

        // Everyone in the window gets a sentiment row, lazily at zero.
        for participant in &participants {
            if let Err(e) = self
                .store
                .ensure_sentiment(&participant.user_id, &participant.display_name)
            {
                warn!(user_id = %participant.user_id, error = %e, "sentiment row create failed");
            }
        }

        let user_prompt = build_user_prompt(
            &self.bot_name,
            &participant_map_block(&participants),
            &self.existing_memories_block(&participants),
            &self.sentiment_block(&participants),
            &transcript(tail, reply, &self.bot_name),
        );

        let raw = self
            .llm
            .complete(
                Some(EXTRACTION_PROMPT),
                &[ChatMessage::user(user_prompt)],
                self.max_tokens,
            )
            .await?;

        let payload = parse_extraction_payload(&raw);
        if payload.is_empty() {
            debug!("extraction proposed nothing");
            return Ok(());
        }
        self.apply(payload, &participants).await;
        Ok(())
    }

    /// Merge parsed proposals into the store, one row at a time.
    async fn apply(&self, payload: ExtractionPayload, participants: &[Participant]) {
        let names: HashMap<&str, &str> = participants
            .iter()
            .map(|p| (p.user_id.as_str(), p.display_name.as_str()))
            .collect();
        let mut pending: Vec<Reembed> = Vec::new();

        for proposal in &payload.user_memories {
            if proposal.user_id.trim().is_empty() || proposal.fact.trim().is_empty() {
                continue;
            }
            let vector = self.embed_text(proposal.fact.trim()).await;
            match self.apply_user_fact(proposal, &names, vector.as_deref()) {
                Ok(Some(reembed)) => pending.push(reembed),
                Ok(None) => {}
                Err(e) => {
                    warn!(user_id = %proposal.user_id, error = %e, "user fact write failed");
                }
            }
        }

        for proposal in &payload.bot_memories {
            if proposal.fact.trim().is_empty() {
                continue;
            }
            let vector = self.embed_text(proposal.fact.trim()).await;
            match self.apply_group_fact(proposal, vector.as_deref()) {
                Ok(Some(reembed)) => pending.push(reembed),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "group fact write failed"),
            }
        }

        for proposal in &payload.sentiment_updates {
            let user_id = proposal.user_id.trim();
            if user_id.is_empty() {
                continue;
            }
            let delta = clamp_delta(proposal.delta);
            if delta == 0.0 {
                continue;
            }
            let name = names.get(user_id).copied().unwrap_or(user_id);
            match self
                .store
                .apply_sentiment_delta(user_id, name, delta, proposal.reason.trim())
            {
                Ok(score) => info!(user_id, score, "sentiment adjusted"),
                Err(e) => warn!(user_id, error = %e, "sentiment update failed"),
            }
        }

        self.reembed(pending).await;
    }

    /// Merge pipeline for one proposed user fact. The caller guarantees a
    /// non-empty id and fact.
    fn apply_user_fact(
        &self,
        proposal: &ProposedUserFact,
        names: &HashMap<&str, &str>,
        vector: Option<&[f32]>,
    ) -> std::result::Result<Option<Reembed>, MemoryError> {
        let user_id = proposal.user_id.trim();
        let fact = proposal.fact.trim();

        if self.store.find_user_fact_by_text(user_id, fact)?.is_some() {
            debug!(user_id, "exact-duplicate user fact skipped");
            return Ok(None);
        }

        let importance = Importance::from_i64(proposal.importance);

        if let Some(query) = vector
            && let Some(id) = self.similar_user_fact(user_id, query)?
        {
            self.store.update_user_fact(id, fact, importance)?;
            info!(fact_id = id, user_id, "merged user fact into similar row");
            return Ok(Some(Reembed::UserFact(id, fact.to_owned())));
        }

        if let Some(prev) = proposal.update_existing.as_deref() {
            let prev = prev.trim();
            if !prev.is_empty()
                && let Some(id) = self.store.find_user_fact_by_text(user_id, prev)?
            {
                self.store.update_user_fact(id, fact, importance)?;
                info!(fact_id = id, user_id, "updated user fact");
                return Ok(Some(Reembed::UserFact(id, fact.to_owned())));
            }
        }

        let name = if proposal.user_name.trim().is_empty() {
            names.get(user_id).copied().unwrap_or(user_id)
        } else {
            proposal.user_name.trim()
        };
        let id = self
            .store
            .insert_user_fact(user_id, name, fact, importance, vector)?;
        info!(fact_id = id, user_id, "new user fact");
        Ok(None)
    }

    /// Merge pipeline for one proposed group fact (global scope).
    fn apply_group_fact(
        &self,
        proposal: &ProposedGroupFact,
        vector: Option<&[f32]>,
    ) -> std::result::Result<Option<Reembed>, MemoryError> {
        let fact = proposal.fact.trim();

        if self.store.find_group_fact_by_text(fact)?.is_some() {
            debug!("exact-duplicate group fact skipped");
            return Ok(None);
        }

        let importance = Importance::from_i64(proposal.importance);

        if let Some(query) = vector
            && let Some(id) = self.similar_group_fact(query)?
        {
            self.store.update_group_fact(id, fact, importance)?;
            info!(fact_id = id, "merged group fact into similar row");
            return Ok(Some(Reembed::GroupFact(id, fact.to_owned())));
        }

        if let Some(prev) = proposal.update_existing.as_deref() {
            let prev = prev.trim();
            if !prev.is_empty()
                && let Some(id) = self.store.find_group_fact_by_text(prev)?
            {
                self.store.update_group_fact(id, fact, importance)?;
                info!(fact_id = id, "updated group fact");
                return Ok(Some(Reembed::GroupFact(id, fact.to_owned())));
            }
        }

        let category = GroupFactCategory::from_str_lossy(&proposal.category);
        let related = proposal
            .related_user_ids
            .as_ref()
            .map(RelatedIds::to_vec)
            .unwrap_or_default();
        let id = self
            .store
            .insert_group_fact(category, fact, &related, importance, vector)?;
        info!(fact_id = id, category = category.as_str(), "new group fact");
        Ok(None)
    }

    /// Most similar existing fact for one user, if any clears the threshold.
    fn similar_user_fact(
        &self,
        user_id: &str,
        query: &[f32],
    ) -> std::result::Result<Option<i64>, MemoryError> {
        let rows = self.store.user_facts_with_embeddings(user_id)?;
        let mut best_id = None;
        let mut best_sim = self.similarity_threshold;
        for row in rows {
            let Some(embedding) = &row.embedding else {
                continue;
            };
            let sim = cosine_similarity(query, embedding);
            if sim > best_sim {
                best_sim = sim;
                best_id = Some(row.id);
            }
        }
        Ok(best_id)
    }

    /// Most similar existing group fact, if any clears the threshold.
    fn similar_group_fact(
        &self,
        query: &[f32],
    ) -> std::result::Result<Option<i64>, MemoryError> {
        let rows = self.store.group_facts_with_embeddings()?;
        let mut best_id = None;
        let mut best_sim = self.similarity_threshold;
        for row in rows {
            let Some(embedding) = &row.embedding else {
                continue;
            };
            let sim = cosine_similarity(query, embedding);
            if sim > best_sim {
                best_sim = sim;
                best_id = Some(row.id);
            }
        }
        Ok(best_id)
    }

    async fn embed_text(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(text).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!(error = %e, "fact embedding failed");
                None
            }
        }
    }

    /// Recompute embeddings for rows whose text changed. Runs after all
    /// writes so the write path never waits on the embedding engine.
    async fn reembed(&self, pending: Vec<Reembed>) {
        if pending.is_empty() || self.embedder.is_none() {
            return;
        }
        for item in pending {
            let (id, text) = match &item {
                Reembed::UserFact(id, text) | Reembed::GroupFact(id, text) => (*id, text.as_str()),
            };
            let Some(vector) = self.embed_text(text).await else {
                continue;
            };
            let result = match item {
                Reembed::UserFact(..) => self.store.set_user_fact_embedding(id, &vector),
                Reembed::GroupFact(..) => self.store.set_group_fact_embedding(id, &vector),
            };
            if let Err(e) = result {
                warn!(fact_id = id, error = %e, "re-embedding store failed");
            }
        }
    }

    /// Existing memories shown to the model for context.
    fn existing_memories_block(&self, participants: &[Participant]) -> String {
        let mut lines = Vec::new();
        for participant in participants {
            match self
                .store
                .recent_user_facts(&participant.user_id, EXISTING_FACT_LIMIT)
            {
                Ok(rows) => {
                    for row in rows {
                        lines.push(format!(
                            "About {} (id:{}): {}",
                            participant.display_name, participant.user_id, row.fact
                        ));
                    }
                }
                Err(e) => {
                    warn!(user_id = %participant.user_id, error = %e, "existing fact lookup failed");
                }
            }
        }
        match self.store.recent_group_facts(EXISTING_FACT_LIMIT) {
            Ok(rows) => {
                for row in rows {
                    lines.push(format!("Bot [{}]: {}", row.category.as_str(), row.fact));
                }
            }
            Err(e) => warn!(error = %e, "existing group fact lookup failed"),
        }
        if lines.is_empty() {
            "No existing memories yet.".to_owned()
        } else {
            lines.join("\n")
        }
    }

    /// Current sentiment scores shown to the model for context.
    fn sentiment_block(&self, participants: &[Participant]) -> String {
        let ids: Vec<String> = participants.iter().map(|p| p.user_id.clone()).collect();
        let rows = match self.store.sentiments_for(&ids) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "sentiment context lookup failed");
                Vec::new()
            }
        };
        let by_id: HashMap<&str, &SentimentScore> =
            rows.iter().map(|r| (r.user_id.as_str(), r)).collect();

        let mut lines = Vec::new();
        for participant in participants {
            let Some(row) = by_id.get(participant.user_id.as_str()) else {
                continue;
            };
            if row.reason.is_empty() {
                lines.push(format!("{}: {:+.2}", participant.display_name, row.score));
            } else {
                lines.push(format!(
                    "{}: {:+.2} ({})",
                    participant.display_name, row.score, row.reason
                ));
            }
        }
        if lines.is_empty() {
            "No sentiment recorded yet.".to_owned()
        } else {
            lines.join("\n")
        }
    }
}

/// Condensed transcript of the window tail plus the bot's reply.
fn transcript(tail: &[ChannelMessage], reply: &str, bot_name: &str) -> String {
    let mut lines: Vec<String> = tail
        .iter()
        .map(|m| format!("{}: {}", m.author_name, m.content))
        .collect();
    lines.push(format!("{bot_name}: {reply}"));
    lines.join("\n")
}

fn participant_map_block(participants: &[Participant]) -> String {
    if participants.is_empty() {
        return "(none)".to_owned();
    }
    participants
        .iter()
        .map(|p| format!("- {}: ID {}", p.display_name, p.user_id))
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_user_prompt(
    bot_name: &str,
    participant_map: &str,
    existing: &str,
    sentiment: &str,
    transcript: &str,
) -> String {
    format!(
        "PARTICIPANTS:\n{participant_map}\n\n\
         EXISTING MEMORIES:\n{existing}\n\n\
         CURRENT SENTIMENT:\n{sentiment}\n\n\
         CONVERSATION (the bot's own lines are prefixed \"{bot_name}:\"):\n{transcript}\n\n\
         Extract memories from the above."
    )
}

/// Parse an extraction response.
///
/// Accepts raw text that may carry markdown fences or surrounding prose.
/// Returns an empty payload on failure so a bad response writes nothing.
fn parse_extraction_payload(raw: &str) -> ExtractionPayload {
    let json_str = extract_json_block(raw);
    match serde_json::from_str::<ExtractionPayload>(json_str) {
        Ok(payload) => payload,
        Err(e) => {
            if !json_str.trim().is_empty() {
                debug!(error = %e, "extraction response was not valid JSON, skipping");
            }
            ExtractionPayload::default()
        }
    }
}

/// Extract the JSON body from a potentially markdown-fenced response.
fn extract_json_block(raw: &str) -> &str {
    let trimmed = raw.trim();

    if let Some(start) = trimmed.find("```json") {
        let after_fence = &trimmed[start + 7..];
        if let Some(end) = after_fence.find("```") {
            return after_fence[..end].trim();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        if let Some(end) = after_fence.find("```") {
            return after_fence[..end].trim();
        }
    }

    if let Some(start) = trimmed.find('{')
        && let Some(end) = trimmed.rfind('}')
        && end > start
    {
        return &trimmed[start..=end];
    }

    trimmed
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
