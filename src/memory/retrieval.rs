//! Token-budgeted memory retrieval for the system prompt.
//!
//! Builds three text blocks for a channel: fact lines (user + group facts,
//! tiered by importance and semantic similarity), episodic summary lines,
//! and sentiment framing lines. Retrieval never fails the reply pipeline:
//! every store or embedding error degrades to "no contribution" with a
//! warning.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::config::MemoryConfig;
use crate::embedding::SharedEmbedder;
use crate::memory::store::MemoryStore;
use crate::memory::types::{
    GroupFact, Importance, estimate_tokens, format_age, now_epoch_secs,
};
use crate::transport::{ChannelMessage, Participant};

/// Rows fetched per participant (and for group facts) by the recency query.
const RECENCY_LIMIT: usize = 50;

/// Nearest-neighbor hits consulted per fact table.
const FACT_KNN_LIMIT: usize = 15;

/// Nearest-neighbor hits consulted for episodic summaries.
const SUMMARY_KNN_LIMIT: usize = 5;

/// Most-recent summaries always considered for the current channel.
const CHANNEL_SUMMARY_LIMIT: usize = 3;

/// Messages folded into the conversation embedding.
const CONVERSATION_TAIL: usize = 5;

/// Seconds a conversation embedding stays valid per channel.
const CONVERSATION_CACHE_TTL_SECS: u64 = 60;

/// Identity key for deduplicating fact lines across retrieval tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FactKey {
    User(i64),
    Group(i64),
}

struct CachedEmbedding {
    computed_at: u64,
    vector: Vec<f32>,
}

/// Assembles memory blocks from the store under fixed token budgets.
pub struct Retriever {
    store: Arc<MemoryStore>,
    embedder: Option<SharedEmbedder>,
    fact_budget: usize,
    summary_budget: usize,
    conversation_cache: Mutex<HashMap<String, CachedEmbedding>>,
}

impl Retriever {
    pub fn new(
        store: Arc<MemoryStore>,
        embedder: Option<SharedEmbedder>,
        config: &MemoryConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            fact_budget: config.fact_token_budget,
            summary_budget: config.summary_token_budget,
            conversation_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Fact lines and episodic summary lines for one channel.
    pub async fn retrieve(
        &self,
        participants: &[Participant],
        recent: &[ChannelMessage],
        channel_id: &str,
    ) -> (Vec<String>, Vec<String>) {
        let conv_vec = self.conversation_embedding(channel_id, recent).await;
        let fact_lines = self.fact_lines(participants, conv_vec.as_deref());
        let summary_lines = self.summary_lines(channel_id, conv_vec.as_deref());
        (fact_lines, summary_lines)
    }

    /// One attitude line per participant with a non-zero sentiment score.
    ///
    /// Empty when every participant is neutral, so the caller can omit the
    /// whole block.
    pub fn sentiment_framing(&self, participants: &[Participant]) -> Vec<String> {
        let ids: Vec<String> = participants.iter().map(|p| p.user_id.clone()).collect();
        let rows = match self.store.sentiments_for(&ids) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "sentiment lookup failed");
                return Vec::new();
            }
        };
        let by_id: HashMap<&str, f64> =
            rows.iter().map(|r| (r.user_id.as_str(), r.score)).collect();

        let mut lines = Vec::new();
        for participant in participants {
            let Some(&score) = by_id.get(participant.user_id.as_str()) else {
                continue;
            };
            if score == 0.0 {
                continue;
            }
            lines.push(sentiment_line(&participant.display_name, score));
        }
        lines
    }

    /// Walk the four priority buckets and emit fact lines under the budget.
    fn fact_lines(
        &self,
        participants: &[Participant],
        conv_vec: Option<&[f32]>,
    ) -> Vec<String> {
        let names: HashMap<&str, &str> = participants
            .iter()
            .map(|p| (p.user_id.as_str(), p.display_name.as_str()))
            .collect();

        // Recency tier, pre-sorted importance-first by the store.
        let mut candidates: Vec<(FactKey, String, Importance)> = Vec::new();
        let mut known: HashSet<FactKey> = HashSet::new();
        for participant in participants {
            match self
                .store
                .recent_user_facts(&participant.user_id, RECENCY_LIMIT)
            {
                Ok(rows) => {
                    for row in rows {
                        let key = FactKey::User(row.id);
                        if known.insert(key) {
                            let line = user_fact_line(
                                &participant.display_name,
                                &row.fact,
                                row.importance,
                            );
                            candidates.push((key, line, row.importance));
                        }
                    }
                }
                Err(e) => {
                    warn!(user_id = %participant.user_id, error = %e, "user fact lookup failed");
                }
            }
        }
        match self.store.recent_group_facts(RECENCY_LIMIT) {
            Ok(rows) => {
                for row in rows {
                    let key = FactKey::Group(row.id);
                    if known.insert(key) {
                        candidates.push((key, group_fact_line(&row), row.importance));
                    }
                }
            }
            Err(e) => warn!(error = %e, "group fact lookup failed"),
        }

        let (user_hits, group_hits) = self.vector_hits(conv_vec);
        let user_hit_set: HashSet<i64> = user_hits.iter().copied().collect();
        let group_hit_set: HashSet<i64> = group_hits.iter().copied().collect();

        // Strict priority order: importance-3, vector hits, importance-2,
        // importance-1. Each key lands in exactly one bucket.
        let mut buckets: [Vec<(FactKey, String)>; 4] = Default::default();
        for (key, line, importance) in candidates {
            let is_hit = match key {
                FactKey::User(id) => user_hit_set.contains(&id),
                FactKey::Group(id) => group_hit_set.contains(&id),
            };
            let slot = if importance == Importance::Defining {
                0
            } else if is_hit {
                1
            } else if importance == Importance::Standard {
                2
            } else {
                3
            };
            buckets[slot].push((key, line));
        }

        // Vector hits the recency tier missed, fetched by id in distance
        // order. Rows about non-participants fall back to the stored name.
        let absent_user: Vec<i64> = user_hits
            .iter()
            .copied()
            .filter(|id| !known.contains(&FactKey::User(*id)))
            .collect();
        if !absent_user.is_empty() {
            match self.store.user_facts_by_ids(&absent_user) {
                Ok(rows) => {
                    let by_id: HashMap<i64, _> =
                        rows.into_iter().map(|r| (r.id, r)).collect();
                    for id in absent_user {
                        if let Some(row) = by_id.get(&id) {
                            let name = names
                                .get(row.user_id.as_str())
                                .copied()
                                .unwrap_or(row.display_name.as_str());
                            let line = user_fact_line(name, &row.fact, row.importance);
                            buckets[1].push((FactKey::User(id), line));
                        }
                    }
                }
                Err(e) => warn!(error = %e, "vector-hit user fact fetch failed"),
            }
        }
        let absent_group: Vec<i64> = group_hits
            .iter()
            .copied()
            .filter(|id| !known.contains(&FactKey::Group(*id)))
            .collect();
        if !absent_group.is_empty() {
            match self.store.group_facts_by_ids(&absent_group) {
                Ok(rows) => {
                    let by_id: HashMap<i64, _> =
                        rows.into_iter().map(|r| (r.id, r)).collect();
                    for id in absent_group {
                        if let Some(row) = by_id.get(&id) {
                            buckets[1].push((FactKey::Group(id), group_fact_line(row)));
                        }
                    }
                }
                Err(e) => warn!(error = %e, "vector-hit group fact fetch failed"),
            }
        }

        // Budget walk. One line per identity key, stop before the budget
        // would be exceeded.
        let mut lines = Vec::new();
        let mut used = 0usize;
        let mut emitted: HashSet<FactKey> = HashSet::new();
        'walk: for bucket in buckets {
            for (key, line) in bucket {
                if !emitted.insert(key) {
                    continue;
                }
                let cost = estimate_tokens(&line);
                if used + cost > self.fact_budget {
                    break 'walk;
                }
                used += cost;
                lines.push(line);
            }
        }
        lines
    }

    /// Recent summaries for this channel plus cross-channel vector hits,
    /// under the summary budget.
    fn summary_lines(&self, channel_id: &str, conv_vec: Option<&[f32]>) -> Vec<String> {
        let now = now_epoch_secs();
        let mut lines = Vec::new();
        let mut used = 0usize;
        let mut seen: HashSet<i64> = HashSet::new();

        match self
            .store
            .recent_channel_summaries(channel_id, CHANNEL_SUMMARY_LIMIT)
        {
            Ok(rows) => {
                for row in rows {
                    let line = summary_line(&row.summary, true, now, row.ended_at);
                    let cost = estimate_tokens(&line);
                    if used + cost > self.summary_budget {
                        break;
                    }
                    used += cost;
                    seen.insert(row.id);
                    lines.push(line);
                }
            }
            Err(e) => warn!(channel_id, error = %e, "channel summary lookup failed"),
        }

        let Some(query) = conv_vec else {
            return lines;
        };
        let hits = match self.store.knn_summaries(query, SUMMARY_KNN_LIMIT) {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "summary vector search failed");
                return lines;
            }
        };
        let absent: Vec<i64> = hits
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| !seen.contains(id))
            .collect();
        if absent.is_empty() {
            return lines;
        }
        match self.store.summaries_by_ids(&absent) {
            Ok(rows) => {
                let by_id: HashMap<i64, _> = rows.into_iter().map(|r| (r.id, r)).collect();
                for id in absent {
                    let Some(row) = by_id.get(&id) else {
                        continue;
                    };
                    let line = summary_line(
                        &row.summary,
                        row.channel_id == channel_id,
                        now,
                        row.ended_at,
                    );
                    let cost = estimate_tokens(&line);
                    if used + cost > self.summary_budget {
                        break;
                    }
                    used += cost;
                    seen.insert(id);
                    lines.push(line);
                }
            }
            Err(e) => warn!(error = %e, "vector-hit summary fetch failed"),
        }
        lines
    }

    /// Nearest-neighbor row ids for both fact tables, in distance order.
    fn vector_hits(&self, conv_vec: Option<&[f32]>) -> (Vec<i64>, Vec<i64>) {
        let Some(query) = conv_vec else {
            return (Vec::new(), Vec::new());
        };
        let user = match self.store.knn_user_facts(query, FACT_KNN_LIMIT) {
            Ok(hits) => hits.into_iter().map(|(id, _)| id).collect(),
            Err(e) => {
                warn!(error = %e, "user fact vector search failed");
                Vec::new()
            }
        };
        let group = match self.store.knn_group_facts(query, FACT_KNN_LIMIT) {
            Ok(hits) => hits.into_iter().map(|(id, _)| id).collect(),
            Err(e) => {
                warn!(error = %e, "group fact vector search failed");
                Vec::new()
            }
        };
        (user, group)
    }

    /// Embedding of the conversation tail, cached per channel for 60s.
    async fn conversation_embedding(
        &self,
        channel_id: &str,
        recent: &[ChannelMessage],
    ) -> Option<Vec<f32>> {
        let now = now_epoch_secs();
        if let Ok(cache) = self.conversation_cache.lock()
            && let Some(entry) = cache.get(channel_id)
            && now.saturating_sub(entry.computed_at) < CONVERSATION_CACHE_TTL_SECS
        {
            return Some(entry.vector.clone());
        }

        let embedder = self.embedder.as_ref()?;
        let text = conversation_text(recent)?;
        match embedder.embed(&text).await {
            Ok(vector) => {
                if let Ok(mut cache) = self.conversation_cache.lock() {
                    cache.insert(
                        channel_id.to_owned(),
                        CachedEmbedding {
                            computed_at: now,
                            vector: vector.clone(),
                        },
                    );
                }
                Some(vector)
            }
            Err(e) => {
                warn!(channel_id, error = %e, "conversation embedding failed");
                None
            }
        }
    }
}

/// Format one user fact, tagged with the subject's display name.
fn user_fact_line(name: &str, fact: &str, importance: Importance) -> String {
    if importance == Importance::Defining {
        format!("- About {name} (importance: high): {fact}")
    } else {
        format!("- About {name}: {fact}")
    }
}

/// Format one group fact, tagged with its category.
fn group_fact_line(fact: &GroupFact) -> String {
    format!("- [{}] {}", fact.category.as_str(), fact.fact)
}

/// Format one episodic summary, tagged with channel origin and age.
fn summary_line(summary: &str, same_channel: bool, now: u64, ended_at: u64) -> String {
    let age = format_age(now.saturating_sub(ended_at));
    if same_channel {
        format!("- In this channel ({age}): {summary}")
    } else {
        format!("- In another channel ({age}): {summary}")
    }
}

/// Map a sentiment score to one qualitative attitude line.
fn sentiment_line(name: &str, score: f64) -> String {
    if score <= -3.0 {
        format!("- You find {name} tiresome. Be dismissive with them and keep it short.")
    } else if score <= -1.0 {
        format!("- You are mildly annoyed with {name} lately. Being a bit short with them is fine.")
    } else if score <= 2.0 {
        format!("- You are on warm terms with {name}.")
    } else {
        format!("- {name} is one of your favorite people here. Let it show.")
    }
}

/// Join the non-empty tail of the conversation for embedding.
fn conversation_text(recent: &[ChannelMessage]) -> Option<String> {
    let start = recent.len().saturating_sub(CONVERSATION_TAIL);
    let text = recent[start..]
        .iter()
        .filter(|msg| !msg.content.trim().is_empty())
        .map(|msg| format!("{}: {}", msg.author_name, msg.content))
        .collect::<Vec<_>>()
        .join("\n");
    if text.is_empty() { None } else { Some(text) }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
