//! Typed records for the memory store.
//!
//! Every entity the store owns is an explicit struct here. Importance and
//! category are enums with safe string/integer mappings, embeddings are
//! optional fields, and timestamps are epoch seconds.

use serde::{Deserialize, Serialize};

/// Lower bound for an accumulated sentiment score.
pub const SENTIMENT_MIN: f64 = -5.0;

/// Upper bound for an accumulated sentiment score.
pub const SENTIMENT_MAX: f64 = 5.0;

/// Largest single sentiment adjustment accepted from extraction.
pub const SENTIMENT_DELTA_MAX: f64 = 1.0;

/// How significant a fact is for retrieval priority and eviction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Importance {
    /// Light detail, first to be evicted.
    Light = 1,
    /// Default significance.
    Standard = 2,
    /// Identity-defining. Surfaces first, evicted last.
    Defining = 3,
}

impl Importance {
    /// Integer form used in storage and the extraction payload.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    /// Parse from a stored or extracted integer. Out-of-range values fall
    /// back to [`Importance::Standard`].
    #[must_use]
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => Self::Light,
            3 => Self::Defining,
            _ => Self::Standard, // safe fallback
        }
    }
}

impl Default for Importance {
    fn default() -> Self {
        Self::Standard
    }
}

/// Category of a group fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupFactCategory {
    /// Something that happened in the group.
    Event,
    /// An inside joke.
    Joke,
    /// How people relate to each other (or to the bot).
    Relationship,
    /// Something the bot knows about itself.
    #[serde(rename = "self")]
    SelfFact,
}

impl GroupFactCategory {
    /// Storage/display form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Joke => "joke",
            Self::Relationship => "relationship",
            Self::SelfFact => "self",
        }
    }

    /// Parse a stored or extracted category string.
    #[must_use]
    pub fn from_str_lossy(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "joke" => Self::Joke,
            "relationship" => Self::Relationship,
            "self" => Self::SelfFact,
            _ => Self::Event, // safe fallback
        }
    }
}

impl Default for GroupFactCategory {
    fn default() -> Self {
        Self::Event
    }
}

/// One durable statement about one user.
#[derive(Debug, Clone, PartialEq)]
pub struct UserFact {
    /// Row id.
    pub id: i64,
    /// Stable external identity (Discord user id).
    pub user_id: String,
    /// Last-known display name, denormalized.
    pub display_name: String,
    /// The fact itself, free text.
    pub fact: String,
    /// Retrieval/eviction priority.
    pub importance: Importance,
    /// Semantic vector, populated asynchronously.
    pub embedding: Option<Vec<f32>>,
    /// Creation time, epoch seconds.
    pub created_at: u64,
    /// Last update time, epoch seconds.
    pub updated_at: u64,
}

/// One durable statement about the bot or the group as a whole.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupFact {
    /// Row id.
    pub id: i64,
    /// What kind of group knowledge this is.
    pub category: GroupFactCategory,
    /// The fact itself, free text.
    pub fact: String,
    /// Users this fact concerns (advisory only).
    pub related_user_ids: Vec<String>,
    /// Retrieval/eviction priority.
    pub importance: Importance,
    /// Semantic vector, populated asynchronously.
    pub embedding: Option<Vec<f32>>,
    /// Creation time, epoch seconds.
    pub created_at: u64,
    /// Last update time, epoch seconds.
    pub updated_at: u64,
}

/// The bot's accumulated opinion of one user.
#[derive(Debug, Clone, PartialEq)]
pub struct SentimentScore {
    /// Stable external identity.
    pub user_id: String,
    /// Last-known display name.
    pub display_name: String,
    /// Bounded scalar in [-5.0, +5.0], two decimal places.
    pub score: f64,
    /// Free-text rationale from the most recent adjustment.
    pub reason: String,
    /// Last update time, epoch seconds.
    pub updated_at: u64,
}

/// A condensed record of a bounded run of channel messages.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodicSummary {
    /// Row id.
    pub id: i64,
    /// Channel the episode happened in.
    pub channel_id: String,
    /// 2–4 sentence abstractive summary.
    pub summary: String,
    /// Humans who spoke during the episode.
    pub participant_ids: Vec<String>,
    /// How many messages the episode covered.
    pub message_count: i64,
    /// First message time, epoch seconds.
    pub started_at: u64,
    /// Last message time, epoch seconds.
    pub ended_at: u64,
    /// Semantic vector, populated asynchronously.
    pub embedding: Option<Vec<f32>>,
    /// Creation time, epoch seconds.
    pub created_at: u64,
}

/// First sighting of a URL, for repost detection.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRecord {
    /// Row id.
    pub id: i64,
    /// URL as posted.
    pub url: String,
    /// Normalized form used for matching (unique).
    pub normalized: String,
    /// Who posted it first.
    pub author_id: String,
    /// Their display name at the time.
    pub author_name: String,
    /// Where it was posted.
    pub channel_id: String,
    /// Jump link to the original message, when known.
    pub message_url: String,
    /// When it was posted, epoch seconds.
    pub posted_at: u64,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Current time as epoch seconds.
#[must_use]
pub fn now_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Estimate the token cost of a text span.
///
/// Byte length divided by four. Over-estimates for non-ASCII text, which
/// errs toward staying under budget.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Format an age in seconds as a human-readable bucket.
#[must_use]
pub fn format_age(age_secs: u64) -> String {
    let days = age_secs / 86_400;
    if days > 7 {
        format!("{} weeks ago", days / 7)
    } else if days > 0 {
        format!("{days} days ago")
    } else if age_secs > 3_600 {
        format!("{} hours ago", age_secs / 3_600)
    } else {
        "recently".to_owned()
    }
}

/// Clamp a proposed sentiment delta to the accepted range.
#[must_use]
pub fn clamp_delta(delta: f64) -> f64 {
    delta.clamp(-SENTIMENT_DELTA_MAX, SENTIMENT_DELTA_MAX)
}

/// Apply a (pre-clamped) delta to a score: accumulate, clamp to the score
/// bounds, round to two decimal places.
#[must_use]
pub fn apply_delta(score: f64, delta: f64) -> f64 {
    let next = (score + delta).clamp(SENTIMENT_MIN, SENTIMENT_MAX);
    (next * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
