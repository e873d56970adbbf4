//! Configuration types for the banter chat bot.
//!
//! Loaded from a TOML file (default: `banter.toml` under the platform
//! config directory). Every section has serde defaults so a partial file,
//! or no file at all, yields a runnable configuration. Secrets (Discord
//! token, LLM API key) are taken from the environment when the file leaves
//! them empty, and are never written back to disk.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BanterError, Result};

/// Environment variable holding the Discord bot token.
pub const DISCORD_TOKEN_ENV: &str = "DISCORD_BOT_TOKEN";

/// Environment variable holding the LLM provider API key.
pub const LLM_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Top-level configuration for the bot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Discord transport settings.
    pub discord: DiscordConfig,
    /// Language-model provider settings.
    pub llm: LlmConfig,
    /// Local embedding engine settings.
    pub embedding: EmbeddingConfig,
    /// Memory store settings (caps, budgets, thresholds).
    pub memory: MemoryConfig,
    /// Engagement controller settings.
    pub engagement: EngagementConfig,
    /// Episode segmentation settings.
    pub episodes: EpisodeConfig,
    /// Persona settings.
    pub persona: PersonaConfig,
    /// Repost detection settings.
    pub repost: RepostConfig,
}

/// Discord transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    /// Bot token. Empty means "read `DISCORD_BOT_TOKEN` from the environment".
    pub token: String,
    /// Whether the bot answers direct messages.
    pub allow_dms: bool,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            allow_dms: false,
        }
    }
}

impl DiscordConfig {
    /// Resolve the bot token from config or environment.
    #[must_use]
    pub fn resolve_token(&self) -> Option<String> {
        if !self.token.trim().is_empty() {
            return Some(self.token.trim().to_owned());
        }
        std::env::var(DISCORD_TOKEN_ENV)
            .ok()
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty())
    }
}

/// Language-model provider configuration.
///
/// The client speaks the Anthropic messages wire format; `base_url` exists
/// so tests (and compatible proxies) can redirect it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider base URL.
    pub base_url: String,
    /// Model requested for every call.
    pub model: String,
    /// API key. Empty means "read `ANTHROPIC_API_KEY` from the environment".
    pub api_key: String,
    /// Max output tokens for a chat reply.
    pub reply_max_tokens: u32,
    /// Max output tokens for the YES/NO relevance check.
    pub relevance_max_tokens: u32,
    /// Max output tokens for a memory-extraction call.
    pub extraction_max_tokens: u32,
    /// Max output tokens for an episode summary.
    pub summary_max_tokens: u32,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_owned(),
            model: "claude-haiku-4-5-20251001".to_owned(),
            api_key: String::new(),
            reply_max_tokens: 300,
            relevance_max_tokens: 8,
            extraction_max_tokens: 1000,
            summary_max_tokens: 200,
            timeout_secs: 60,
        }
    }
}

impl LlmConfig {
    /// Resolve the API key from config or environment.
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        if !self.api_key.trim().is_empty() {
            return Some(self.api_key.trim().to_owned());
        }
        std::env::var(LLM_API_KEY_ENV)
            .ok()
            .map(|k| k.trim().to_owned())
            .filter(|k| !k.is_empty())
    }
}

/// Local embedding engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Whether to load the embedding model at startup. When disabled (or
    /// when loading fails), retrieval degrades to recency/importance only.
    pub enabled: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Memory store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// SQLite database path (None = `banter.db` under the platform data dir).
    pub db_path: Option<PathBuf>,
    /// Maximum durable facts per user; lowest-importance-then-oldest evicted.
    pub max_user_facts: usize,
    /// Maximum group facts, global scope.
    pub max_group_facts: usize,
    /// Maximum episodic summaries, global scope; oldest evicted.
    pub max_summaries: usize,
    /// Token budget for fact lines injected into the system prompt.
    pub fact_token_budget: usize,
    /// Token sub-budget for episodic summary lines.
    pub summary_token_budget: usize,
    /// Cosine similarity above which a proposed fact merges into an
    /// existing row instead of inserting a new one.
    pub similarity_threshold: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            max_user_facts: 500,
            max_group_facts: 1000,
            max_summaries: 200,
            fact_token_budget: 1000,
            summary_token_budget: 500,
            similarity_threshold: 0.85,
        }
    }
}

impl MemoryConfig {
    /// Resolve the database path, falling back to the platform data dir.
    #[must_use]
    pub fn resolve_db_path(&self) -> PathBuf {
        if let Some(path) = &self.db_path {
            return path.clone();
        }
        default_data_dir().join("banter.db")
    }
}

/// Engagement controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngagementConfig {
    /// Seconds after a bot reply during which the channel counts as engaged.
    pub window_secs: u64,
    /// Grace sub-window in seconds: follow-ups this soon after a bot reply
    /// skip the relevance check entirely.
    pub grace_secs: u64,
    /// Cooldown in seconds between unprompted chime-ins per channel.
    pub chime_in_cooldown_secs: u64,
    /// Base probability of an unprompted chime-in.
    pub base_chime_in_chance: f64,
    /// Chime-in probability when the message contains a keyword.
    pub keyword_chime_in_chance: f64,
    /// Keywords (case-insensitive substring match) that boost the chime-in
    /// chance.
    pub keywords: Vec<String>,
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            window_secs: 120,
            grace_secs: 30,
            chime_in_cooldown_secs: 120,
            base_chime_in_chance: 0.02,
            keyword_chime_in_chance: 0.15,
            keywords: vec![
                "banter".to_owned(),
                "bot".to_owned(),
                "repost".to_owned(),
                "noob".to_owned(),
                "trash".to_owned(),
                "toast".to_owned(),
                "bant".to_owned(),
            ],
        }
    }
}

/// Episode segmentation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EpisodeConfig {
    /// Gap in seconds that closes an episode (checked before append).
    pub gap_secs: u64,
    /// Buffered message count that forces a flush (checked after append).
    pub flush_volume: usize,
    /// Minimum messages for an episode to qualify for summarization.
    pub min_messages: usize,
}

impl Default for EpisodeConfig {
    fn default() -> Self {
        Self {
            gap_secs: 1800,
            flush_volume: 50,
            min_messages: 5,
        }
    }
}

/// Persona configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    /// Display name the bot uses for itself in transcripts and prompts.
    pub bot_name: String,
    /// Optional path to a persona prompt file replacing the built-in one.
    pub prompt_path: Option<PathBuf>,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            bot_name: "Banter".to_owned(),
            prompt_path: None,
        }
    }
}

/// Repost detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepostConfig {
    /// Whether repost callouts are active.
    pub enabled: bool,
    /// Extra host substrings excluded from repost tracking, on top of the
    /// built-in gif/CDN hosts.
    pub extra_exclusions: Vec<String>,
}

impl Default for RepostConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extra_exclusions: Vec::new(),
        }
    }
}

impl BotConfig {
    /// Load configuration from an explicit path, or from the default
    /// location. An explicit path that does not exist is an error; a
    /// missing default file just yields defaults.
    ///
    /// # Errors
    ///
    /// Returns [`BanterError::Config`] if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let p = default_config_path();
                if !p.exists() {
                    return Ok(Self::default());
                }
                p
            }
        };

        let raw = std::fs::read_to_string(&path)
            .map_err(|e| BanterError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| BanterError::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Validate the configuration, collecting human-readable issues.
    ///
    /// An empty result means the configuration is usable. Issues are
    /// descriptive, not fatal by themselves; the caller decides what is
    /// required.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.discord.resolve_token().is_none() {
            issues.push(format!(
                "discord token missing: set [discord].token or {DISCORD_TOKEN_ENV}"
            ));
        }
        if self.llm.resolve_api_key().is_none() {
            issues.push(format!(
                "LLM API key missing: set [llm].api_key or {LLM_API_KEY_ENV} (chat disabled)"
            ));
        }
        if self.llm.base_url.trim().is_empty() {
            issues.push("llm.base_url must not be empty".to_owned());
        }
        if self.llm.model.trim().is_empty() {
            issues.push("llm.model must not be empty".to_owned());
        }
        if !(0.0..=1.0).contains(&self.engagement.base_chime_in_chance) {
            issues.push("engagement.base_chime_in_chance must be in [0, 1]".to_owned());
        }
        if !(0.0..=1.0).contains(&self.engagement.keyword_chime_in_chance) {
            issues.push("engagement.keyword_chime_in_chance must be in [0, 1]".to_owned());
        }
        if self.engagement.grace_secs > self.engagement.window_secs {
            issues.push("engagement.grace_secs must not exceed engagement.window_secs".to_owned());
        }
        if !(0.0..=1.0).contains(&self.memory.similarity_threshold) {
            issues.push("memory.similarity_threshold must be in [0, 1]".to_owned());
        }
        if self.memory.max_user_facts == 0 {
            issues.push("memory.max_user_facts must be at least 1".to_owned());
        }
        if self.memory.max_group_facts == 0 {
            issues.push("memory.max_group_facts must be at least 1".to_owned());
        }
        if self.episodes.min_messages == 0 {
            issues.push("episodes.min_messages must be at least 1".to_owned());
        }
        if self.episodes.flush_volume < self.episodes.min_messages {
            issues.push("episodes.flush_volume must be >= episodes.min_messages".to_owned());
        }
        if self.persona.bot_name.trim().is_empty() {
            issues.push("persona.bot_name must not be empty".to_owned());
        }

        issues
    }
}

/// Default config file path: `<config_dir>/banter/banter.toml`.
#[must_use]
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("banter")
        .join("banter.toml")
}

/// Default data directory: `<data_dir>/banter`.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("banter")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
