//! Chat transport abstraction.
//!
//! Everything above the wire (engagement, context assembly, memory,
//! episodes, repost detection) consumes this view of a message; the
//! Discord client produces it. Tests substitute in-memory transports.

use async_trait::async_trait;

use crate::error::Result;

/// One message as the bot sees it.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub channel_id: String,
    pub message_id: String,
    /// Guild the channel belongs to; `None` for direct messages.
    pub guild_id: Option<String>,
    /// Stable external identity of the author.
    pub author_id: String,
    /// Author display name at the time of the message.
    pub author_name: String,
    pub content: String,
    /// The author is this bot.
    pub is_self: bool,
    /// The author is any bot account (including this one).
    pub is_bot: bool,
    /// The bot was explicitly @mentioned.
    pub mentions_me: bool,
    /// Arrived via direct message.
    pub is_direct: bool,
    /// Message timestamp, epoch seconds.
    pub timestamp: u64,
}

impl ChannelMessage {
    /// Permalink to this message.
    #[must_use]
    pub fn jump_url(&self) -> String {
        let guild = self.guild_id.as_deref().unwrap_or("@me");
        format!(
            "https://discord.com/channels/{}/{}/{}",
            guild, self.channel_id, self.message_id
        )
    }
}

/// A non-bot conversation participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
}

/// Unique non-bot participants of a message window, in first-seen order.
#[must_use]
pub fn participants_of(messages: &[ChannelMessage]) -> Vec<Participant> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for msg in messages {
        if msg.is_bot {
            continue;
        }
        if seen.insert(msg.author_id.clone()) {
            out.push(Participant {
                user_id: msg.author_id.clone(),
                display_name: msg.author_name.clone(),
            });
        }
    }
    out
}

/// Operations the bot needs from a chat backend.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Most recent messages in a channel, oldest first, up to `limit`.
    async fn recent_messages(&self, channel_id: &str, limit: usize)
    -> Result<Vec<ChannelMessage>>;

    /// Send a plain text message to a channel.
    async fn send_message(&self, channel_id: &str, text: &str) -> Result<()>;

    /// Show the typing indicator in a channel.
    async fn trigger_typing(&self, channel_id: &str) -> Result<()>;

    /// Attach an emoji reaction to a message.
    async fn add_reaction(&self, channel_id: &str, message_id: &str, emoji: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
