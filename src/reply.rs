//! Post-processing of raw model replies.
//!
//! The model's freeform output is parsed exactly once, here, into a tagged
//! reply. Downstream code never inspects the raw string again.

/// Tag the model emits when it wants to react instead of speak.
const REACT_TAG: &str = "[REACT]";

/// Emoji used when the model asks for a reaction without naming one.
const DEFAULT_REACTION: &str = "\u{1F44D}";

/// What the bot does with a generated reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotReply {
    /// Send this text to the channel.
    Speak(String),
    /// Attach this emoji to the triggering message instead of replying.
    React(String),
}

/// Parse a raw completion into a reply.
///
/// Trims, drops a leading "{bot_name}:" the model sometimes echoes despite
/// being told not to, and recognizes a leading `[REACT]` tag with an
/// optional emoji. Output that is empty after cleanup becomes a reaction;
/// the bot never sends an empty message.
#[must_use]
pub fn parse_reply(raw: &str, bot_name: &str) -> BotReply {
    let text = strip_bot_prefix(bot_name, raw.trim());
    if let Some(rest) = text.strip_prefix(REACT_TAG) {
        let emoji = rest.split_whitespace().next().unwrap_or(DEFAULT_REACTION);
        return BotReply::React(emoji.to_owned());
    }
    if text.is_empty() {
        return BotReply::React(DEFAULT_REACTION.to_owned());
    }
    BotReply::Speak(text.to_owned())
}

fn strip_bot_prefix<'a>(bot_name: &str, text: &'a str) -> &'a str {
    if let Some(head) = text.get(..bot_name.len())
        && head.eq_ignore_ascii_case(bot_name)
        && let Some(tail) = text.get(bot_name.len()..)
        && let Some(rest) = tail.strip_prefix(':')
    {
        return rest.trim_start();
    }
    text
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn plain_text_becomes_speak() {
        assert_eq!(
            parse_reply("City won, obviously.", "Banter"),
            BotReply::Speak("City won, obviously.".to_owned())
        );
    }

    #[test]
    fn react_tag_uses_default_emoji() {
        assert_eq!(
            parse_reply("[REACT]", "Banter"),
            BotReply::React("\u{1F44D}".to_owned())
        );
    }

    #[test]
    fn react_tag_keeps_a_named_emoji() {
        assert_eq!(
            parse_reply("[REACT] \u{1F602}", "Banter"),
            BotReply::React("\u{1F602}".to_owned())
        );
    }

    #[test]
    fn echoed_name_prefix_is_stripped() {
        assert_eq!(
            parse_reply("Banter: calm down", "Banter"),
            BotReply::Speak("calm down".to_owned())
        );
        assert_eq!(
            parse_reply("banter:calm down", "Banter"),
            BotReply::Speak("calm down".to_owned())
        );
    }

    #[test]
    fn echoed_prefix_before_react_tag_still_reacts() {
        assert_eq!(
            parse_reply("Banter: [REACT]", "Banter"),
            BotReply::React("\u{1F44D}".to_owned())
        );
    }

    #[test]
    fn name_without_colon_is_left_alone() {
        assert_eq!(
            parse_reply("Banter is my name", "Banter"),
            BotReply::Speak("Banter is my name".to_owned())
        );
    }

    #[test]
    fn empty_output_becomes_a_reaction() {
        assert_eq!(
            parse_reply("   ", "Banter"),
            BotReply::React("\u{1F44D}".to_owned())
        );
        assert_eq!(
            parse_reply("Banter:", "Banter"),
            BotReply::React("\u{1F44D}".to_owned())
        );
    }
}
