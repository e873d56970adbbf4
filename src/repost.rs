//! Repost detection.
//!
//! Every inbound human message is scanned for links. The first sighting of
//! a URL goes into the ledger; a later sighting of the same normalized URL
//! earns a callout naming the original poster. This runs before the
//! engagement gate: calling out reposts is a service, not a conversational
//! choice.

use std::sync::Arc;

use tracing::warn;
use url::Url;

use crate::config::RepostConfig;
use crate::memory::types::{format_age, now_epoch_secs};
use crate::memory::{MemoryStore, NewLink};
use crate::transport::ChannelMessage;

/// Link ledger frontend.
pub struct RepostDetector {
    store: Arc<MemoryStore>,
}

impl RepostDetector {
    /// Build the detector and fold any configured extra exclusions into the
    /// seeded list. Seeding failures are logged, not fatal.
    #[must_use]
    pub fn new(store: Arc<MemoryStore>, config: &RepostConfig) -> Self {
        for pattern in &config.extra_exclusions {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                continue;
            }
            if let Err(e) = store.add_exclusion(pattern) {
                warn!(pattern, error = %e, "could not add link exclusion");
            }
        }
        Self { store }
    }

    /// Scan one message. First sightings are recorded; a repeat earns a
    /// callout. At most one callout per message, and excluded hosts are
    /// suppressed at callout time so the ledger still learns them.
    pub fn check(&self, message: &ChannelMessage) -> Option<String> {
        if message.is_bot {
            return None;
        }
        let urls = extract_urls(&message.content);
        if urls.is_empty() {
            return None;
        }

        let exclusions = match self.store.exclusion_patterns() {
            Ok(patterns) => patterns,
            Err(e) => {
                warn!(error = %e, "exclusion lookup failed");
                Vec::new()
            }
        };

        let now = now_epoch_secs();
        let mut callout = None;
        for url in urls {
            let normalized = normalize_url(&url);
            match self.store.lookup_link(&normalized) {
                Ok(Some(original)) => {
                    if is_excluded(&exclusions, &original.url) {
                        continue;
                    }
                    if callout.is_none() {
                        callout = Some(callout_text(
                            &original.author_name,
                            original.posted_at,
                            &original.message_url,
                            now,
                        ));
                    }
                }
                Ok(None) => {
                    let link = NewLink {
                        url: url.as_str(),
                        normalized: &normalized,
                        author_id: &message.author_id,
                        author_name: &message.author_name,
                        channel_id: &message.channel_id,
                        message_url: &message.jump_url(),
                        posted_at: message.timestamp,
                    };
                    if let Err(e) = self.store.record_link(&link) {
                        warn!(url = %url, error = %e, "could not record link");
                    }
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "link lookup failed");
                }
            }
        }
        callout
    }
}

fn callout_text(author_name: &str, posted_at: u64, message_url: &str, now: u64) -> String {
    let age = format_age(now.saturating_sub(posted_at));
    let mut text = format!("REPOST! First posted by {author_name} {age}.");
    if !message_url.is_empty() {
        text.push('\n');
        text.push_str(message_url);
    }
    text
}

fn is_excluded(patterns: &[String], url: &str) -> bool {
    patterns
        .iter()
        .any(|p| !p.is_empty() && url.contains(p.as_str()))
}

/// Pull http/https URLs out of whitespace-delimited tokens. Discord's
/// embed-suppressing angle brackets and common trailing punctuation are
/// stripped before parsing.
fn extract_urls(content: &str) -> Vec<Url> {
    content
        .split_whitespace()
        .map(|token| {
            token
                .trim_matches(|c: char| matches!(c, '<' | '>'))
                .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | ')' | '!' | '?'))
        })
        .filter(|token| token.starts_with("http://") || token.starts_with("https://"))
        .filter_map(|token| Url::parse(token).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
        .collect()
}

/// Canonical ledger key: scheme and host (already lowercased by the parser),
/// explicit non-default port, path without its trailing slash. Query strings
/// and fragments never distinguish links.
fn normalize_url(url: &Url) -> String {
    let mut out = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out.push_str(url.path().trim_end_matches('/'));
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
