//! Canonical session keys.
//!
//! # Key format
//! ```text
//! {channel}:{chatId}
//! {channel}:{chatId}:thread:{threadId}
//! ```
//! Examples:
//! - `cli:default`                 — foreground CLI chat
//! - `http:session-1a2b…`          — one HTTP conversation
//! - `cron:job-42`                 — session driven by a cron job
//! - `telegram:991:thread:12`      — a thread inside a group chat
//!
//! Components are normalized to lowercase ASCII with every character outside
//! `[a-z0-9_-]` replaced by `-`, which guarantees the separators above never
//! occur inside a component. Session keys are the sole grouping dimension for
//! the session cache and for bus subscriptions.

use std::fmt;

use serde::{Deserialize, Serialize};

const THREAD_MARKER: &str = ":thread:";

// ─── SessionKey ──────────────────────────────────────────────────────────────

/// A parsed `(channel, chatId, threadId?)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub channel: String,
    pub chat_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl SessionKey {
    /// Build a key from raw components, normalizing each one.
    pub fn build(channel: &str, chat_id: &str, thread_id: Option<&str>) -> Self {
        Self {
            channel: normalize(channel),
            chat_id: normalize(chat_id),
            thread_id: thread_id.map(normalize),
        }
    }

    /// Parse a key from its canonical string form.
    ///
    /// The `:thread:` marker is split off first, then the channel is the text
    /// before the first remaining `:`. Returns `None` when any component is
    /// empty or the chat id is missing.
    pub fn parse(key: &str) -> Option<Self> {
        let (base, thread_id) = match key.find(THREAD_MARKER) {
            Some(pos) => {
                let thread = &key[pos + THREAD_MARKER.len()..];
                (&key[..pos], Some(thread.to_owned()))
            }
            None => (key, None),
        };
        let (channel, chat_id) = base.split_once(':')?;
        if channel.is_empty() || chat_id.is_empty() {
            return None;
        }
        if let Some(ref thread) = thread_id
            && thread.is_empty()
        {
            return None;
        }
        Some(Self {
            channel: channel.to_owned(),
            chat_id: chat_id.to_owned(),
            thread_id,
        })
    }

    /// The base key with the thread component removed, or `None` when this
    /// key has no thread.
    pub fn parent_of(key: &str) -> Option<String> {
        key.find(THREAD_MARKER).map(|pos| key[..pos].to_owned())
    }

    /// Canonical string form.
    pub fn as_str(&self) -> String {
        match self.thread_id {
            Some(ref thread) => format!("{}:{}:thread:{}", self.channel, self.chat_id, thread),
            None => format!("{}:{}", self.channel, self.chat_id),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lowercase and map every character outside `[a-z0-9_-]` to `-`.
fn normalize(component: &str) -> String {
    component
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_normalizes_components() {
        let key = SessionKey::build("CLI", "Chat #42", None);
        assert_eq!(key.as_str(), "cli:chat--42");
    }

    #[test]
    fn build_with_thread() {
        let key = SessionKey::build("telegram", "991", Some("Topic One"));
        assert_eq!(key.as_str(), "telegram:991:thread:topic-one");
    }

    #[test]
    fn parse_round_trips_build() {
        let built = SessionKey::build("HTTP", "Session:1", Some("T/1"));
        let parsed = SessionKey::parse(&built.as_str()).unwrap();
        assert_eq!(parsed, built, "parse(build(p)) yields the normalized parts");

        // A second round-trip is idempotent.
        let again = SessionKey::parse(&parsed.as_str()).unwrap();
        assert_eq!(again, parsed);
    }

    #[test]
    fn parse_without_thread() {
        let key = SessionKey::parse("cli:default").unwrap();
        assert_eq!(key.channel, "cli");
        assert_eq!(key.chat_id, "default");
        assert!(key.thread_id.is_none());
    }

    #[test]
    fn parse_rejects_empty_components() {
        assert!(SessionKey::parse(":chat").is_none(), "empty channel");
        assert!(SessionKey::parse("cli:").is_none(), "empty chat id");
        assert!(
            SessionKey::parse("cli:chat:thread:").is_none(),
            "empty thread id"
        );
        assert!(SessionKey::parse("nocolon").is_none(), "missing chat id");
    }

    #[test]
    fn parent_of_strips_thread() {
        assert_eq!(
            SessionKey::parent_of("telegram:991:thread:12").as_deref(),
            Some("telegram:991")
        );
        assert!(SessionKey::parent_of("telegram:991").is_none());
    }

    #[test]
    fn normalize_preserves_allowed_characters() {
        assert_eq!(normalize("a_b-c9"), "a_b-c9");
        assert_eq!(normalize("Ü ber"), "--ber");
    }
}
