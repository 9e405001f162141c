//! Domain types: the data the digest pipeline moves around.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Telegram user id; doubles as the private chat id for delivery.
pub type UserId = i64;

/// A subscribed channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub source_id: i64,
    /// Channel handle without the leading `@`.
    pub name: String,
    pub display_name: String,
    pub topic: Option<String>,
    pub link: String,
}

impl Source {
    /// Normalize `@name`, `name` or `https://t.me/name` into a bare handle.
    pub fn normalize_handle(input: &str) -> Option<String> {
        let trimmed = input.trim();
        let handle = trimmed
            .strip_prefix("https://t.me/")
            .or_else(|| trimmed.strip_prefix("http://t.me/"))
            .or_else(|| trimmed.strip_prefix("t.me/"))
            .unwrap_or(trimmed);
        let handle = handle.trim_start_matches('@').trim_end_matches('/');
        let handle = handle.strip_prefix("s/").unwrap_or(handle);
        let valid = !handle.is_empty()
            && handle
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        valid.then(|| handle.to_string())
    }

    pub fn link_for(handle: &str) -> String {
        format!("https://t.me/{handle}")
    }
}

/// One message as returned by the fetch transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedItem {
    pub id: i64,
    pub text: String,
    pub captured_at: DateTime<Utc>,
    pub title: Option<String>,
}

/// Raw scraped message, persisted append-only and unique on `(source_id, item_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub source_id: i64,
    pub item_id: i64,
    pub text: String,
    pub captured_at: DateTime<Utc>,
}

/// A fresh item tagged with the metadata of the source it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedItem {
    pub source_id: i64,
    pub source_name: String,
    pub display_title: String,
    pub text: String,
    pub item_id: i64,
    pub captured_at: DateTime<Utc>,
}

impl AggregatedItem {
    pub fn link(&self) -> String {
        format!("https://t.me/{}/{}", self.source_name, self.item_id)
    }
}

/// A delivered digest. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    pub user_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Result of handing one message to the delivery transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Blocked bot, deleted chat, deactivated account. Never retried.
    Unreachable(String),
    /// Anything that might work next time.
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_handle() {
        assert_eq!(Source::normalize_handle("@rustlang").as_deref(), Some("rustlang"));
        assert_eq!(Source::normalize_handle("rustlang").as_deref(), Some("rustlang"));
        assert_eq!(
            Source::normalize_handle("https://t.me/rust_news/").as_deref(),
            Some("rust_news")
        );
        assert_eq!(Source::normalize_handle("t.me/s/durov").as_deref(), Some("durov"));
        assert_eq!(Source::normalize_handle("not a channel"), None);
        assert_eq!(Source::normalize_handle("@"), None);
    }

    #[test]
    fn test_links() {
        assert_eq!(Source::link_for("durov"), "https://t.me/durov");
        let item = AggregatedItem {
            source_id: 1,
            source_name: "durov".into(),
            display_title: "Durov's Channel".into(),
            text: "hello".into(),
            item_id: 42,
            captured_at: Utc::now(),
        };
        assert_eq!(item.link(), "https://t.me/durov/42");
    }
}
