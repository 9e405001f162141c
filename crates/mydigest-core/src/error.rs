//! Error taxonomy shared by every MyDigest crate.

use std::time::Duration;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, DigestError>;

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    /// A single source could not be fetched this cycle.
    #[error("source '{source_name}' unavailable: {reason}")]
    TransientSource { source_name: String, reason: String },

    /// Upstream asked us to slow down. `retry_after` is the server-provided
    /// resume delay, when the upstream sends one.
    #[error("rate limited{}", fmt_retry_after(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// A retry policy gave up.
    #[error("{label}: gave up after {attempts} attempts")]
    RetriesExhausted { label: String, attempts: u32 },

    #[error("summarization stage '{stage}' exhausted {attempts} attempts")]
    SummarizationExhausted { stage: String, attempts: u32 },

    #[error("summarization failed: {0}")]
    Summarization(String),

    /// The recipient blocked the bot or the chat no longer exists.
    #[error("recipient {user_id} permanently unreachable: {reason}")]
    RecipientUnreachable { user_id: i64, reason: String },

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

fn fmt_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (resume in {}s)", d.as_secs()),
        None => String::new(),
    }
}

/// Parse an HTTP `Retry-After` value given in whole seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

impl DigestError {
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::RateLimited { retry_after }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Server-provided resume delay, if this is a rate-limit signal carrying one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Terminal for a user's recurring task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RecipientUnreachable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("3"), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after(" 120 "), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_rate_limited_display() {
        let e = DigestError::rate_limited(Some(Duration::from_secs(2)));
        assert_eq!(e.to_string(), "rate limited (resume in 2s)");
        assert_eq!(e.retry_after(), Some(Duration::from_secs(2)));
        assert!(e.is_rate_limited());

        let e = DigestError::rate_limited(None);
        assert_eq!(e.to_string(), "rate limited");
    }

    #[test]
    fn test_terminal_classification() {
        let e = DigestError::RecipientUnreachable {
            user_id: 7,
            reason: "bot was blocked by the user".into(),
        };
        assert!(e.is_terminal());
        assert!(!DigestError::Delivery("timeout".into()).is_terminal());
    }
}
