//! Public channel scraper — reads the `t.me/s/<channel>` web preview.
//!
//! No account or session is needed: the preview page lists the most recent
//! posts of a public channel, oldest first, each tagged with
//! `data-post="<channel>/<id>"` and a `<time datetime>` stamp.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mydigest_core::config::ScraperConfig;
use mydigest_core::{DigestError, FetchTransport, FetchedItem, Result, parse_retry_after};
use regex::Regex;

/// Compiled patterns for the preview markup.
struct PostParser {
    post: Regex,
    text: Regex,
    datetime: Regex,
    title: Regex,
    line_break: Regex,
    tag: Regex,
}

impl PostParser {
    fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| DigestError::Config(format!("bad pattern: {e}")))
        };
        Ok(Self {
            post: compile(r#"data-post="[^"/]+/(\d+)""#)?,
            text: compile(r#"(?s)<div class="tgme_widget_message_text[^"]*"[^>]*>(.*?)</div>"#)?,
            datetime: compile(r#"<time[^>]*datetime="([^"]+)""#)?,
            title: compile(r#"<meta property="og:title" content="([^"]*)""#)?,
            line_break: compile(r"(?i)<br\s*/?>")?,
            tag: compile(r"<[^>]+>")?,
        })
    }

    /// Posts in page order (oldest first). Media-only posts are skipped.
    fn parse(&self, html: &str) -> Vec<FetchedItem> {
        let title = self
            .title
            .captures(html)
            .map(|c| decode_entities(&c[1]))
            .filter(|t| !t.is_empty());

        let starts: Vec<(usize, i64)> = self
            .post
            .captures_iter(html)
            .filter_map(|c| {
                let whole = c.get(0)?;
                Some((whole.start(), c[1].parse().ok()?))
            })
            .collect();

        let mut items = Vec::with_capacity(starts.len());
        for (idx, &(start, id)) in starts.iter().enumerate() {
            let end = starts.get(idx + 1).map_or(html.len(), |&(next, _)| next);
            let block = &html[start..end];

            let Some(text) = self.text.captures(block).map(|c| self.to_plain(&c[1])) else {
                continue;
            };
            if text.is_empty() {
                continue;
            }
            let captured_at = self
                .datetime
                .captures(block)
                .and_then(|c| DateTime::parse_from_rfc3339(&c[1]).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            items.push(FetchedItem {
                id,
                text,
                captured_at,
                title: title.clone(),
            });
        }
        items
    }

    fn to_plain(&self, fragment: &str) -> String {
        let with_breaks = self.line_break.replace_all(fragment, "\n");
        let stripped = self.tag.replace_all(&with_breaks, "");
        decode_entities(stripped.trim())
    }
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#039;", "'")
        .replace("&amp;", "&")
}

/// Scrapes public channels through their web preview.
pub struct TelegramWebScraper {
    base_url: String,
    default_flood_wait: Duration,
    parser: PostParser,
    client: reqwest::Client,
}

impl TelegramWebScraper {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .user_agent(concat!("mydigest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DigestError::Http(format!("client init failed: {e}")))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_flood_wait: Duration::from_secs(config.default_flood_wait_secs),
            parser: PostParser::new()?,
            client,
        })
    }

    fn page_url(&self, channel: &str) -> String {
        format!("{}/s/{}", self.base_url, channel)
    }
}

#[async_trait]
impl FetchTransport for TelegramWebScraper {
    fn name(&self) -> &str {
        "telegram-web"
    }

    async fn fetch_recent(&self, source_name: &str, limit: usize) -> Result<Vec<FetchedItem>> {
        let url = self.page_url(source_name);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DigestError::Http(format!("GET {url} failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let wait = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after)
                .unwrap_or(self.default_flood_wait);
            tracing::info!(channel = source_name, wait_secs = wait.as_secs(), "🌊 Flood wait");
            return Err(DigestError::rate_limited(Some(wait)));
        }
        if !status.is_success() {
            return Err(DigestError::Http(format!("GET {url}: {status}")));
        }

        let html = response
            .text()
            .await
            .map_err(|e| DigestError::Http(format!("reading {url}: {e}")))?;
        let mut items = self.parser.parse(&html);
        items.reverse();
        items.truncate(limit);
        tracing::debug!(channel = source_name, count = items.len(), "🔎 Scraped channel page");
        Ok(items)
    }
}
