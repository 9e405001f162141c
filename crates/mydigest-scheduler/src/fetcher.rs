//! Rate-limited fetch over the shared scraping transport.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mydigest_core::{DigestError, FetchTransport, FetchedItem, Result, Source};

use crate::retry::RetryPolicy;

/// Wraps the single shared connection to the content source.
pub struct RateLimitedFetcher {
    transport: Arc<dyn FetchTransport>,
    retry: RetryPolicy,
    limit: usize,
}

impl RateLimitedFetcher {
    pub fn new(transport: Arc<dyn FetchTransport>, retry: RetryPolicy, limit: usize) -> Self {
        Self {
            transport,
            retry,
            limit: limit.max(1),
        }
    }

    /// Items of `source` captured within the trailing `window`, newest first.
    ///
    /// Flood waits are slept through transparently. Anything that still
    /// fails comes back as [`DigestError::TransientSource`] so the caller can
    /// skip this source for the current cycle.
    pub async fn fetch(&self, source: &Source, window: Duration) -> Result<Vec<FetchedItem>> {
        let label = format!("fetch:{}", source.name);
        let fetched = self
            .retry
            .run(&label, || self.transport.fetch_recent(&source.name, self.limit))
            .await
            .map_err(|e| DigestError::TransientSource {
                source_name: source.name.clone(),
                reason: e.to_string(),
            })?;

        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut items: Vec<FetchedItem> = fetched
            .into_iter()
            .filter(|item| item.captured_at >= cutoff)
            .collect();
        items.sort_by(|a, b| b.captured_at.cmp(&a.captured_at).then(b.id.cmp(&a.id)));

        tracing::debug!(
            source = %source.name,
            transport = self.transport.name(),
            count = items.len(),
            "📥 Fetched"
        );
        Ok(items)
    }
}
