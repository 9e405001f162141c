//! Per-user fan-out over subscribed sources.

use std::sync::Arc;
use std::time::Duration;

use mydigest_core::{AggregatedItem, RawItem, Result, Store, UserId};

use crate::fetcher::RateLimitedFetcher;

pub struct DigestAggregator {
    store: Arc<dyn Store>,
    fetcher: RateLimitedFetcher,
    /// Fixed pause between two sources, never before the first.
    pacing: Duration,
}

impl DigestAggregator {
    pub fn new(store: Arc<dyn Store>, fetcher: RateLimitedFetcher, pacing: Duration) -> Self {
        Self {
            store,
            fetcher,
            pacing,
        }
    }

    /// Fresh items across all of the user's active sources.
    ///
    /// "Fresh" means inside `window` and above the subscription's high-water
    /// mark. A failing source is logged and skipped; only failing to load the
    /// source list aborts the collection.
    pub async fn collect(&self, user_id: UserId, window: Duration) -> Result<Vec<AggregatedItem>> {
        let sources = self.store.get_active_sources(user_id).await?;
        if sources.is_empty() {
            tracing::debug!(user_id, "No active sources, nothing to collect");
            return Ok(Vec::new());
        }

        let mut aggregated = Vec::new();
        for (idx, source) in sources.iter().enumerate() {
            if idx > 0 && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }

            let fetched = match self.fetcher.fetch(source, window).await {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(user_id, source = %source.name, "⚠️ Skipping source this cycle: {e}");
                    continue;
                }
            };

            let checkpoint = match self.store.get_checkpoint(user_id, source.source_id).await {
                Ok(mark) => mark,
                Err(e) => {
                    tracing::warn!(user_id, source = %source.name, "⚠️ Checkpoint unavailable, using window only: {e}");
                    None
                }
            };

            let mut fresh = 0usize;
            for item in fetched {
                if checkpoint.is_some_and(|mark| item.id <= mark) {
                    continue;
                }

                let raw = RawItem {
                    source_id: source.source_id,
                    item_id: item.id,
                    text: item.text.clone(),
                    captured_at: item.captured_at,
                };
                if let Err(e) = self.store.save_raw_item(&raw).await {
                    tracing::warn!(user_id, source = %source.name, item_id = item.id, "⚠️ Raw item not persisted: {e}");
                }

                aggregated.push(AggregatedItem {
                    source_id: source.source_id,
                    source_name: source.name.clone(),
                    display_title: item.title.unwrap_or_else(|| source.display_name.clone()),
                    text: item.text,
                    item_id: item.id,
                    captured_at: item.captured_at,
                });
                fresh += 1;
            }
            tracing::debug!(user_id, source = %source.name, fresh, "Source collected");
        }

        tracing::info!(
            user_id,
            sources = sources.len(),
            items = aggregated.len(),
            "🧺 Collected fresh items"
        );
        Ok(aggregated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteStore;
    use crate::retry::RetryPolicy;
    use crate::test_support::{FakeFetch, item};

    fn aggregator(store: Arc<SqliteStore>, fake: Arc<FakeFetch>) -> DigestAggregator {
        let fetcher = RateLimitedFetcher::new(
            fake,
            RetryPolicy::for_scraper(&Default::default()),
            50,
        );
        DigestAggregator::new(store, fetcher, Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_sources_never_fetches() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let fake = Arc::new(FakeFetch::default());
        let items = aggregator(store, fake.clone())
            .collect(1, Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(items.is_empty());
        assert_eq!(fake.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_sources_one_empty() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.subscribe(1, "alpha").unwrap();
        store.subscribe(1, "beta").unwrap();
        let fake = Arc::new(FakeFetch::default());
        fake.set_items("alpha", vec![item(3, 1), item(2, 2), item(1, 3)]);
        fake.set_items("beta", vec![]);

        let items = aggregator(store.clone(), fake.clone())
            .collect(1, Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|i| i.source_name == "alpha"));
        assert!(items.iter().all(|i| i.display_title == "@alpha"));
        assert_eq!(fake.calls("beta"), 1);
        assert_eq!(store.raw_item_count().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_source_does_not_affect_sibling() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.subscribe(1, "alpha").unwrap();
        store.subscribe(1, "beta").unwrap();
        let fake = Arc::new(FakeFetch::default());
        fake.set_items("alpha", vec![item(10, 1)]);
        fake.set_items("beta", vec![item(20, 1), item(21, 0)]);
        fake.throttle_once("alpha", Duration::from_secs(2));

        let start = tokio::time::Instant::now();
        let items = aggregator(store, fake.clone())
            .collect(1, Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(items.len(), 3);
        assert_eq!(fake.calls("alpha"), 2);
        assert_eq!(fake.calls("beta"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_source_is_skipped() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.subscribe(1, "alpha").unwrap();
        store.subscribe(1, "beta").unwrap();
        let fake = Arc::new(FakeFetch::default());
        fake.fail("alpha");
        fake.set_items("beta", vec![item(5, 1)]);

        let items = aggregator(store, fake)
            .collect(1, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].source_name, "beta");
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_water_mark_filters_seen_items() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let alpha = store.subscribe(1, "alpha").unwrap();
        store.set_checkpoint(1, alpha.source_id, 2).await.unwrap();
        let fake = Arc::new(FakeFetch::default());
        fake.set_items("alpha", vec![item(3, 1), item(2, 2), item(1, 3)]);

        let items = aggregator(store, fake)
            .collect(1, Duration::from_secs(3600))
            .await
            .unwrap();
        let ids: Vec<i64> = items.iter().map(|i| i.item_id).collect();
        assert_eq!(ids, vec![3]);
    }
}
