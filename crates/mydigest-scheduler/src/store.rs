//! Timeout guard around the persistent store.
//! An unreachable store must never stall a user's loop: every call gets a
//! short deadline and expiry surfaces as `StoreUnavailable`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mydigest_core::{Digest, DigestError, RawItem, Result, Source, Store, UserId};

/// Wraps any [`Store`] and bounds each call by `timeout`.
pub struct TimedStore {
    inner: Arc<dyn Store>,
    timeout: Duration,
}

impl TimedStore {
    pub fn new(inner: Arc<dyn Store>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn guard<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(op, timeout_ms = self.timeout.as_millis() as u64, "⌛ Store call timed out");
                Err(DigestError::StoreUnavailable(format!(
                    "{op} timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

#[async_trait]
impl Store for TimedStore {
    async fn get_active_users(&self) -> Result<Vec<UserId>> {
        self.guard("get_active_users", self.inner.get_active_users()).await
    }

    async fn get_user_interval(&self, user_id: UserId) -> Result<Option<Duration>> {
        self.guard("get_user_interval", self.inner.get_user_interval(user_id))
            .await
    }

    async fn set_user_interval(&self, user_id: UserId, interval: Duration) -> Result<()> {
        self.guard(
            "set_user_interval",
            self.inner.set_user_interval(user_id, interval),
        )
        .await
    }

    async fn set_user_active(&self, user_id: UserId, active: bool) -> Result<()> {
        self.guard("set_user_active", self.inner.set_user_active(user_id, active))
            .await
    }

    async fn get_active_sources(&self, user_id: UserId) -> Result<Vec<Source>> {
        self.guard("get_active_sources", self.inner.get_active_sources(user_id))
            .await
    }

    async fn get_checkpoint(&self, user_id: UserId, source_id: i64) -> Result<Option<i64>> {
        self.guard(
            "get_checkpoint",
            self.inner.get_checkpoint(user_id, source_id),
        )
        .await
    }

    async fn set_checkpoint(&self, user_id: UserId, source_id: i64, item_id: i64) -> Result<()> {
        self.guard(
            "set_checkpoint",
            self.inner.set_checkpoint(user_id, source_id, item_id),
        )
        .await
    }

    async fn save_raw_item(&self, item: &RawItem) -> Result<()> {
        self.guard("save_raw_item", self.inner.save_raw_item(item)).await
    }

    async fn save_digest(&self, digest: &Digest) -> Result<()> {
        self.guard("save_digest", self.inner.save_digest(digest)).await
    }

    async fn prune_raw_items_older_than(&self, age: Duration) -> Result<usize> {
        self.guard(
            "prune_raw_items_older_than",
            self.inner.prune_raw_items_older_than(age),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Never answers.
    struct HangingStore;

    #[async_trait]
    impl Store for HangingStore {
        async fn get_active_users(&self) -> Result<Vec<UserId>> {
            futures::future::pending().await
        }
        async fn get_user_interval(&self, _: UserId) -> Result<Option<Duration>> {
            futures::future::pending().await
        }
        async fn set_user_interval(&self, _: UserId, _: Duration) -> Result<()> {
            futures::future::pending().await
        }
        async fn set_user_active(&self, _: UserId, _: bool) -> Result<()> {
            futures::future::pending().await
        }
        async fn get_active_sources(&self, _: UserId) -> Result<Vec<Source>> {
            futures::future::pending().await
        }
        async fn get_checkpoint(&self, _: UserId, _: i64) -> Result<Option<i64>> {
            futures::future::pending().await
        }
        async fn set_checkpoint(&self, _: UserId, _: i64, _: i64) -> Result<()> {
            futures::future::pending().await
        }
        async fn save_raw_item(&self, _: &RawItem) -> Result<()> {
            futures::future::pending().await
        }
        async fn save_digest(&self, _: &Digest) -> Result<()> {
            futures::future::pending().await
        }
        async fn prune_raw_items_older_than(&self, _: Duration) -> Result<usize> {
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_store_times_out() {
        let store = TimedStore::new(Arc::new(HangingStore), Duration::from_millis(50));
        let err = store.get_active_users().await.unwrap_err();
        assert!(matches!(err, DigestError::StoreUnavailable(_)));
        let err = store.get_active_sources(1).await.unwrap_err();
        assert!(err.to_string().contains("get_active_sources"));
    }
}
