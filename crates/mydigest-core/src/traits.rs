//! Collaborator traits. The scheduler only ever talks to these.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Digest, FetchedItem, RawItem, SendOutcome, Source, UserId};

/// Narrow CRUD surface over users, subscriptions and digest history.
#[async_trait]
pub trait Store: Send + Sync {
    /// Users flagged as wanting digests.
    async fn get_active_users(&self) -> Result<Vec<UserId>>;

    /// `None` when the user never picked an interval.
    async fn get_user_interval(&self, user_id: UserId) -> Result<Option<Duration>>;

    async fn set_user_interval(&self, user_id: UserId, interval: Duration) -> Result<()>;

    async fn set_user_active(&self, user_id: UserId, active: bool) -> Result<()>;

    /// Sources with an active subscription for this user.
    async fn get_active_sources(&self, user_id: UserId) -> Result<Vec<Source>>;

    /// Highest item id already digested for this user's subscription.
    async fn get_checkpoint(&self, user_id: UserId, source_id: i64) -> Result<Option<i64>>;

    /// Advance the high-water mark. Never moves it backwards.
    async fn set_checkpoint(&self, user_id: UserId, source_id: i64, item_id: i64) -> Result<()>;

    /// Idempotent on `(source_id, item_id)`.
    async fn save_raw_item(&self, item: &RawItem) -> Result<()>;

    async fn save_digest(&self, digest: &Digest) -> Result<()>;

    /// Drop raw items captured more than `age` ago. Returns rows removed.
    async fn prune_raw_items_older_than(&self, age: Duration) -> Result<usize>;
}

/// Lists recent messages of a named channel.
#[async_trait]
pub trait FetchTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Newest-first, at most `limit` items. Signals throttling with
    /// [`DigestError::RateLimited`](crate::DigestError::RateLimited).
    async fn fetch_recent(&self, source_name: &str, limit: usize) -> Result<Vec<FetchedItem>>;
}

/// Text-in/text-out generation endpoint.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Sends one formatted message to a user.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, user_id: UserId, text: &str) -> Result<SendOutcome>;
}
