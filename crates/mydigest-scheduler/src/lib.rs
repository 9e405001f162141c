//! # MyDigest Scheduler
//!
//! Per-user background digest loops: pull fresh channel posts, condense them
//! through a summarization endpoint, deliver the result through the bot.
//!
//! ## Design Principles
//! - One tokio task per active user, nothing polls when idle
//! - One shared scraper connection, paced and backed off on flood waits
//! - SQLite persistence; the store decides who is served after a restart
//! - Cancellation is cooperative and every sleep observes it
//!
//! ## Architecture
//! ```text
//! UserTaskScheduler (registry: user → loop)
//!   └── per cycle, every `interval`
//!         ├── DigestAggregator ──► RateLimitedFetcher ──► FetchTransport (t.me)
//!         │      └── checkpoint filter + raw item log (Store)
//!         ├── SummarizationPipeline
//!         │      ├── SummarizeStage ─┐
//!         │      └── ClusterStage  ──┴─► TextGenerator (retry + backoff)
//!         ├── DigestDeliverer ──► DeliveryTransport (4096-byte parts)
//!         └── save digest, advance checkpoints
//! ```

pub mod aggregator;
pub mod deliverer;
pub mod engine;
pub mod fetcher;
pub mod persistence;
pub mod pipeline;
pub mod retry;
pub mod store;

#[cfg(test)]
mod test_support;

pub use aggregator::DigestAggregator;
pub use deliverer::{DigestDeliverer, PART_PREFIX_RESERVE, split_digest};
pub use engine::{
    CycleOutcome, MAX_INTERVAL, ReconcileReport, SchedulerSettings, TaskState, UserTaskScheduler,
    check_interval,
};
pub use fetcher::RateLimitedFetcher;
pub use persistence::{SqliteStore, Subscription};
pub use pipeline::{ClusterStage, Stage, SummarizationPipeline, SummarizeStage};
pub use retry::RetryPolicy;
pub use store::TimedStore;
