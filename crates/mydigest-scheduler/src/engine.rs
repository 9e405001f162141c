//! Scheduler engine — one long-lived digest loop per active user.
//!
//! The registry maps each user to at most one running loop. Every lifecycle
//! change (start, restart with a new interval, stop) happens with the
//! registry locked and the old loop cancelled *and joined* before anything
//! new is spawned, so two loops for the same user never overlap.
//!
//! Cancellation is honoured up to the point a digest exists. From then on
//! delivery, history and checkpoints run to completion, so a restart never
//! re-sends what the old loop already handed to the transport.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use mydigest_core::config::SchedulerConfig;
use mydigest_core::{
    AggregatedItem, DeliveryTransport, Digest, DigestError, FetchTransport, MyDigestConfig,
    Result, Store, TextGenerator, UserId,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregator::DigestAggregator;
use crate::deliverer::DigestDeliverer;
use crate::fetcher::RateLimitedFetcher;
use crate::pipeline::SummarizationPipeline;
use crate::retry::RetryPolicy;
use crate::store::TimedStore;

/// Timing knobs of the per-user loop.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Used when a user never picked an interval or the store is down.
    pub default_interval: Duration,
    /// Lower bound of the look-back window, whatever the interval.
    pub min_window: Duration,
    /// Raw items older than this are pruned at the start of each cycle.
    pub retention: Duration,
}

impl SchedulerSettings {
    pub fn from_config(cfg: &SchedulerConfig) -> Self {
        Self {
            default_interval: Duration::from_secs(cfg.default_interval_secs.max(1)),
            min_window: Duration::from_secs(cfg.min_window_secs),
            retention: Duration::from_secs(cfg.retention_secs),
        }
    }
}

/// Longest interval a user can pick.
pub const MAX_INTERVAL: Duration = Duration::from_secs(366 * 24 * 3600);

/// Whole seconds between one second and [`MAX_INTERVAL`].
pub fn check_interval(interval: Duration) -> Result<()> {
    if interval < Duration::from_secs(1) || interval > MAX_INTERVAL {
        return Err(DigestError::Config(format!(
            "interval must be between 1s and {}s, got {interval:?}",
            MAX_INTERVAL.as_secs()
        )));
    }
    Ok(())
}

/// Lifecycle of one user's loop as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Stopped,
    Starting,
    Running,
    /// Old loop being cancelled, a new one about to take over.
    Restarting,
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing new since the last digest.
    Idle,
    Delivered { items: usize, parts: usize },
}

/// What [`UserTaskScheduler::reconcile`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: usize,
    pub stopped: usize,
    pub restarted: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.started + self.stopped + self.restarted == 0
    }
}

struct UserTask {
    interval: Duration,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    generation: u64,
    started_at: DateTime<Utc>,
}

impl UserTask {
    async fn shutdown(self, user_id: UserId) {
        self.cancel.cancel();
        match self.handle.await {
            Err(e) if e.is_panic() => {
                tracing::warn!(user_id, "⚠️ Digest loop ended with a panic: {e}");
            }
            _ => {}
        }
        tracing::debug!(
            user_id,
            generation = self.generation,
            uptime_secs = (Utc::now() - self.started_at).num_seconds(),
            "Digest loop joined"
        );
    }
}

struct Inner {
    store: Arc<dyn Store>,
    aggregator: DigestAggregator,
    pipeline: SummarizationPipeline,
    deliverer: DigestDeliverer,
    settings: SchedulerSettings,
    registry: Mutex<HashMap<UserId, UserTask>>,
    /// Users whose loop is being (re)started right now.
    transitions: std::sync::Mutex<HashMap<UserId, TaskState>>,
    generation: AtomicU64,
}

/// Owns every user's recurring digest task. Cheap to clone.
#[derive(Clone)]
pub struct UserTaskScheduler {
    inner: Arc<Inner>,
}

impl UserTaskScheduler {
    /// Wire the whole pipeline from configuration and the four collaborators.
    pub fn new(
        store: Arc<dyn Store>,
        fetch: Arc<dyn FetchTransport>,
        generator: Arc<dyn TextGenerator>,
        delivery: Arc<dyn DeliveryTransport>,
        config: &MyDigestConfig,
    ) -> Self {
        let store: Arc<dyn Store> = Arc::new(TimedStore::new(
            store,
            Duration::from_millis(config.scheduler.store_timeout_ms),
        ));
        let fetcher = RateLimitedFetcher::new(
            fetch,
            RetryPolicy::for_scraper(&config.scraper),
            config.scraper.fetch_limit,
        );
        let aggregator =
            DigestAggregator::new(store.clone(), fetcher, config.scraper.source_pacing());
        let pipeline = SummarizationPipeline::new(
            generator,
            RetryPolicy::from_config(&config.retry),
            &config.llm.language,
        );
        let deliverer = DigestDeliverer::new(
            delivery,
            config.telegram.max_message_len,
            config.telegram.chunk_pacing(),
        );
        Self::from_parts(
            store,
            aggregator,
            pipeline,
            deliverer,
            SchedulerSettings::from_config(&config.scheduler),
        )
    }

    /// Assemble from prebuilt components, e.g. a pipeline with extra stages.
    /// `store` should already be bounded by a timeout.
    pub fn from_parts(
        store: Arc<dyn Store>,
        aggregator: DigestAggregator,
        pipeline: SummarizationPipeline,
        deliverer: DigestDeliverer,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                aggregator,
                pipeline,
                deliverer,
                settings,
                registry: Mutex::new(HashMap::new()),
                transitions: std::sync::Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start (or restart) the user's loop with their persisted interval.
    pub async fn start(&self, user_id: UserId) {
        let mut registry = self.inner.registry.lock().await;
        self.replace_locked(&mut registry, user_id).await;

        let interval = self.persisted_interval(user_id).await.unwrap_or_else(|e| {
            tracing::warn!(user_id, "⚠️ Interval unavailable, using default: {e}");
            self.inner.settings.default_interval
        });
        self.persist_active(user_id).await;
        self.spawn_locked(&mut registry, user_id, interval);
    }

    /// Persist a new interval and restart the loop with it right away.
    pub async fn set_interval(&self, user_id: UserId, interval: Duration) -> Result<()> {
        check_interval(interval)?;
        if let Err(e) = self.inner.store.set_user_interval(user_id, interval).await {
            tracing::warn!(user_id, "⚠️ Interval not persisted, applying anyway: {e}");
        }

        let mut registry = self.inner.registry.lock().await;
        self.replace_locked(&mut registry, user_id).await;
        self.persist_active(user_id).await;
        self.spawn_locked(&mut registry, user_id, interval);
        Ok(())
    }

    /// Stop the user's loop and mark them inactive. Returns whether a loop
    /// was running. A digest already being delivered is finished first.
    pub async fn stop(&self, user_id: UserId) -> bool {
        let was_running = {
            let mut registry = self.inner.registry.lock().await;
            match registry.remove(&user_id) {
                Some(task) => {
                    task.shutdown(user_id).await;
                    true
                }
                None => false,
            }
        };
        if let Err(e) = self.inner.store.set_user_active(user_id, false).await {
            tracing::warn!(user_id, "⚠️ Inactive flag not persisted: {e}");
        }
        if was_running {
            tracing::info!(user_id, "⏹️ Digest loop stopped");
        }
        was_running
    }

    /// Start a loop for every user the store flags as active.
    pub async fn recover(&self) -> Result<usize> {
        let users = self.inner.store.get_active_users().await?;
        for &user_id in &users {
            self.start(user_id).await;
        }
        tracing::info!(users = users.len(), "♻️ Recovered digest loops");
        Ok(users.len())
    }

    /// Bring the registry in line with the store: start loops for newly
    /// active users, stop loops of users no longer active and restart loops
    /// whose persisted interval changed. Never writes the store.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let active = self.inner.store.get_active_users().await?;
        let wanted: HashSet<UserId> = active.iter().copied().collect();
        let mut report = ReconcileReport::default();

        let mut registry = self.inner.registry.lock().await;
        let gone: Vec<UserId> = registry
            .keys()
            .filter(|id| !wanted.contains(id))
            .copied()
            .collect();
        for user_id in gone {
            if let Some(task) = registry.remove(&user_id) {
                task.shutdown(user_id).await;
                tracing::info!(user_id, "⏹️ Digest loop stopped, user no longer active");
                report.stopped += 1;
            }
        }

        for user_id in active {
            let interval = match self.persisted_interval(user_id).await {
                Ok(interval) => interval,
                Err(e) => {
                    tracing::warn!(user_id, "⚠️ Interval unavailable, leaving loop as is: {e}");
                    continue;
                }
            };
            match registry.get(&user_id) {
                Some(task) if task.interval == interval && !task.handle.is_finished() => continue,
                Some(_) => report.restarted += 1,
                None => report.started += 1,
            }
            self.replace_locked(&mut registry, user_id).await;
            self.spawn_locked(&mut registry, user_id, interval);
        }
        Ok(report)
    }

    /// Cancel and join every loop. Persisted flags are left untouched so the
    /// next `recover` brings the same users back.
    pub async fn shutdown(&self) {
        let mut registry = self.inner.registry.lock().await;
        let tasks: Vec<(UserId, UserTask)> = registry.drain().collect();
        for (_, task) in &tasks {
            task.cancel.cancel();
        }
        for (user_id, task) in tasks {
            task.shutdown(user_id).await;
        }
        tracing::info!("🛑 Scheduler shut down");
    }

    pub async fn state(&self, user_id: UserId) -> TaskState {
        if let Some(state) = self.transition(user_id) {
            return state;
        }
        match self.inner.registry.lock().await.get(&user_id) {
            Some(task) if !task.handle.is_finished() => TaskState::Running,
            _ => TaskState::Stopped,
        }
    }

    pub async fn is_running(&self, user_id: UserId) -> bool {
        self.inner
            .registry
            .lock()
            .await
            .get(&user_id)
            .is_some_and(|t| !t.handle.is_finished())
    }

    pub async fn running_users(&self) -> Vec<UserId> {
        let registry = self.inner.registry.lock().await;
        let mut users: Vec<UserId> = registry
            .iter()
            .filter(|(_, t)| !t.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        users.sort_unstable();
        users
    }

    pub async fn running_count(&self) -> usize {
        self.running_users().await.len()
    }

    /// Interval the user's live loop was started with.
    pub async fn interval_of(&self, user_id: UserId) -> Option<Duration> {
        self.inner
            .registry
            .lock()
            .await
            .get(&user_id)
            .map(|t| t.interval)
    }

    /// Run one cycle for `user_id` outside any loop.
    pub async fn run_once(&self, user_id: UserId, interval: Duration) -> Result<CycleOutcome> {
        self.inner.run_cycle(user_id, interval).await
    }

    // ─── Internals ────────────────────────────────────────────

    fn transition(&self, user_id: UserId) -> Option<TaskState> {
        self.inner
            .transitions
            .lock()
            .ok()
            .and_then(|t| t.get(&user_id).copied())
    }

    fn set_transition(&self, user_id: UserId, state: Option<TaskState>) {
        if let Ok(mut transitions) = self.inner.transitions.lock() {
            match state {
                Some(state) => transitions.insert(user_id, state),
                None => transitions.remove(&user_id),
            };
        }
    }

    /// Cancel and join the current loop, if any. Registry must be held.
    async fn replace_locked(&self, registry: &mut HashMap<UserId, UserTask>, user_id: UserId) {
        match registry.remove(&user_id) {
            Some(old) => {
                self.set_transition(user_id, Some(TaskState::Restarting));
                tracing::info!(user_id, "🔁 Restarting digest loop");
                old.shutdown(user_id).await;
            }
            None => self.set_transition(user_id, Some(TaskState::Starting)),
        }
    }

    /// The user's stored interval, or the default when none was picked.
    /// Out-of-range values written behind our back are clamped.
    async fn persisted_interval(&self, user_id: UserId) -> Result<Duration> {
        let interval = self
            .inner
            .store
            .get_user_interval(user_id)
            .await?
            .unwrap_or(self.inner.settings.default_interval);
        Ok(interval.clamp(Duration::from_secs(1), MAX_INTERVAL))
    }

    async fn persist_active(&self, user_id: UserId) {
        if let Err(e) = self.inner.store.set_user_active(user_id, true).await {
            tracing::warn!(user_id, "⚠️ Active flag not persisted: {e}");
        }
    }

    /// Spawn a fresh loop. Registry must be held and the old loop joined.
    fn spawn_locked(
        &self,
        registry: &mut HashMap<UserId, UserTask>,
        user_id: UserId,
        interval: Duration,
    ) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_user_loop(
            self.inner.clone(),
            user_id,
            interval,
            generation,
            cancel.clone(),
        ));
        registry.insert(
            user_id,
            UserTask {
                interval,
                cancel,
                handle,
                generation,
                started_at: Utc::now(),
            },
        );
        self.set_transition(user_id, None);
        tracing::info!(
            user_id,
            interval_secs = interval.as_secs(),
            "▶️ Digest loop started"
        );
    }
}

async fn run_user_loop(
    inner: Arc<Inner>,
    user_id: UserId,
    interval: Duration,
    generation: u64,
    cancel: CancellationToken,
) {
    loop {
        let prepared = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            prepared = AssertUnwindSafe(inner.prepare(user_id, interval)).catch_unwind() => prepared,
        };

        // Past this point the digest is committed: no racing the token.
        let outcome = match prepared {
            Ok(Ok(Some(_))) if cancel.is_cancelled() => break,
            Ok(Ok(Some((items, content)))) => {
                AssertUnwindSafe(inner.commit(user_id, items, content))
                    .catch_unwind()
                    .await
            }
            Ok(Ok(None)) => Ok(Ok(CycleOutcome::Idle)),
            Ok(Err(e)) => Ok(Err(e)),
            Err(panic) => Err(panic),
        };

        match outcome {
            Ok(Ok(CycleOutcome::Idle)) => {}
            Ok(Ok(CycleOutcome::Delivered { items, parts })) => {
                tracing::debug!(user_id, items, parts, "Cycle complete");
            }
            Ok(Err(e)) if e.is_terminal() => {
                tracing::warn!(user_id, "🚫 {e}; deactivating user");
                inner.deactivate_self(user_id, generation, &cancel).await;
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!(user_id, "⚠️ Cycle failed, retrying next tick: {e}");
            }
            Err(_) => {
                tracing::error!(user_id, "💥 Cycle panicked, retrying next tick");
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    tracing::debug!(user_id, generation, "Digest loop cancelled");
}

impl Inner {
    async fn run_cycle(&self, user_id: UserId, interval: Duration) -> Result<CycleOutcome> {
        match self.prepare(user_id, interval).await? {
            Some((items, content)) => self.commit(user_id, items, content).await,
            None => Ok(CycleOutcome::Idle),
        }
    }

    /// Prune, collect and summarize. `None` when there is nothing new.
    async fn prepare(
        &self,
        user_id: UserId,
        interval: Duration,
    ) -> Result<Option<(Vec<AggregatedItem>, String)>> {
        match self
            .store
            .prune_raw_items_older_than(self.settings.retention)
            .await
        {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!(pruned, "🧹 Pruned old raw items"),
            Err(e) => tracing::warn!("⚠️ Raw item pruning skipped: {e}"),
        }

        let window = interval.max(self.settings.min_window);
        let items = self.aggregator.collect(user_id, window).await?;
        if items.is_empty() {
            tracing::debug!(user_id, "💤 Nothing new this cycle");
            return Ok(None);
        }

        let content = self.pipeline.run(&items).await?;
        Ok(Some((items, content)))
    }

    /// Deliver, record the digest and advance the high-water marks.
    async fn commit(
        &self,
        user_id: UserId,
        items: Vec<AggregatedItem>,
        content: String,
    ) -> Result<CycleOutcome> {
        let parts = self.deliverer.deliver(user_id, &content).await?;

        let digest = Digest {
            user_id,
            content,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.save_digest(&digest).await {
            tracing::warn!(user_id, "⚠️ Digest delivered but not saved: {e}");
        }

        let mut marks: HashMap<i64, i64> = HashMap::new();
        for item in &items {
            let mark = marks.entry(item.source_id).or_insert(item.item_id);
            *mark = (*mark).max(item.item_id);
        }
        for (source_id, item_id) in marks {
            if let Err(e) = self.store.set_checkpoint(user_id, source_id, item_id).await {
                tracing::warn!(user_id, source_id, "⚠️ Checkpoint not advanced: {e}");
            }
        }

        Ok(CycleOutcome::Delivered {
            items: items.len(),
            parts,
        })
    }

    /// Persist the user inactive and drop our own registry entry.
    async fn deactivate_self(&self, user_id: UserId, generation: u64, cancel: &CancellationToken) {
        if let Err(e) = self.store.set_user_active(user_id, false).await {
            tracing::warn!(user_id, "⚠️ Inactive flag not persisted: {e}");
        }
        // A concurrent restart holds the lock while joining us; it cancels
        // first, so bail out instead of waiting on it.
        let mut registry = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            registry = self.registry.lock() => registry,
        };
        if registry
            .get(&user_id)
            .is_some_and(|t| t.generation == generation)
        {
            registry.remove(&user_id);
        }
    }
}
