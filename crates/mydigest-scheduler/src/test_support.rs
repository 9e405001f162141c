//! Scripted in-memory collaborators shared by the unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mydigest_core::{
    AggregatedItem, DeliveryTransport, DigestError, FetchTransport, FetchedItem, Result,
    SendOutcome, Source, TextGenerator, UserId,
};
use tokio::sync::watch;

pub(crate) fn item(id: i64, minutes_ago: i64) -> FetchedItem {
    FetchedItem {
        id,
        text: format!("post {id}"),
        captured_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
        title: None,
    }
}

pub(crate) fn source(id: i64, name: &str) -> Source {
    Source {
        source_id: id,
        name: name.to_string(),
        display_name: format!("@{name}"),
        topic: None,
        link: Source::link_for(name),
    }
}

pub(crate) fn aggregated(source_name: &str, item_id: i64, text: &str) -> AggregatedItem {
    AggregatedItem {
        source_id: 1,
        source_name: source_name.to_string(),
        display_title: format!("@{source_name}"),
        text: text.to_string(),
        item_id,
        captured_at: Utc::now(),
    }
}

#[derive(Default)]
struct FetchState {
    items: HashMap<String, Vec<FetchedItem>>,
    throttles: HashMap<String, VecDeque<Duration>>,
    always_throttled: HashSet<String>,
    failing: HashSet<String>,
    calls: HashMap<String, usize>,
    fresh: bool,
    next_id: i64,
}

/// Fetch transport with per-channel scripted behaviour.
#[derive(Default)]
pub(crate) struct FakeFetch {
    state: Mutex<FetchState>,
}

impl FakeFetch {
    pub fn set_items(&self, name: &str, items: Vec<FetchedItem>) {
        self.state
            .lock()
            .unwrap()
            .items
            .insert(name.to_string(), items);
    }

    /// Next call for `name` answers with a flood wait of `wait`.
    pub fn throttle_once(&self, name: &str, wait: Duration) {
        self.state
            .lock()
            .unwrap()
            .throttles
            .entry(name.to_string())
            .or_default()
            .push_back(wait);
    }

    pub fn throttle_always(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .always_throttled
            .insert(name.to_string());
    }

    pub fn fail(&self, name: &str) {
        self.state.lock().unwrap().failing.insert(name.to_string());
    }

    /// Every call returns one brand-new post, so each cycle has content.
    pub fn set_fresh(&self, fresh: bool) {
        self.state.lock().unwrap().fresh = fresh;
    }

    pub fn calls(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().unwrap().calls.values().sum()
    }
}

#[async_trait]
impl FetchTransport for FakeFetch {
    fn name(&self) -> &str {
        "fake-fetch"
    }

    async fn fetch_recent(&self, source_name: &str, limit: usize) -> Result<Vec<FetchedItem>> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(source_name.to_string()).or_default() += 1;

        if state.always_throttled.contains(source_name) {
            return Err(DigestError::rate_limited(Some(Duration::from_secs(1))));
        }
        if let Some(wait) = state
            .throttles
            .get_mut(source_name)
            .and_then(VecDeque::pop_front)
        {
            return Err(DigestError::rate_limited(Some(wait)));
        }
        if state.failing.contains(source_name) {
            return Err(DigestError::Http(format!("{source_name}: 500")));
        }
        if state.fresh {
            state.next_id += 1;
            return Ok(vec![item(state.next_id, 0)]);
        }

        let mut items = state.items.get(source_name).cloned().unwrap_or_default();
        items.truncate(limit);
        Ok(items)
    }
}

#[derive(Default)]
struct GeneratorState {
    prompts: Vec<String>,
    throttled: u32,
    failure: Option<DigestError>,
}

/// Generation endpoint answering `generated#<call number>`.
#[derive(Default)]
pub(crate) struct FakeGenerator {
    state: Mutex<GeneratorState>,
    reply: Option<String>,
}

impl FakeGenerator {
    pub fn with_reply(reply: &str) -> Self {
        Self {
            state: Mutex::default(),
            reply: Some(reply.to_string()),
        }
    }

    pub fn throttle_next(&self, n: u32) {
        self.state.lock().unwrap().throttled = n;
    }

    pub fn fail_next(&self, err: DigestError) {
        self.state.lock().unwrap().failure = Some(err);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.state.lock().unwrap().prompts.clone()
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().prompts.len()
    }
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    fn name(&self) -> &str {
        "fake-llm"
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.prompts.push(prompt.to_string());
        if let Some(err) = state.failure.take() {
            return Err(err);
        }
        if state.throttled > 0 {
            state.throttled -= 1;
            return Err(DigestError::rate_limited(None));
        }
        Ok(match &self.reply {
            Some(reply) => reply.clone(),
            None => format!("generated#{}", state.prompts.len()),
        })
    }
}

struct DeliveryState {
    script: VecDeque<SendOutcome>,
    fallback: SendOutcome,
    log: Vec<(UserId, String, SendOutcome)>,
    /// How long each send stays in flight after it is logged.
    latency: Duration,
}

/// Delivery transport recording every attempt. Successful sends bump a
/// watch counter so tests can await them.
pub(crate) struct FakeDelivery {
    state: Mutex<DeliveryState>,
    delivered: watch::Sender<usize>,
}

impl Default for FakeDelivery {
    fn default() -> Self {
        Self {
            state: Mutex::new(DeliveryState {
                script: VecDeque::new(),
                fallback: SendOutcome::Sent,
                log: Vec::new(),
                latency: Duration::ZERO,
            }),
            delivered: watch::channel(0).0,
        }
    }
}

impl FakeDelivery {
    /// Outcome for every send not covered by [`Self::script`].
    pub fn set_outcome(&self, outcome: SendOutcome) {
        self.state.lock().unwrap().fallback = outcome;
    }

    /// Outcomes for the next sends, in order.
    pub fn script(&self, outcomes: Vec<SendOutcome>) {
        self.state.lock().unwrap().script.extend(outcomes);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = latency;
    }

    /// Texts that were accepted.
    pub fn sent(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|(_, _, outcome)| *outcome == SendOutcome::Sent)
            .map(|(_, text, _)| text.clone())
            .collect()
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().log.len()
    }

    pub fn sent_count(&self) -> usize {
        *self.delivered.borrow()
    }

    pub async fn wait_for(&self, n: usize) {
        let mut rx = self.delivered.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }
}

#[async_trait]
impl DeliveryTransport for FakeDelivery {
    fn name(&self) -> &str {
        "fake-delivery"
    }

    async fn send(&self, user_id: UserId, text: &str) -> Result<SendOutcome> {
        let (outcome, latency) = {
            let mut state = self.state.lock().unwrap();
            let scripted = state.script.pop_front();
            let outcome = scripted.unwrap_or_else(|| state.fallback.clone());
            state
                .log
                .push((user_id, text.to_string(), outcome.clone()));
            (outcome, state.latency)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if outcome == SendOutcome::Sent {
            self.delivered.send_modify(|count| *count += 1);
        }
        Ok(outcome)
    }
}
