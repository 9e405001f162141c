//! Summarization pipeline: ordered text stages over one generation endpoint.
//!
//! ```text
//! items ─render─► SummarizeStage ─► ClusterStage ─► (more stages) ─► digest text
//! ```
//! Each stage only builds a prompt; the pipeline owns the endpoint and the
//! retry policy, so adding a stage never touches the scheduler.

use std::fmt::Write as _;
use std::sync::Arc;

use mydigest_core::{AggregatedItem, DigestError, Result, TextGenerator};

use crate::retry::RetryPolicy;

/// One text-to-text step.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn build_prompt(&self, input: &str) -> String;
}

/// Per-post summaries, each ending with the post link.
pub struct SummarizeStage {
    pub language: String,
}

impl Stage for SummarizeStage {
    fn name(&self) -> &'static str {
        "summarize"
    }

    fn build_prompt(&self, input: &str) -> String {
        format!(
            "Summarize each of the channel posts below in {lang}. \
             Produce one bullet per post, at most 150 characters each, \
             and put the post link on the line after its summary as `📌 <link>`. \
             Do not merge posts and do not invent facts.\n\nPosts:\n{input}",
            lang = self.language
        )
    }
}

/// Groups summaries into topics and formats the final digest.
pub struct ClusterStage {
    pub language: String,
}

impl Stage for ClusterStage {
    fn name(&self) -> &'static str {
        "cluster"
    }

    fn build_prompt(&self, input: &str) -> String {
        format!(
            "Group the summaries below into a few topics in {lang}. \
             Start each topic with a bold heading using Telegram HTML (<b>Topic</b>), \
             keep every summary together with its link, merge near-duplicates, \
             and use only <b>, <i> and <a href> tags.\n\nSummaries:\n{input}",
            lang = self.language
        )
    }
}

/// Render aggregated items into the text fed to the first stage.
pub fn render_items(items: &[AggregatedItem]) -> String {
    let mut out = String::new();
    for item in items {
        let _ = writeln!(
            out,
            "- [{}] {} ({})\n  {}",
            item.display_title,
            item.text.trim(),
            item.link(),
            item.captured_at.format("%Y-%m-%d %H:%M UTC")
        );
    }
    out
}

pub struct SummarizationPipeline {
    generator: Arc<dyn TextGenerator>,
    retry: RetryPolicy,
    language: String,
    stages: Vec<Arc<dyn Stage>>,
}

impl SummarizationPipeline {
    /// Default two-stage pipeline: summarize, then cluster.
    pub fn new(generator: Arc<dyn TextGenerator>, retry: RetryPolicy, language: &str) -> Self {
        Self {
            generator,
            retry,
            language: language.to_string(),
            stages: vec![
                Arc::new(SummarizeStage {
                    language: language.to_string(),
                }),
                Arc::new(ClusterStage {
                    language: language.to_string(),
                }),
            ],
        }
    }

    /// Append a stage after the existing ones.
    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// All stages in order.
    pub async fn run(&self, items: &[AggregatedItem]) -> Result<String> {
        let mut text = render_items(items);
        for stage in &self.stages {
            text = self.apply(stage.as_ref(), &text).await?;
        }
        Ok(text)
    }

    /// First stage only.
    pub async fn summarize(&self, items: &[AggregatedItem]) -> Result<String> {
        let text = render_items(items);
        let stage = SummarizeStage {
            language: self.language.clone(),
        };
        self.apply(&stage, &text).await
    }

    /// Second stage only.
    pub async fn cluster(&self, summaries: &str) -> Result<String> {
        let stage = ClusterStage {
            language: self.language.clone(),
        };
        self.apply(&stage, summaries).await
    }

    async fn apply(&self, stage: &dyn Stage, input: &str) -> Result<String> {
        let prompt = stage.build_prompt(input);
        let label = format!("stage:{}", stage.name());
        let output = self
            .retry
            .run(&label, || self.generator.generate(&prompt))
            .await
            .map_err(|e| match e {
                DigestError::RetriesExhausted { attempts, .. } => {
                    DigestError::SummarizationExhausted {
                        stage: stage.name().to_string(),
                        attempts,
                    }
                }
                other => other,
            })?;

        let output = output.trim();
        if output.is_empty() {
            return Err(DigestError::Summarization(format!(
                "stage '{}' returned empty output",
                stage.name()
            )));
        }
        tracing::debug!(stage = stage.name(), chars = output.len(), "🧠 Stage done");
        Ok(output.to_string())
    }
}
