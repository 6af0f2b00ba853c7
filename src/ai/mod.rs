//! Optional AI summaries layered over routed answers.
//!
//! The crate ships no network provider; embedders register a
//! [`SummaryProvider`]. Every failure path returns the raw answer unchanged.

pub mod budget;
pub mod context;

pub use budget::CostBudget;
pub use context::{ContextBuilder, SourceContext};

use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CachedSummary, QueryCache, SummaryKey};
use crate::config::{AiConfig, AnalysisDepth, ContextDepth};
use crate::error::{AnalysisError, Result};
use crate::router::QueryAnswer;
use crate::tiers::{AnalysisRequest, Operation};
use crate::workspace::file_hash;

/// What a provider is asked to summarize.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRequest {
    pub operation: Operation,
    pub symbol: String,
    pub file: PathBuf,
    /// The raw routed result.
    pub content: Value,
    /// Source around the symbol, as much as `context_depth` asks for.
    pub context: SourceContext,
    pub analysis_depth: AnalysisDepth,
    pub context_depth: ContextDepth,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub text: String,
    pub tokens_used: u64,
    pub cost_usd: f64,
}

#[async_trait]
pub trait SummaryProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn summarize(&self, request: &SummaryRequest) -> Result<Summary>;
}

/// Summary attached to an answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AiSummary {
    pub text: String,
    pub provider: String,
    pub tokens_used: u64,
    pub cached: bool,
    pub analysis_depth: AnalysisDepth,
    pub context_depth: ContextDepth,
}

pub struct Enricher {
    config: AiConfig,
    provider: Option<Arc<dyn SummaryProvider>>,
    cache: Arc<QueryCache>,
    budget: CostBudget,
    context: ContextBuilder,
    timeout: Duration,
}

impl Enricher {
    pub fn new(config: AiConfig, root: &Path, cache: Arc<QueryCache>, timeout: Duration) -> Self {
        let budget = CostBudget::new(config.cost_limit_monthly, cache.clone());
        Self {
            config,
            provider: None,
            cache,
            budget,
            context: ContextBuilder::new(root),
            timeout,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn SummaryProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn is_active(&self) -> bool {
        self.config.enabled && self.provider.is_some()
    }

    pub fn budget(&self) -> &CostBudget {
        &self.budget
    }

    /// Attach a summary to `answer` when the request asked for one and the
    /// cache or the budget allows it.
    pub async fn enrich(&self, request: &AnalysisRequest, answer: &mut QueryAnswer) {
        if !request.options.summarize || answer.is_empty() {
            return;
        }
        let Some(provider) = self.provider.as_ref().filter(|_| self.config.enabled) else {
            debug!("summary requested but AI enrichment is off");
            return;
        };
        let Some(file) = request.anchor_file() else {
            return;
        };

        let key = SummaryKey {
            fingerprint: request.fingerprint(),
            analysis_depth: self.config.analysis_depth,
            context_depth: self.config.context_depth,
        };
        if let Some(cached) = self.cache.get_summary(&key) {
            answer.summary = Some(self.attach(cached, true));
            return;
        }
        if !self.budget.allows_call() {
            return;
        }
        let Ok(source_hash) = file_hash(file) else {
            return;
        };

        let context = self
            .context
            .build(
                file,
                request.location().map(|l| l.line),
                self.config.context_depth,
            )
            .await;
        let summary_request = SummaryRequest {
            operation: request.operation,
            symbol: symbol_label(request, &answer.result),
            file: file.to_path_buf(),
            content: answer.result.clone(),
            context,
            analysis_depth: self.config.analysis_depth,
            context_depth: self.config.context_depth,
            max_tokens: match self.config.analysis_depth {
                AnalysisDepth::Summary => 150,
                AnalysisDepth::Detailed => 500,
            },
        };
        let outcome = tokio::time::timeout(self.timeout, provider.summarize(&summary_request))
            .await
            .unwrap_or_else(|_| Err(AnalysisError::timeout("summarize", self.timeout)));
        match outcome {
            Ok(summary) => {
                self.budget.record(summary.cost_usd);
                let cached = CachedSummary {
                    text: summary.text,
                    tokens_used: summary.tokens_used,
                    provider: provider.name().to_string(),
                };
                self.cache.put_summary(&key, &cached, file, &source_hash);
                answer.summary = Some(self.attach(cached, false));
            }
            Err(err) => warn!("{} summary failed, returning raw result: {err}", provider.name()),
        }
    }

    fn attach(&self, summary: CachedSummary, cached: bool) -> AiSummary {
        AiSummary {
            text: summary.text,
            provider: summary.provider,
            tokens_used: summary.tokens_used,
            cached,
            analysis_depth: self.config.analysis_depth,
            context_depth: self.config.context_depth,
        }
    }
}

/// Best human-readable name for what the answer is about.
fn symbol_label(request: &AnalysisRequest, result: &Value) -> String {
    result
        .pointer("/nodes/0/name")
        .or_else(|| result.get("signature"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| request.location().map(|l| l.to_string()))
        .unwrap_or_default()
}
