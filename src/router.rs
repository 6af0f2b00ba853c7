//! Query Router: cache first, then structural, semantic and textual tiers in
//! that fixed order.

use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::ai::AiSummary;
use crate::cache::QueryCache;
use crate::error::{AnalysisError, Result};
use crate::tiers::{
    AnalysisRequest, AnalysisTier, AttemptOutcome, Confidence, Operation, Target, Tier,
    TierAttempt, TierOutcome,
};
use crate::workspace::file_hash;

/// A routed answer, annotated with where it came from.
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub operation: Operation,
    pub tier: Tier,
    pub confidence: Confidence,
    pub cached: bool,
    pub result: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<TierAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<AiSummary>,
}

impl QueryAnswer {
    fn new(operation: Operation, tier: Tier, result: Value, cached: bool) -> Self {
        Self {
            operation,
            tier,
            confidence: tier.confidence(),
            cached,
            result,
            attempts: Vec::new(),
            summary: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.result {
            Value::Null => true,
            Value::Array(items) => items.is_empty(),
            Value::Object(map) => map
                .get("nodes")
                .and_then(|n| n.as_array())
                .map(|n| n.is_empty())
                .unwrap_or(false),
            _ => false,
        }
    }
}

pub struct QueryRouter {
    /// Fixed consultation order.
    tiers: Vec<Arc<dyn AnalysisTier>>,
    cache: Arc<QueryCache>,
    project_config_reported: AtomicBool,
}

impl QueryRouter {
    pub fn new(
        cache: Arc<QueryCache>,
        structural: Arc<dyn AnalysisTier>,
        semantic: Arc<dyn AnalysisTier>,
        textual: Arc<dyn AnalysisTier>,
    ) -> Self {
        Self::with_tiers(cache, vec![structural, semantic, textual])
    }

    pub fn with_tiers(cache: Arc<QueryCache>, tiers: Vec<Arc<dyn AnalysisTier>>) -> Self {
        Self {
            tiers,
            cache,
            project_config_reported: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Log a build configuration problem, once per session.
    pub fn report_project_config(&self, reason: &str) {
        if !self.project_config_reported.swap(true, Ordering::SeqCst) {
            warn!("{reason}; semantic analysis disabled, using structural and textual fallbacks");
        }
    }

    pub async fn route(&self, request: &AnalysisRequest) -> Result<QueryAnswer> {
        validate(request)?;
        let operation = request.operation;
        let fingerprint = request.fingerprint();
        let anchor = request.anchor_file().map(|p| p.to_path_buf());

        if anchor.is_some() {
            if let Some(answer) = self
                .cache
                .get(&fingerprint)
                .and_then(|envelope| from_envelope(operation, envelope))
            {
                debug!("{} served from cache ({fingerprint})", operation.name());
                return Ok(answer);
            }
        }

        // hash before computing so an edit racing the query reads as stale
        let source_hash = anchor.as_deref().and_then(|path| file_hash(path).ok());

        let mut attempts = Vec::with_capacity(self.tiers.len());
        let mut no_match: Option<Tier> = None;
        for tier in &self.tiers {
            let kind = tier.tier();
            if !tier.supports(operation) {
                attempts.push(attempt(kind, AttemptOutcome::Unsupported, Instant::now()));
                continue;
            }
            let started = Instant::now();
            let (result, storable) = match tier.execute(request).await {
                TierOutcome::Found(result) => (result, kind != Tier::Textual),
                TierOutcome::Partial(result) => {
                    debug!("{} tier returned a partial answer; not caching it", kind.as_str());
                    (result, false)
                }
                TierOutcome::NoMatch => {
                    attempts.push(attempt(kind, AttemptOutcome::NoMatch, started));
                    no_match = Some(kind);
                    if kind.is_authoritative() {
                        break;
                    }
                    continue;
                }
                TierOutcome::Unsupported => {
                    attempts.push(attempt(kind, AttemptOutcome::Unsupported, started));
                    continue;
                }
                TierOutcome::Failed(err) => {
                    match &err {
                        AnalysisError::ProjectConfig(reason) => self.report_project_config(reason),
                        _ => debug!("{} tier failed on {}: {err}", kind.as_str(), operation.name()),
                    }
                    attempts.push(attempt(
                        kind,
                        AttemptOutcome::Failed {
                            kind: err.kind().to_string(),
                            message: err.to_string(),
                        },
                        started,
                    ));
                    continue;
                }
            };

            attempts.push(attempt(kind, AttemptOutcome::Answered, started));
            debug!(
                "{} answered by {} tier in {}ms",
                operation.name(),
                kind.as_str(),
                started.elapsed().as_millis()
            );
            if storable {
                if let (Some(path), Some(hash)) = (&anchor, &source_hash) {
                    self.cache
                        .put(&fingerprint, operation.name(), &envelope(kind, &result), path, hash);
                }
            }
            let mut answer = QueryAnswer::new(operation, kind, result, false);
            answer.attempts = attempts;
            return Ok(answer);
        }

        match no_match {
            Some(tier) => {
                let mut answer = QueryAnswer::new(operation, tier, operation.empty_payload(), false);
                answer.attempts = attempts;
                Ok(answer)
            }
            None => Err(AnalysisError::Exhausted {
                operation: operation.name(),
                attempts,
            }),
        }
    }
}

fn validate(request: &AnalysisRequest) -> Result<()> {
    let ok = match request.operation {
        Operation::ListFiles => matches!(request.target, Target::Files { .. }),
        Operation::SearchSymbols => matches!(request.target, Target::Search { .. }),
        Operation::Outline => matches!(request.target, Target::File(_)),
        _ => matches!(request.target, Target::Position(_)),
    };
    if ok {
        Ok(())
    } else {
        Err(AnalysisError::InvalidRequest(format!(
            "{} does not accept {:?}",
            request.operation.name(),
            request.target
        )))
    }
}

fn attempt(tier: Tier, outcome: AttemptOutcome, started: Instant) -> TierAttempt {
    TierAttempt {
        tier,
        outcome,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

fn envelope(tier: Tier, result: &Value) -> Value {
    json!({ "tier": tier.as_str(), "result": result })
}

fn from_envelope(operation: Operation, mut envelope: Value) -> Option<QueryAnswer> {
    let tier = match envelope.get("tier")?.as_str()? {
        "structural" => Tier::Structural,
        "semantic" => Tier::Semantic,
        _ => return None,
    };
    let result = envelope.get_mut("result")?.take();
    Some(QueryAnswer::new(operation, tier, result, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::QueryCache;
    use crate::location::SymbolLocation;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    /// A tier that replays a scripted outcome.
    struct Scripted {
        tier: Tier,
        script: Mutex<Box<dyn FnMut() -> TierOutcome + Send>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(tier: Tier, script: impl FnMut() -> TierOutcome + Send + 'static) -> Arc<Self> {
            Arc::new(Self {
                tier,
                script: Mutex::new(Box::new(script)),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AnalysisTier for Scripted {
        fn tier(&self) -> Tier {
            self.tier
        }

        fn supports(&self, _operation: Operation) -> bool {
            true
        }

        async fn execute(&self, _request: &AnalysisRequest) -> TierOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            (script)()
        }
    }

    fn cache() -> Arc<QueryCache> {
        Arc::new(QueryCache::in_memory(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        ))
    }

    fn unsupported(tier: Tier) -> Arc<Scripted> {
        Scripted::new(tier, || TierOutcome::Unsupported)
    }

    fn failing(tier: Tier, err: fn() -> AnalysisError) -> Arc<Scripted> {
        Scripted::new(tier, move || TierOutcome::Failed(err()))
    }

    fn hover_request(dir: &tempfile::TempDir) -> AnalysisRequest {
        let file = dir.path().join("hello.cpp");
        if !file.exists() {
            fs::write(&file, "int add_numbers(int a, int b) {\n    return a + b;\n}\n").unwrap();
        }
        AnalysisRequest::at(Operation::Hover, SymbolLocation::new(file, 1, 5).unwrap())
    }

    #[tokio::test]
    async fn repeated_request_is_served_from_cache_until_the_file_changes() {
        let dir = tempdir().unwrap();
        let request = hover_request(&dir);
        let mut n = 0;
        let semantic = Scripted::new(Tier::Semantic, move || {
            n += 1;
            TierOutcome::Found(json!({ "signature": format!("int add_numbers(int a, int b) #{n}") }))
        });
        let router = QueryRouter::new(
            cache(),
            unsupported(Tier::Structural),
            semantic.clone(),
            unsupported(Tier::Textual),
        );

        let first = router.route(&request).await.unwrap();
        let second = router.route(&request).await.unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.result, second.result);
        assert_eq!(second.tier, Tier::Semantic);
        assert_eq!(semantic.calls(), 1);

        let file = request.anchor_file().unwrap();
        let mut text = fs::read_to_string(file).unwrap();
        text.push(' ');
        fs::write(file, text).unwrap();

        let third = router.route(&request).await.unwrap();
        assert!(!third.cached);
        assert_eq!(semantic.calls(), 2);
        assert_ne!(third.result, first.result);
    }

    #[tokio::test]
    async fn unavailable_engine_falls_back_to_textual_with_low_confidence() {
        let dir = tempdir().unwrap();
        let request = hover_request(&dir);
        let textual = Scripted::new(Tier::Textual, || {
            TierOutcome::Found(json!({ "signature": "int add_numbers(int a, int b)" }))
        });
        let router = QueryRouter::new(
            cache(),
            unsupported(Tier::Structural),
            failing(Tier::Semantic, || {
                AnalysisError::ServiceUnavailable("engine is degraded".into())
            }),
            textual.clone(),
        );

        let answer = router.route(&request).await.unwrap();
        assert_eq!(answer.tier, Tier::Textual);
        assert_eq!(answer.confidence, Confidence::Low);
        assert_eq!(answer.attempts.len(), 3);

        // textual answers are never cached
        let again = router.route(&request).await.unwrap();
        assert!(!again.cached);
        assert_eq!(textual.calls(), 2);
    }

    #[tokio::test]
    async fn structural_answer_skips_the_engine() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("hello.cpp");
        fs::write(&file, "int x;\n").unwrap();
        let semantic = unsupported(Tier::Semantic);
        let router = QueryRouter::new(
            cache(),
            Scripted::new(Tier::Structural, || TierOutcome::Found(json!([{"name": "x"}]))),
            semantic.clone(),
            unsupported(Tier::Textual),
        );
        let answer = router.route(&AnalysisRequest::outline(&file)).await.unwrap();
        assert_eq!(answer.tier, Tier::Structural);
        assert_eq!(answer.confidence, Confidence::High);
        assert_eq!(semantic.calls(), 0);
    }

    #[tokio::test]
    async fn engine_no_match_is_final_and_empty() {
        let dir = tempdir().unwrap();
        let textual = unsupported(Tier::Textual);
        let router = QueryRouter::new(
            cache(),
            Scripted::new(Tier::Structural, || TierOutcome::NoMatch),
            Scripted::new(Tier::Semantic, || TierOutcome::NoMatch),
            textual.clone(),
        );
        let answer = router.route(&hover_request(&dir)).await.unwrap();
        assert_eq!(answer.tier, Tier::Semantic);
        assert_eq!(answer.result, Value::Null);
        assert!(answer.is_empty());
        assert_eq!(textual.calls(), 0);
    }

    #[tokio::test]
    async fn timed_out_hierarchy_is_served_but_not_cached() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("hello.cpp");
        fs::write(&file, "int add_numbers(int a, int b) {\n    return a + b;\n}\n").unwrap();
        let request = AnalysisRequest::at(
            Operation::IncomingCalls,
            SymbolLocation::new(&file, 1, 5).unwrap(),
        );
        let mut n = 0;
        let semantic = Scripted::new(Tier::Semantic, move || {
            n += 1;
            let tree = json!({
                "direction": "incoming",
                "roots": [0],
                "nodes": [{ "id": 0, "name": "add_numbers" }],
                "levels": 0,
                "truncated": true,
                "stop_reason": "level_timeout",
            });
            // the engine catches up on the second try
            if n == 1 {
                TierOutcome::Partial(tree)
            } else {
                TierOutcome::Found(tree)
            }
        });
        let router = QueryRouter::new(
            cache(),
            unsupported(Tier::Structural),
            semantic.clone(),
            unsupported(Tier::Textual),
        );

        let first = router.route(&request).await.unwrap();
        assert_eq!(first.tier, Tier::Semantic);
        assert_eq!(first.result["truncated"], true);
        assert!(!first.cached);

        let second = router.route(&request).await.unwrap();
        assert!(!second.cached);
        assert_eq!(semantic.calls(), 2);

        let third = router.route(&request).await.unwrap();
        assert!(third.cached);
        assert_eq!(semantic.calls(), 2);
    }

    #[tokio::test]
    async fn exhaustion_reports_every_attempt() {
        let dir = tempdir().unwrap();
        let router = QueryRouter::new(
            cache(),
            unsupported(Tier::Structural),
            failing(Tier::Semantic, || AnalysisError::ProjectConfig("no compile_commands.json".into())),
            failing(Tier::Textual, || AnalysisError::Io(std::io::Error::other("disk"))),
        );
        match router.route(&hover_request(&dir)).await {
            Err(AnalysisError::Exhausted {
                operation,
                attempts,
            }) => {
                assert_eq!(operation, "hover");
                assert_eq!(attempts.len(), 3);
                assert!(matches!(
                    &attempts[1].outcome,
                    AttemptOutcome::Failed { kind, .. } if kind == "project_config_error"
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(router.project_config_reported.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn mismatched_target_is_rejected() {
        let router = QueryRouter::with_tiers(cache(), Vec::new());
        let request = AnalysisRequest {
            operation: Operation::Hover,
            target: Target::Files { pattern: None },
            options: Default::default(),
        };
        let err = router.route(&request).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }
}
