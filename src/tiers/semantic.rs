//! Compiler-accurate tier backed by the clangd session.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::textual::identifier_at;
use super::{
    AnalysisRequest, AnalysisTier, LineReader, Operation, Reference, SignatureInfo, Target, Tier,
    TierOutcome,
};
use crate::error::{AnalysisError, Result};
use crate::hierarchy::{
    Direction, Edge, HierarchyEngine, HierarchyItem, HierarchySource, TraversalLimits,
};
use crate::location::{path_to_uri, SymbolLocation};
use crate::protocol::lsp::{
    hierarchy_edges, hierarchy_items, parse_document_symbols, parse_hover, parse_locations,
    parse_workspace_symbols, text_document_position,
};
use crate::protocol::{DocumentTracker, ProtocolClient};
use crate::workspace::FilePattern;

const SEARCH_LIMIT: usize = 100;

/// The engine plus the documents it has open.
#[derive(Clone)]
pub struct EngineSession {
    pub client: ProtocolClient,
    pub documents: Arc<DocumentTracker>,
}

impl EngineSession {
    async fn open(&self, file: &Path) -> Result<()> {
        if !file.is_file() {
            return Err(AnalysisError::NotFound(file.display().to_string()));
        }
        self.documents.ensure_open(&self.client, file).await
    }

    async fn at(&self, method: &str, location: &SymbolLocation, extra: Option<Value>) -> Result<Value> {
        self.open(&location.file).await?;
        let mut params = text_document_position(location);
        if let Some(Value::Object(extra)) = extra {
            if let Value::Object(map) = &mut params {
                map.extend(extra);
            }
        }
        self.client.request(method, params).await
    }
}

pub struct SemanticTier {
    root: PathBuf,
    /// `Err` holds the build configuration problem that keeps the engine off.
    session: std::result::Result<EngineSession, String>,
    references_limit: usize,
    limits: TraversalLimits,
}

impl SemanticTier {
    pub fn new(
        root: impl Into<PathBuf>,
        session: EngineSession,
        references_limit: usize,
        limits: TraversalLimits,
    ) -> Self {
        Self {
            root: root.into(),
            session: Ok(session),
            references_limit,
            limits,
        }
    }

    /// A tier that fails every request because the project cannot be compiled.
    pub fn unconfigured(root: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            session: Err(reason.into()),
            references_limit: 0,
            limits: TraversalLimits::default(),
        }
    }

    async fn run(&self, session: &EngineSession, request: &AnalysisRequest) -> Result<TierOutcome> {
        if let Some(direction) = request.operation.direction() {
            let location = request.require_location()?;
            let engine = HierarchyEngine::new(self.limits.with_depth(request.options.depth));
            let source = SemanticHierarchy {
                session: session.clone(),
            };
            let tree = engine.traverse(&source, location, direction).await?;
            return TierOutcome::hierarchy(tree);
        }

        match (&request.operation, &request.target) {
            (Operation::Definition, Target::Position(location)) => {
                let result = session.at("textDocument/definition", location, None).await?;
                TierOutcome::list(parse_locations(&result))
            }
            (Operation::References, Target::Position(location)) => {
                let context = json!({
                    "context": { "includeDeclaration": request.options.include_declaration }
                });
                let result = session
                    .at("textDocument/references", location, Some(context))
                    .await?;
                let mut lines = LineReader::default();
                let references: Vec<Reference> = parse_locations(&result)
                    .into_iter()
                    .take(self.references_limit)
                    .map(|span| Reference {
                        preview: lines.line(&span.file, span.line),
                        span,
                    })
                    .collect();
                TierOutcome::list(references)
            }
            (Operation::Hover, Target::Position(location)) => {
                let result = session.at("textDocument/hover", location, None).await?;
                TierOutcome::single(parse_hover(&result, &location.file))
            }
            (Operation::Signature, Target::Position(location)) => {
                self.signature(session, location).await
            }
            (Operation::Outline, Target::File(file)) => {
                session.open(file).await?;
                let params = json!({ "textDocument": { "uri": path_to_uri(file) } });
                let result = session
                    .client
                    .request("textDocument/documentSymbol", params)
                    .await?;
                TierOutcome::list(parse_document_symbols(&result, file))
            }
            (
                Operation::SearchSymbols,
                Target::Search {
                    query,
                    file_pattern,
                },
            ) => {
                let pattern = match file_pattern {
                    Some(p) => Some(FilePattern::new(p).map_err(|err| {
                        AnalysisError::InvalidRequest(format!("bad file pattern: {err}"))
                    })?),
                    None => None,
                };
                let result = session
                    .client
                    .request("workspace/symbol", json!({ "query": query }))
                    .await?;
                let symbols: Vec<_> = parse_workspace_symbols(&result)
                    .into_iter()
                    .filter(|s| {
                        pattern
                            .as_ref()
                            .map(|p| p.matches(&self.root, &s.file))
                            .unwrap_or(true)
                    })
                    .take(SEARCH_LIMIT)
                    .collect();
                TierOutcome::list(symbols)
            }
            (Operation::PrepareTypeHierarchy, Target::Position(location)) => {
                let result = session
                    .at("textDocument/prepareTypeHierarchy", location, None)
                    .await?;
                TierOutcome::list(hierarchy_items(&result))
            }
            _ => Ok(TierOutcome::Unsupported),
        }
    }

    /// Hover text for the type, the document outline for name and kind.
    async fn signature(
        &self,
        session: &EngineSession,
        location: &SymbolLocation,
    ) -> Result<TierOutcome> {
        let hover = session.at("textDocument/hover", location, None).await?;
        let Some(hover) = parse_hover(&hover, &location.file) else {
            return Ok(TierOutcome::NoMatch);
        };
        if hover.signature.is_empty() {
            return Ok(TierOutcome::NoMatch);
        }

        let params = json!({ "textDocument": { "uri": location.uri() } });
        let outline = session
            .client
            .request("textDocument/documentSymbol", params)
            .await
            .map(|result| parse_document_symbols(&result, &location.file))
            .unwrap_or_default();
        let symbol = outline.into_iter().find(|s| {
            s.line == location.line && location.column >= s.column && location.column < s.end_column
        });

        let mut lines = LineReader::default();
        let line = lines.line(&location.file, location.line);
        let (name, kind) = match symbol {
            Some(s) => (
                match s.container {
                    Some(owner) => format!("{owner}::{}", s.name),
                    None => s.name,
                },
                s.kind,
            ),
            None => (
                identifier_at(&line, location.column).unwrap_or_default(),
                "symbol".to_string(),
            ),
        };
        TierOutcome::single(Some(SignatureInfo {
            name,
            kind,
            signature: hover.signature,
            file: location.file.clone(),
            line: location.line,
            column: location.column,
        }))
    }
}

#[async_trait]
impl AnalysisTier for SemanticTier {
    fn tier(&self) -> Tier {
        Tier::Semantic
    }

    fn supports(&self, operation: Operation) -> bool {
        operation != Operation::ListFiles
    }

    async fn execute(&self, request: &AnalysisRequest) -> TierOutcome {
        if !self.supports(request.operation) {
            return TierOutcome::Unsupported;
        }
        match &self.session {
            Ok(session) => TierOutcome::from_result(self.run(session, request).await),
            Err(reason) => TierOutcome::Failed(AnalysisError::ProjectConfig(reason.clone())),
        }
    }
}

/// One hierarchy level per engine round trip.
struct SemanticHierarchy {
    session: EngineSession,
}

#[async_trait]
impl HierarchySource for SemanticHierarchy {
    async fn prepare(
        &self,
        location: &SymbolLocation,
        direction: Direction,
    ) -> Result<Vec<HierarchyItem>> {
        let method = if direction.is_call() {
            "textDocument/prepareCallHierarchy"
        } else {
            "textDocument/prepareTypeHierarchy"
        };
        let result = self.session.at(method, location, None).await?;
        Ok(hierarchy_items(&result))
    }

    async fn expand(&self, item: &HierarchyItem, direction: Direction) -> Result<Vec<Edge>> {
        let method = match direction {
            Direction::Incoming => "callHierarchy/incomingCalls",
            Direction::Outgoing => "callHierarchy/outgoingCalls",
            Direction::Supertypes => "typeHierarchy/supertypes",
            Direction::Subtypes => "typeHierarchy/subtypes",
        };
        let result = self
            .session
            .client
            .request(method, json!({ "item": item.handle }))
            .await?;
        Ok(hierarchy_edges(&result, item, direction))
    }
}
