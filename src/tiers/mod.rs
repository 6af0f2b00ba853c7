//! The three analysis backends and the request/result types they share.

pub mod semantic;
pub mod structural;
pub mod textual;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cache::Fingerprint;
use crate::error::{AnalysisError, Result};
use crate::hierarchy::{Direction, HierarchyTree};
use crate::location::{Range, Span, SymbolLocation};
use crate::workspace::normalize_path;

pub use semantic::SemanticTier;
pub use structural::StructuralTier;
pub use textual::TextualTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Structural,
    Semantic,
    Textual,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Structural => "structural",
            Tier::Semantic => "semantic",
            Tier::Textual => "textual",
        }
    }

    pub fn confidence(self) -> Confidence {
        match self {
            Tier::Textual => Confidence::Low,
            Tier::Structural | Tier::Semantic => Confidence::High,
        }
    }

    /// A "no match" from this tier settles the question; later tiers are not asked.
    pub fn is_authoritative(self) -> bool {
        self == Tier::Semantic
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Definition,
    References,
    Hover,
    IncomingCalls,
    OutgoingCalls,
    PrepareTypeHierarchy,
    Supertypes,
    Subtypes,
    ListFiles,
    SearchSymbols,
    Outline,
    Signature,
}

impl Operation {
    pub const ALL: [Operation; 12] = [
        Operation::Definition,
        Operation::References,
        Operation::Hover,
        Operation::IncomingCalls,
        Operation::OutgoingCalls,
        Operation::PrepareTypeHierarchy,
        Operation::Supertypes,
        Operation::Subtypes,
        Operation::ListFiles,
        Operation::SearchSymbols,
        Operation::Outline,
        Operation::Signature,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Operation::Definition => "definition",
            Operation::References => "references",
            Operation::Hover => "hover",
            Operation::IncomingCalls => "incoming_calls",
            Operation::OutgoingCalls => "outgoing_calls",
            Operation::PrepareTypeHierarchy => "prepare_type_hierarchy",
            Operation::Supertypes => "supertypes",
            Operation::Subtypes => "subtypes",
            Operation::ListFiles => "list_files",
            Operation::SearchSymbols => "search_symbols",
            Operation::Outline => "outline",
            Operation::Signature => "signature",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    pub fn direction(self) -> Option<Direction> {
        match self {
            Operation::IncomingCalls => Some(Direction::Incoming),
            Operation::OutgoingCalls => Some(Direction::Outgoing),
            Operation::Supertypes => Some(Direction::Supertypes),
            Operation::Subtypes => Some(Direction::Subtypes),
            _ => None,
        }
    }

    pub fn needs_location(self) -> bool {
        !matches!(
            self,
            Operation::ListFiles | Operation::SearchSymbols | Operation::Outline
        )
    }

    /// The answer returned when a tier authoritatively found nothing.
    pub fn empty_payload(self) -> Value {
        match self {
            Operation::Hover | Operation::Signature => Value::Null,
            Operation::IncomingCalls
            | Operation::OutgoingCalls
            | Operation::Supertypes
            | Operation::Subtypes => json!({
                "direction": self.direction().map(Direction::as_str),
                "roots": [],
                "nodes": [],
                "levels": 0,
                "truncated": false,
                "stop_reason": "complete",
            }),
            _ => Value::Array(Vec::new()),
        }
    }
}

/// What a request is about.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Position(SymbolLocation),
    File(PathBuf),
    Search {
        query: String,
        file_pattern: Option<String>,
    },
    Files {
        pattern: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub include_declaration: bool,
    pub depth: Option<u32>,
    pub summarize: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub operation: Operation,
    pub target: Target,
    pub options: QueryOptions,
}

impl AnalysisRequest {
    pub fn at(operation: Operation, location: SymbolLocation) -> Self {
        Self {
            operation,
            target: Target::Position(location),
            options: QueryOptions::default(),
        }
    }

    pub fn outline(file: impl Into<PathBuf>) -> Self {
        Self {
            operation: Operation::Outline,
            target: Target::File(file.into()),
            options: QueryOptions::default(),
        }
    }

    pub fn search(query: impl Into<String>, file_pattern: Option<String>) -> Self {
        Self {
            operation: Operation::SearchSymbols,
            target: Target::Search {
                query: query.into(),
                file_pattern,
            },
            options: QueryOptions::default(),
        }
    }

    pub fn list_files(pattern: Option<String>) -> Self {
        Self {
            operation: Operation::ListFiles,
            target: Target::Files { pattern },
            options: QueryOptions::default(),
        }
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn location(&self) -> Option<&SymbolLocation> {
        match &self.target {
            Target::Position(location) => Some(location),
            _ => None,
        }
    }

    /// The single file this request's answer depends on, if any.
    pub fn anchor_file(&self) -> Option<&Path> {
        match &self.target {
            Target::Position(location) => Some(&location.file),
            Target::File(file) => Some(file),
            Target::Search { .. } | Target::Files { .. } => None,
        }
    }

    /// Parameters in canonical form. `summarize` is left out since enrichment
    /// is cached separately from the raw answer.
    pub fn canonical_params(&self) -> Value {
        let mut params = match &self.target {
            Target::Position(location) => json!({
                "file": normalize_path(&location.file),
                "line": location.line,
                "column": location.column,
            }),
            Target::File(file) => json!({ "file": normalize_path(file) }),
            Target::Search {
                query,
                file_pattern,
            } => json!({ "query": query, "file_pattern": file_pattern }),
            Target::Files { pattern } => json!({ "pattern": pattern }),
        };
        if self.operation == Operation::References {
            params["include_declaration"] = json!(self.options.include_declaration);
        }
        if self.operation.direction().is_some() {
            params["depth"] = json!(self.options.depth);
        }
        params
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.operation.name(), &self.canonical_params())
    }

    pub(crate) fn require_location(&self) -> Result<&SymbolLocation> {
        self.location().ok_or_else(|| {
            AnalysisError::InvalidRequest(format!("{} needs a file position", self.operation.name()))
        })
    }
}

/// The result of asking one tier.
#[derive(Debug)]
pub enum TierOutcome {
    Found(Value),
    /// An answer cut short by a transient failure: served, never cached.
    Partial(Value),
    /// The tier worked but has nothing for this request.
    NoMatch,
    /// The tier does not handle this operation.
    Unsupported,
    /// The tier could not run.
    Failed(AnalysisError),
}

impl TierOutcome {
    pub fn list<T: Serialize>(items: Vec<T>) -> Result<Self> {
        if items.is_empty() {
            return Ok(TierOutcome::NoMatch);
        }
        Ok(TierOutcome::Found(to_payload(&items)?))
    }

    pub fn single<T: Serialize>(item: Option<T>) -> Result<Self> {
        match item {
            Some(item) => Ok(TierOutcome::Found(to_payload(&item)?)),
            None => Ok(TierOutcome::NoMatch),
        }
    }

    pub fn hierarchy(tree: HierarchyTree) -> Result<Self> {
        let partial = tree.stop_reason.is_transient();
        let payload = to_payload(&tree)?;
        Ok(if partial {
            TierOutcome::Partial(payload)
        } else {
            TierOutcome::Found(payload)
        })
    }

    /// `NotFound` is an answer, not a failure.
    pub fn from_result(result: Result<TierOutcome>) -> Self {
        match result {
            Ok(outcome) => outcome,
            Err(AnalysisError::NotFound(_)) => TierOutcome::NoMatch,
            Err(err) => TierOutcome::Failed(err),
        }
    }
}

fn to_payload<T: Serialize>(item: &T) -> Result<Value> {
    serde_json::to_value(item).map_err(|err| AnalysisError::Protocol(err.to_string()))
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Answered,
    NoMatch,
    Unsupported,
    Failed { kind: String, message: String },
}

/// One line of the per-request tier log.
#[derive(Debug, Clone, Serialize)]
pub struct TierAttempt {
    pub tier: Tier,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
    pub elapsed_ms: u64,
}

#[async_trait]
pub trait AnalysisTier: Send + Sync {
    fn tier(&self) -> Tier;

    fn supports(&self, operation: Operation) -> bool;

    async fn execute(&self, request: &AnalysisRequest) -> TierOutcome;
}

// ==================== Payload shapes ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolInfo {
    pub name: String,
    pub kind: String,
    pub container: Option<String>,
    pub file: PathBuf,
    pub line: u32,
    pub column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl SymbolInfo {
    /// From a 0-based engine range.
    pub fn new(
        name: &str,
        kind: String,
        container: Option<String>,
        file: &Path,
        range: Range,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            container,
            file: file.to_path_buf(),
            line: range.start.line + 1,
            column: range.start.character + 1,
            end_line: range.end.line + 1,
            end_column: range.end.character + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HoverInfo {
    pub signature: String,
    pub documentation: String,
    pub range: Option<Span>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reference {
    #[serde(flatten)]
    pub span: Span,
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureInfo {
    pub name: String,
    pub kind: String,
    pub signature: String,
    pub file: PathBuf,
    pub line: u32,
    pub column: u32,
}

/// Reads lines of source files for previews, each file at most once.
#[derive(Default)]
pub struct LineReader {
    files: HashMap<PathBuf, Vec<String>>,
}

impl LineReader {
    /// Trimmed text of a 1-based line; empty when unreadable.
    pub fn line(&mut self, file: &Path, line: u32) -> String {
        let lines = self.files.entry(file.to_path_buf()).or_insert_with(|| {
            fs::read_to_string(file)
                .map(|text| text.lines().map(str::to_string).collect())
                .unwrap_or_default()
        });
        line.checked_sub(1)
            .and_then(|idx| lines.get(idx as usize))
            .map(|text| text.trim().to_string())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn fingerprint_ignores_summarize_but_not_depth() {
        let loc = SymbolLocation::new("/p/hello.cpp", 5, 10).unwrap();
        let plain = AnalysisRequest::at(Operation::IncomingCalls, loc.clone());
        let summarized = plain.clone().with_options(QueryOptions {
            summarize: true,
            ..QueryOptions::default()
        });
        let deeper = plain.clone().with_options(QueryOptions {
            depth: Some(5),
            ..QueryOptions::default()
        });
        assert_eq!(plain.fingerprint(), summarized.fingerprint());
        assert_ne!(plain.fingerprint(), deeper.fingerprint());
        assert_ne!(
            plain.fingerprint(),
            AnalysisRequest::at(Operation::OutgoingCalls, loc).fingerprint()
        );
    }

    #[test]
    fn operation_names_round_trip() {
        for op in Operation::ALL {
            assert_eq!(Operation::from_name(op.name()), Some(op));
        }
        assert!(Operation::from_name("rename").is_none());
        assert!(!Operation::ListFiles.needs_location());
        assert!(Operation::Signature.needs_location());
    }

    #[test]
    fn not_found_becomes_no_match() {
        let outcome = TierOutcome::from_result(Err(AnalysisError::NotFound("x".into())));
        assert!(matches!(outcome, TierOutcome::NoMatch));
        let outcome = TierOutcome::from_result(Err(AnalysisError::Crash("gone".into())));
        assert!(matches!(outcome, TierOutcome::Failed(_)));
        assert!(matches!(TierOutcome::list::<u32>(vec![]), Ok(TierOutcome::NoMatch)));
    }

    #[test]
    fn attempts_serialize_flat() {
        let attempt = TierAttempt {
            tier: Tier::Semantic,
            outcome: AttemptOutcome::Failed {
                kind: "timeout".into(),
                message: "hover timed out".into(),
            },
            elapsed_ms: 5000,
        };
        let value = serde_json::to_value(&attempt).unwrap();
        assert_eq!(value["tier"], "semantic");
        assert_eq!(value["outcome"], "failed");
        assert_eq!(value["kind"], "timeout");
    }

    #[test]
    fn line_reader_is_one_based() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.cpp");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "int a;\n   int b = a;  ").unwrap();
        let mut reader = LineReader::default();
        assert_eq!(reader.line(&path, 2), "int b = a;");
        assert_eq!(reader.line(&path, 0), "");
        assert_eq!(reader.line(&path, 9), "");
    }
}
