//! Syntax-tree tier: answers listing, outline and signature queries from
//! tree-sitter parses, without needing the project to compile.

use async_trait::async_trait;
use log::debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::{
    AnalysisRequest, AnalysisTier, Operation, SignatureInfo, SymbolInfo, Target, Tier, TierOutcome,
};
use crate::error::{AnalysisError, Result};
use crate::languages::cpp::{self, CppSymbol};
use crate::workspace::{display_path, is_source_file, list_source_files, FilePattern};

/// Cap on symbols returned by one search.
const SEARCH_LIMIT: usize = 100;

pub struct StructuralTier {
    root: PathBuf,
    max_scan_files: usize,
}

impl StructuralTier {
    pub fn new(root: impl Into<PathBuf>, max_scan_files: usize) -> Self {
        Self {
            root: root.into(),
            max_scan_files,
        }
    }

    async fn run(&self, request: &AnalysisRequest) -> Result<TierOutcome> {
        match (&request.operation, &request.target) {
            (Operation::ListFiles, Target::Files { pattern }) => {
                let root = self.root.clone();
                let pattern = parse_pattern(pattern.as_deref())?;
                let limit = self.max_scan_files;
                let files = blocking(move || {
                    Ok(list_source_files(&root, &pattern, limit)
                        .iter()
                        .map(|path| display_path(&root, path))
                        .collect::<Vec<_>>())
                })
                .await?;
                TierOutcome::list(files)
            }
            (Operation::Outline, Target::File(file)) => {
                let file = file.clone();
                let symbols = blocking(move || {
                    let symbols = parse_file(&file)?;
                    Ok(symbols.iter().map(|s| to_info(s, &file)).collect::<Vec<_>>())
                })
                .await?;
                TierOutcome::list(symbols)
            }
            (Operation::Signature, Target::Position(location)) => {
                let location = location.clone();
                let signature = blocking(move || {
                    let symbols = parse_file(&location.file)?;
                    Ok(cpp::symbol_at(&symbols, location.line, location.column)
                        .map(|s| to_signature(s, &location.file)))
                })
                .await?;
                TierOutcome::single(signature)
            }
            (
                Operation::SearchSymbols,
                Target::Search {
                    query,
                    file_pattern,
                },
            ) => {
                let root = self.root.clone();
                let pattern = parse_pattern(file_pattern.as_deref())?;
                let needle = query.trim().to_lowercase();
                if needle.is_empty() {
                    return Err(AnalysisError::InvalidRequest("empty search query".into()));
                }
                let limit = self.max_scan_files;
                let found = blocking(move || {
                    let mut found = Vec::new();
                    for file in list_source_files(&root, &pattern, limit) {
                        let symbols = match parse_file(&file) {
                            Ok(symbols) => symbols,
                            Err(err) => {
                                debug!("skipping {}: {err}", file.display());
                                continue;
                            }
                        };
                        found.extend(
                            symbols
                                .iter()
                                .filter(|s| s.name.to_lowercase().contains(&needle))
                                .map(|s| to_info(s, &file)),
                        );
                        if found.len() >= SEARCH_LIMIT {
                            break;
                        }
                    }
                    found.truncate(SEARCH_LIMIT);
                    Ok(found)
                })
                .await?;
                TierOutcome::list(found)
            }
            _ => Ok(TierOutcome::Unsupported),
        }
    }
}

#[async_trait]
impl AnalysisTier for StructuralTier {
    fn tier(&self) -> Tier {
        Tier::Structural
    }

    fn supports(&self, operation: Operation) -> bool {
        matches!(
            operation,
            Operation::ListFiles
                | Operation::Outline
                | Operation::Signature
                | Operation::SearchSymbols
        )
    }

    async fn execute(&self, request: &AnalysisRequest) -> TierOutcome {
        TierOutcome::from_result(self.run(request).await)
    }
}

pub(crate) fn parse_pattern(pattern: Option<&str>) -> Result<FilePattern> {
    FilePattern::new(pattern.unwrap_or("*"))
        .map_err(|err| AnalysisError::InvalidRequest(format!("bad file pattern: {err}")))
}

fn parse_file(path: &Path) -> Result<Vec<CppSymbol>> {
    if !is_source_file(path) {
        return Err(AnalysisError::InvalidRequest(format!(
            "{} is not a C/C++ source file",
            path.display()
        )));
    }
    let source = fs::read_to_string(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => AnalysisError::NotFound(path.display().to_string()),
        _ => AnalysisError::Io(err),
    })?;
    cpp::parse_symbols(&source).map_err(|err| AnalysisError::Protocol(format!("{err:#}")))
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| AnalysisError::Io(io::Error::other(err)))?
}

fn to_info(symbol: &CppSymbol, file: &Path) -> SymbolInfo {
    SymbolInfo {
        name: symbol.name.clone(),
        kind: symbol.kind.to_string(),
        container: symbol
            .container
            .clone()
            .or_else(|| symbol.namespace.last().cloned()),
        file: file.to_path_buf(),
        line: symbol.line,
        column: symbol.column,
        end_line: symbol.end_line,
        end_column: symbol.end_column,
    }
}

fn to_signature(symbol: &CppSymbol, file: &Path) -> SignatureInfo {
    let signature = match &symbol.signature {
        Some(signature) => signature.clone(),
        None if symbol.bases.is_empty() => format!("{} {}", symbol.kind, symbol.qualified_name()),
        None => format!(
            "{} {} : {}",
            symbol.kind,
            symbol.qualified_name(),
            symbol.bases.join(", ")
        ),
    };
    SignatureInfo {
        name: symbol.qualified_name(),
        kind: symbol.kind.to_string(),
        signature,
        file: file.to_path_buf(),
        line: symbol.line,
        column: symbol.column,
    }
}
