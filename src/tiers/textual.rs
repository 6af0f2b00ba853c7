//! Last-resort tier: regular-expression search over the project's sources.
//!
//! Everything here is a heuristic. Answers are reported with low confidence
//! and never cached.

use async_trait::async_trait;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::structural::parse_pattern;
use super::{
    AnalysisRequest, AnalysisTier, HoverInfo, Operation, Reference, SignatureInfo, SymbolInfo,
    Target, Tier, TierOutcome,
};
use crate::error::{AnalysisError, Result};
use crate::hierarchy::{
    Direction, Edge, HierarchyEngine, HierarchyItem, HierarchySource, TraversalLimits,
};
use crate::location::{Span, SymbolLocation};
use crate::workspace::{list_source_files, FilePattern};

const MAX_CALL_SITES: usize = 5;
const SEARCH_LIMIT: usize = 100;

const KEYWORDS: &[&str] = &[
    "if", "else", "for", "while", "do", "switch", "case", "return", "new", "delete", "throw",
    "sizeof", "alignof", "decltype", "catch", "goto", "co_return", "co_await", "co_yield",
    "static_assert", "using", "typedef", "operator", "defined",
];

static TYPE_DEF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:template\s*<.*>\s*)?(?P<kw>class|struct)\s+(?P<name>[A-Za-z_]\w*)\s*(?:final\s*)?(?P<bases>:[^;{]*)?(?:\{.*)?$",
    )
    .expect("valid type definition pattern")
});

static ENUM_DEF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*enum\s+(?P<scoped>class\s+|struct\s+)?(?P<name>[A-Za-z_]\w*)\s*(?::\s*[\w:\s]+)?(?:\{.*)?$",
    )
    .expect("valid enum pattern")
});

static ALIAS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*using\s+(?P<name>[A-Za-z_]\w*)\s*=").expect("valid alias pattern")
});

static TYPEDEF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*typedef\b[^;]*?\b(?P<name>[A-Za-z_]\w*)\s*;").expect("valid typedef pattern")
});

static FUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:template\s*<.*>\s*)?(?P<prefix>(?:[\w:<>,\*&]+\s+)*?)[\*&]*(?P<qual>(?:[A-Za-z_]\w*::)*)(?P<name>~?[A-Za-z_]\w*)\s*\((?P<rest>.*)$",
    )
    .expect("valid function pattern")
});

static CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?P<name>[A-Za-z_]\w*)\s*\(").expect("valid call pattern"));

/// A definition or declaration found by pattern.
#[derive(Debug, Clone, PartialEq)]
struct TextSymbol {
    name: String,
    kind: &'static str,
    container: Option<String>,
    file: PathBuf,
    /// 1-based.
    line: u32,
    column: u32,
    text: String,
    bases: Vec<String>,
    is_definition: bool,
}

impl TextSymbol {
    fn location(&self) -> SymbolLocation {
        SymbolLocation {
            file: self.file.clone(),
            line: self.line,
            column: self.column,
        }
    }

    fn span(&self) -> Span {
        Span {
            file: self.file.clone(),
            line: self.line,
            column: self.column,
            end_line: self.line,
            end_column: self.column + self.name.len() as u32,
        }
    }

    fn signature(&self) -> String {
        let text = self.text.trim();
        let text = text.split('{').next().unwrap_or(text).trim();
        text.trim_end_matches(';').trim().to_string()
    }

    fn is_type(&self) -> bool {
        matches!(self.kind, "class" | "struct")
    }

    fn is_function(&self) -> bool {
        matches!(self.kind, "function" | "method" | "constructor")
    }

    fn item(&self) -> HierarchyItem {
        HierarchyItem {
            name: self.name.clone(),
            kind: Some(self.kind.to_string()),
            detail: Some(self.signature()),
            location: self.location(),
            handle: Value::Null,
        }
    }
}

struct SourceFile {
    path: PathBuf,
    lines: Vec<String>,
}

/// Candidate files read once per request, with their pattern-detected symbols.
struct TextIndex {
    files: Vec<SourceFile>,
    symbols: Vec<TextSymbol>,
}

impl TextIndex {
    fn load(root: &Path, limit: usize, anchor: Option<&Path>) -> Result<Self> {
        let pattern = parse_pattern(None)?;
        let mut paths = list_source_files(root, &pattern, limit);
        if let Some(anchor) = anchor {
            if !paths.iter().any(|p| p == anchor) {
                paths.push(anchor.to_path_buf());
            }
        }
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            match fs::read(&path) {
                Ok(bytes) => files.push(SourceFile {
                    lines: String::from_utf8_lossy(&bytes)
                        .lines()
                        .map(str::to_string)
                        .collect(),
                    path,
                }),
                Err(err) if err.kind() == io::ErrorKind::NotFound && Some(path.as_path()) == anchor => {
                    return Err(AnalysisError::NotFound(path.display().to_string()));
                }
                Err(err) => debug!("skipping {}: {err}", path.display()),
            }
        }
        let symbols = files.iter().flat_map(scan_symbols).collect();
        Ok(Self { files, symbols })
    }

    fn file(&self, path: &Path) -> Option<&SourceFile> {
        self.files.iter().find(|f| f.path == path)
    }

    fn line(&self, path: &Path, line: u32) -> Option<&str> {
        let idx = line.checked_sub(1)? as usize;
        self.file(path)?.lines.get(idx).map(String::as_str)
    }

    fn identifier_at(&self, location: &SymbolLocation) -> Result<String> {
        let line = self
            .line(&location.file, location.line)
            .ok_or_else(|| AnalysisError::NotFound(location.to_string()))?;
        identifier_at(line, location.column)
            .ok_or_else(|| AnalysisError::NotFound(format!("no identifier at {location}")))
    }

    /// Definitions of `name`, falling back to declarations.
    fn definitions(&self, name: &str, filter: impl Fn(&TextSymbol) -> bool) -> Vec<&TextSymbol> {
        let named: Vec<&TextSymbol> = self
            .symbols
            .iter()
            .filter(|s| s.name == name && filter(s))
            .collect();
        if named.iter().any(|s| s.is_definition) {
            named.into_iter().filter(|s| s.is_definition).collect()
        } else {
            named
        }
    }

    /// Word-boundary occurrences of `name` outside comments.
    fn occurrences(&self, name: &str) -> Vec<Span> {
        let Ok(word) = Regex::new(&format!(r"\b{}\b", regex::escape(name))) else {
            return Vec::new();
        };
        let mut spans = Vec::new();
        for file in &self.files {
            for (idx, line) in file.lines.iter().enumerate() {
                for m in word.find_iter(code_part(line)) {
                    spans.push(Span {
                        file: file.path.clone(),
                        line: idx as u32 + 1,
                        column: m.start() as u32 + 1,
                        end_line: idx as u32 + 1,
                        end_column: m.end() as u32 + 1,
                    });
                }
            }
        }
        spans
    }

    /// The nearest function definition at or above `line` in `path`.
    fn enclosing_function(&self, path: &Path, line: u32) -> Option<&TextSymbol> {
        self.symbols
            .iter()
            .filter(|s| s.file == path && s.is_function() && s.is_definition && s.line <= line)
            .max_by_key(|s| s.line)
    }

    fn comments_above(&self, symbol: &TextSymbol) -> String {
        let Some(file) = self.file(&symbol.file) else {
            return String::new();
        };
        let mut docs = Vec::new();
        let mut idx = symbol.line as usize - 1;
        while idx > 0 {
            idx -= 1;
            let line = file.lines[idx].trim();
            let Some(text) = line
                .strip_prefix("///")
                .or_else(|| line.strip_prefix("//"))
                .or_else(|| line.strip_prefix('*').filter(|_| !line.starts_with("*/")))
            else {
                break;
            };
            docs.push(text.trim().to_string());
        }
        docs.reverse();
        docs.join("\n")
    }
}

fn code_part(line: &str) -> &str {
    match line.find("//") {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Identifier covering a 1-based byte column.
pub fn identifier_at(line: &str, column: u32) -> Option<String> {
    let buf = line.as_bytes();
    let offset = column.checked_sub(1)? as usize;
    if offset >= buf.len() {
        return None;
    }
    let is_ident = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let mut start = offset;
    while start > 0 && is_ident(buf[start - 1]) {
        start -= 1;
    }
    let mut end = offset;
    while end < buf.len() && is_ident(buf[end]) {
        end += 1;
    }
    if start == end || buf[start].is_ascii_digit() {
        return None;
    }
    std::str::from_utf8(&buf[start..end]).ok().map(str::to_string)
}

fn scan_symbols(file: &SourceFile) -> Vec<TextSymbol> {
    let mut symbols = Vec::new();
    for (idx, raw) in file.lines.iter().enumerate() {
        let line = code_part(raw);
        if line.trim_start().starts_with('#') {
            continue;
        }
        if let Some(symbol) = scan_line(line) {
            symbols.push(TextSymbol {
                file: file.path.clone(),
                line: idx as u32 + 1,
                text: raw.trim().to_string(),
                ..symbol
            });
        }
    }
    symbols
}

/// Pattern-match one line; file, line number and text are filled in by the caller.
fn scan_line(line: &str) -> Option<TextSymbol> {
    let found = |name: regex::Match, kind, bases, is_definition| TextSymbol {
        name: name.as_str().to_string(),
        kind,
        container: None,
        file: PathBuf::new(),
        line: 0,
        column: name.start() as u32 + 1,
        text: String::new(),
        bases,
        is_definition,
    };

    if let Some(caps) = TYPE_DEF.captures(line) {
        let kind = if &caps["kw"] == "class" { "class" } else { "struct" };
        let bases = caps
            .name("bases")
            .map(|b| parse_bases(b.as_str()))
            .unwrap_or_default();
        return Some(found(caps.name("name")?, kind, bases, true));
    }
    if let Some(caps) = ENUM_DEF.captures(line) {
        return Some(found(caps.name("name")?, "enum", Vec::new(), true));
    }
    if let Some(caps) = ALIAS.captures(line).or_else(|| TYPEDEF.captures(line)) {
        return Some(found(caps.name("name")?, "type", Vec::new(), true));
    }
    let caps = FUNCTION.captures(line)?;
    let name = caps.name("name")?;
    let prefix = caps.name("prefix").map(|p| p.as_str()).unwrap_or("");
    let qual = caps.name("qual").map(|q| q.as_str()).unwrap_or("");
    if KEYWORDS.contains(&name.as_str()) {
        return None;
    }
    let mut tokens = prefix.split_whitespace();
    if let Some(first) = tokens.clone().next() {
        if KEYWORDS.contains(&first) {
            return None;
        }
    }
    // `a << f(x)` and friends: every prefix token must look like a type word
    if tokens.any(|t| !t.chars().any(|c| c.is_ascii_alphanumeric() || c == '_')) {
        return None;
    }
    if prefix.trim().is_empty() && qual.is_empty() {
        return None;
    }
    let rest = caps.name("rest").map(|r| r.as_str().trim()).unwrap_or("");
    let is_definition = !(rest.ends_with(';') && !rest.contains('{'));
    let container = qual
        .trim_end_matches("::")
        .rsplit("::")
        .next()
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    let kind = match &container {
        Some(owner) if *owner == name.as_str() => "constructor",
        Some(_) => "method",
        None => "function",
    };
    let mut symbol = found(name, kind, Vec::new(), is_definition);
    symbol.container = container;
    Some(symbol)
}

/// `: public Base, private ns::Mixin<T>` -> ["Base", "Mixin"].
fn parse_bases(clause: &str) -> Vec<String> {
    clause
        .trim_start_matches(':')
        .split(',')
        .filter_map(|part| {
            let ty = part
                .split_whitespace()
                .find(|w| !matches!(*w, "public" | "private" | "protected" | "virtual"))?;
            let ty = ty.split('<').next().unwrap_or(ty);
            let ty = ty.rsplit("::").next().unwrap_or(ty).trim();
            (!ty.is_empty()).then(|| ty.to_string())
        })
        .collect()
}

pub struct TextualTier {
    root: PathBuf,
    max_scan_files: usize,
    references_limit: usize,
    limits: TraversalLimits,
}

impl TextualTier {
    pub fn new(
        root: impl Into<PathBuf>,
        max_scan_files: usize,
        references_limit: usize,
        limits: TraversalLimits,
    ) -> Self {
        Self {
            root: root.into(),
            max_scan_files,
            references_limit,
            limits,
        }
    }

    async fn load(&self, anchor: Option<&Path>) -> Result<Arc<TextIndex>> {
        let root = self.root.clone();
        let limit = self.max_scan_files;
        let anchor = anchor.map(Path::to_path_buf);
        tokio::task::spawn_blocking(move || TextIndex::load(&root, limit, anchor.as_deref()))
            .await
            .map_err(|err| AnalysisError::Io(io::Error::other(err)))?
            .map(Arc::new)
    }

    async fn run(&self, request: &AnalysisRequest) -> Result<TierOutcome> {
        let index = self.load(request.anchor_file()).await?;
        if let Some(direction) = request.operation.direction() {
            let location = request.require_location()?;
            let engine = HierarchyEngine::new(self.limits.with_depth(request.options.depth));
            let source = TextualHierarchy { index };
            let tree = engine.traverse(&source, location, direction).await?;
            return TierOutcome::hierarchy(tree);
        }

        match (&request.operation, &request.target) {
            (Operation::Definition, Target::Position(location)) => {
                let name = index.identifier_at(location)?;
                let spans: Vec<Span> = index
                    .definitions(&name, |_| true)
                    .iter()
                    .map(|s| s.span())
                    .collect();
                TierOutcome::list(spans)
            }
            (Operation::References, Target::Position(location)) => {
                let name = index.identifier_at(location)?;
                let declared: Vec<Span> = index
                    .symbols
                    .iter()
                    .filter(|s| s.name == name)
                    .map(|s| s.span())
                    .collect();
                let references: Vec<Reference> = index
                    .occurrences(&name)
                    .into_iter()
                    .filter(|span| request.options.include_declaration || !declared.contains(span))
                    .take(self.references_limit)
                    .map(|span| {
                        let preview = index
                            .line(&span.file, span.line)
                            .map(|l| l.trim().to_string())
                            .unwrap_or_default();
                        Reference { span, preview }
                    })
                    .collect();
                TierOutcome::list(references)
            }
            (Operation::Hover, Target::Position(location)) => {
                let name = index.identifier_at(location)?;
                let hover = index.definitions(&name, |_| true).first().map(|def| {
                    let mut range = def.span();
                    range.file = location.file.clone();
                    range.line = location.line;
                    range.end_line = location.line;
                    let line = index.line(&location.file, location.line).unwrap_or("");
                    if let Some(start) = word_start(line, location.column) {
                        range.column = start;
                        range.end_column = start + name.len() as u32;
                    }
                    HoverInfo {
                        signature: def.signature(),
                        documentation: index.comments_above(def),
                        range: Some(range),
                    }
                });
                TierOutcome::single(hover)
            }
            (Operation::Signature, Target::Position(location)) => {
                let name = index.identifier_at(location)?;
                let signature = index.definitions(&name, |_| true).first().map(|def| {
                    SignatureInfo {
                        name: match &def.container {
                            Some(owner) => format!("{owner}::{}", def.name),
                            None => def.name.clone(),
                        },
                        kind: def.kind.to_string(),
                        signature: def.signature(),
                        file: def.file.clone(),
                        line: def.line,
                        column: def.column,
                    }
                });
                TierOutcome::single(signature)
            }
            (Operation::Outline, Target::File(file)) => {
                if index.file(file).is_none() {
                    return Err(AnalysisError::NotFound(file.display().to_string()));
                }
                let symbols: Vec<SymbolInfo> = index
                    .symbols
                    .iter()
                    .filter(|s| &s.file == file)
                    .map(to_info)
                    .collect();
                TierOutcome::list(symbols)
            }
            (
                Operation::SearchSymbols,
                Target::Search {
                    query,
                    file_pattern,
                },
            ) => {
                let pattern: FilePattern = parse_pattern(file_pattern.as_deref())?;
                let needle = query.trim().to_lowercase();
                if needle.is_empty() {
                    return Err(AnalysisError::InvalidRequest("empty search query".into()));
                }
                let found: Vec<SymbolInfo> = index
                    .symbols
                    .iter()
                    .filter(|s| s.name.to_lowercase().contains(&needle))
                    .filter(|s| pattern.matches(&self.root, &s.file))
                    .take(SEARCH_LIMIT)
                    .map(to_info)
                    .collect();
                TierOutcome::list(found)
            }
            (Operation::PrepareTypeHierarchy, Target::Position(location)) => {
                let name = index.identifier_at(location)?;
                let items: Vec<HierarchyItem> = index
                    .definitions(&name, TextSymbol::is_type)
                    .iter()
                    .map(|s| s.item())
                    .collect();
                TierOutcome::list(items)
            }
            _ => Ok(TierOutcome::Unsupported),
        }
    }
}

fn word_start(line: &str, column: u32) -> Option<u32> {
    let buf = line.as_bytes();
    let mut start = column.checked_sub(1)? as usize;
    if start >= buf.len() {
        return None;
    }
    while start > 0 && (buf[start - 1].is_ascii_alphanumeric() || buf[start - 1] == b'_') {
        start -= 1;
    }
    Some(start as u32 + 1)
}

fn to_info(symbol: &TextSymbol) -> SymbolInfo {
    SymbolInfo {
        name: symbol.name.clone(),
        kind: symbol.kind.to_string(),
        container: symbol.container.clone(),
        file: symbol.file.clone(),
        line: symbol.line,
        column: symbol.column,
        end_line: symbol.line,
        end_column: symbol.column + symbol.name.len() as u32,
    }
}

#[async_trait]
impl AnalysisTier for TextualTier {
    fn tier(&self) -> Tier {
        Tier::Textual
    }

    fn supports(&self, operation: Operation) -> bool {
        operation != Operation::ListFiles
    }

    async fn execute(&self, request: &AnalysisRequest) -> TierOutcome {
        if !self.supports(request.operation) {
            return TierOutcome::Unsupported;
        }
        TierOutcome::from_result(self.run(request).await)
    }
}

/// Call and type graph edges recovered from patterns.
struct TextualHierarchy {
    index: Arc<TextIndex>,
}

impl TextualHierarchy {
    fn callers(&self, item: &HierarchyItem) -> Vec<Edge> {
        let mut by_caller: BTreeMap<(PathBuf, u32), (HierarchyItem, Vec<SymbolLocation>)> =
            BTreeMap::new();
        for span in self.index.occurrences(&item.name) {
            let Some(line) = self.index.line(&span.file, span.line) else {
                continue;
            };
            // a call, not a mention
            let after = &code_part(line)[(span.end_column - 1) as usize..];
            if !after.trim_start().starts_with('(') {
                continue;
            }
            // skip the definition itself
            if span.file == item.location.file && span.line == item.location.line {
                continue;
            }
            let Some(caller) = self.index.enclosing_function(&span.file, span.line) else {
                continue;
            };
            let entry = by_caller
                .entry((caller.file.clone(), caller.line))
                .or_insert_with(|| (caller.item(), Vec::new()));
            if entry.1.len() < MAX_CALL_SITES {
                entry.1.push(SymbolLocation {
                    file: span.file.clone(),
                    line: span.line,
                    column: span.column,
                });
            }
        }
        by_caller
            .into_values()
            .map(|(target, sites)| Edge { target, sites })
            .collect()
    }

    fn callees(&self, item: &HierarchyItem) -> Vec<Edge> {
        let Some(file) = self.index.file(&item.location.file) else {
            return Vec::new();
        };
        let mut by_callee: BTreeMap<(PathBuf, u32), (HierarchyItem, Vec<SymbolLocation>)> =
            BTreeMap::new();
        let mut depth = 0i32;
        let mut opened = false;
        for (idx, raw) in file.lines.iter().enumerate().skip(item.location.line as usize - 1) {
            let line = code_part(raw);
            let body_start = if idx + 1 == item.location.line as usize {
                // calls start after the function's own name and parameter list
                match line.find('{') {
                    Some(brace) => brace,
                    None => line.len(),
                }
            } else {
                0
            };
            for caps in CALL.captures_iter(&line[body_start..]) {
                let Some(name) = caps.name("name") else { continue };
                if KEYWORDS.contains(&name.as_str()) {
                    continue;
                }
                let Some(def) = self
                    .index
                    .definitions(name.as_str(), TextSymbol::is_function)
                    .first()
                    .copied()
                else {
                    continue;
                };
                let entry = by_callee
                    .entry((def.file.clone(), def.line))
                    .or_insert_with(|| (def.item(), Vec::new()));
                if entry.1.len() < MAX_CALL_SITES {
                    entry.1.push(SymbolLocation {
                        file: file.path.clone(),
                        line: idx as u32 + 1,
                        column: (body_start + name.start()) as u32 + 1,
                    });
                }
            }
            for ch in line.chars() {
                match ch {
                    '{' => {
                        depth += 1;
                        opened = true;
                    }
                    '}' => depth -= 1,
                    _ => {}
                }
            }
            if opened && depth <= 0 {
                break;
            }
            // declaration without a body
            if !opened && line.trim_end().ends_with(';') {
                break;
            }
        }
        by_callee
            .into_values()
            .map(|(target, sites)| Edge { target, sites })
            .collect()
    }

    fn type_edges(&self, item: &HierarchyItem, direction: Direction) -> Vec<Edge> {
        let types = self.index.symbols.iter().filter(|s| s.is_type() && s.is_definition);
        let targets: Vec<&TextSymbol> = match direction {
            Direction::Supertypes => {
                let bases: Vec<String> = self
                    .index
                    .symbols
                    .iter()
                    .find(|s| s.is_type() && s.location() == item.location)
                    .map(|s| s.bases.clone())
                    .unwrap_or_default();
                types.filter(|s| bases.contains(&s.name)).collect()
            }
            _ => types.filter(|s| s.bases.contains(&item.name)).collect(),
        };
        targets
            .into_iter()
            .map(|s| Edge {
                target: s.item(),
                sites: Vec::new(),
            })
            .collect()
    }
}

#[async_trait]
impl HierarchySource for TextualHierarchy {
    async fn prepare(
        &self,
        location: &SymbolLocation,
        direction: Direction,
    ) -> Result<Vec<HierarchyItem>> {
        let name = self.index.identifier_at(location)?;
        let wanted: fn(&TextSymbol) -> bool = if direction.is_call() {
            TextSymbol::is_function
        } else {
            TextSymbol::is_type
        };
        Ok(self
            .index
            .definitions(&name, wanted)
            .iter()
            .map(|s| s.item())
            .collect())
    }

    async fn expand(&self, item: &HierarchyItem, direction: Direction) -> Result<Vec<Edge>> {
        Ok(match direction {
            Direction::Incoming => self.callers(item),
            Direction::Outgoing => self.callees(item),
            Direction::Supertypes | Direction::Subtypes => self.type_edges(item, direction),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiers::QueryOptions;
    use tempfile::tempdir;

    const SHAPES: &str = "\
#pragma once

/// Anything with an area.
class Shape {
public:
    virtual double area() const = 0;
};

class Circle : public Shape {
public:
    double area() const override;
};

int factorial(int n);
";

    const MAIN: &str = "\
#include \"shapes.h\"

int factorial(int n) {
    if (n <= 1) return 1;
    return n * factorial(n - 1);
}

int main() {
    int x = factorial(5);
    std::cout << factorial(x) << std::endl;
    return 0;
}
";

    fn project() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("shapes.h"), SHAPES).unwrap();
        fs::write(dir.path().join("main.cpp"), MAIN).unwrap();
        dir
    }

    fn tier(root: &Path) -> TextualTier {
        TextualTier::new(root, 500, 150, TraversalLimits::default())
    }

    #[test]
    fn line_patterns() {
        let class = scan_line("class Circle : public Shape, private ns::Mixin<int> {").unwrap();
        assert_eq!(class.kind, "class");
        assert_eq!(class.bases, vec!["Shape", "Mixin"]);
        assert!(scan_line("class Forward;").is_none());

        let def = scan_line("std::string Hello::greet() const {").unwrap();
        assert_eq!((def.name.as_str(), def.kind), ("greet", "method"));
        assert_eq!(def.container.as_deref(), Some("Hello"));
        assert!(def.is_definition);

        let decl = scan_line("int add_numbers(int a, int b);").unwrap();
        assert!(!decl.is_definition);
        assert_eq!(decl.column, 5);

        assert!(scan_line("    return add_numbers(1, 2);").is_none());
        assert!(scan_line("    std::cout << add_numbers(1, 2);").is_none());
        assert!(scan_line("    add_numbers(1, 2);").is_none());
        assert!(scan_line("    if (ready) {").is_none());
        assert_eq!(scan_line("using Scalar = double;").unwrap().kind, "type");
        assert_eq!(scan_line("enum class Color { Red };").unwrap().kind, "enum");
    }

    #[test]
    fn identifier_under_cursor() {
        assert_eq!(identifier_at("int x = factorial(5);", 12).as_deref(), Some("factorial"));
        assert_eq!(identifier_at("int x = factorial(5);", 9).as_deref(), Some("factorial"));
        assert_eq!(identifier_at("int x = factorial(5);", 8), None);
        assert_eq!(identifier_at("f(42)", 3), None);
        assert_eq!(identifier_at("", 1), None);
    }

    #[tokio::test]
    async fn definition_prefers_bodies_over_declarations() {
        let dir = project();
        let main = dir.path().join("main.cpp");
        let at_call = SymbolLocation::new(&main, 9, 13).unwrap();
        let TierOutcome::Found(found) = tier(dir.path())
            .execute(&AnalysisRequest::at(Operation::Definition, at_call))
            .await
        else {
            panic!("expected a definition");
        };
        assert_eq!(found.as_array().unwrap().len(), 1);
        assert_eq!(found[0]["line"], 3);
        assert_eq!(found[0]["column"], 5);
    }

    #[tokio::test]
    async fn references_can_skip_declarations() {
        let dir = project();
        let main = dir.path().join("main.cpp");
        let at_call = SymbolLocation::new(&main, 9, 13).unwrap();
        let request = AnalysisRequest::at(Operation::References, at_call);

        let TierOutcome::Found(all) = tier(dir.path())
            .execute(&request.clone().with_options(QueryOptions {
                include_declaration: true,
                ..QueryOptions::default()
            }))
            .await
        else {
            panic!("expected references");
        };
        // header declaration, definition, recursive call, two calls in main
        assert_eq!(all.as_array().unwrap().len(), 5);

        let TierOutcome::Found(uses) = tier(dir.path()).execute(&request).await else {
            panic!("expected references");
        };
        assert_eq!(uses.as_array().unwrap().len(), 3);
        assert_eq!(uses[0]["preview"], "return n * factorial(n - 1);");
    }

    #[tokio::test]
    async fn hover_reads_doc_comments() {
        let dir = project();
        let header = dir.path().join("shapes.h");
        let at_shape = SymbolLocation::new(&header, 9, 24).unwrap();
        let TierOutcome::Found(hover) = tier(dir.path())
            .execute(&AnalysisRequest::at(Operation::Hover, at_shape))
            .await
        else {
            panic!("expected hover");
        };
        assert_eq!(hover["signature"], "class Shape");
        assert_eq!(hover["documentation"], "Anything with an area.");
        assert_eq!(hover["range"]["column"], 23);
    }

    #[tokio::test]
    async fn recursive_callers_terminate() {
        let dir = project();
        let main = dir.path().join("main.cpp");
        let at_def = SymbolLocation::new(&main, 3, 5).unwrap();
        let TierOutcome::Found(tree) = tier(dir.path())
            .execute(&AnalysisRequest::at(Operation::IncomingCalls, at_def))
            .await
        else {
            panic!("expected a tree");
        };
        let nodes = tree["nodes"].as_array().unwrap();
        let names: Vec<&str> = nodes.iter().map(|n| n["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["factorial", "factorial", "main"]);
        assert_eq!(nodes[1]["already_visited"], true);
        assert_eq!(nodes[2]["call_sites"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn outgoing_calls_and_type_hierarchy() {
        let dir = project();
        let main = dir.path().join("main.cpp");
        let header = dir.path().join("shapes.h");
        let t = tier(dir.path());

        let at_main = SymbolLocation::new(&main, 8, 5).unwrap();
        let TierOutcome::Found(out) = t
            .execute(&AnalysisRequest::at(Operation::OutgoingCalls, at_main))
            .await
        else {
            panic!("expected callees");
        };
        assert_eq!(out["nodes"][1]["name"], "factorial");

        let at_circle = SymbolLocation::new(&header, 9, 8).unwrap();
        let TierOutcome::Found(up) = t
            .execute(&AnalysisRequest::at(Operation::Supertypes, at_circle))
            .await
        else {
            panic!("expected supertypes");
        };
        let up: HierarchyTreeView = serde_json::from_value(up).unwrap();
        assert_eq!(up.names(), vec!["Circle", "Shape"]);

        let at_shape = SymbolLocation::new(&header, 4, 8).unwrap();
        let TierOutcome::Found(down) = t
            .execute(&AnalysisRequest::at(Operation::Subtypes, at_shape))
            .await
        else {
            panic!("expected subtypes");
        };
        let down: HierarchyTreeView = serde_json::from_value(down).unwrap();
        assert_eq!(down.names(), vec!["Shape", "Circle"]);
    }

    #[derive(serde::Deserialize)]
    struct HierarchyTreeView {
        nodes: Vec<NodeView>,
    }

    #[derive(serde::Deserialize)]
    struct NodeView {
        name: String,
    }

    impl HierarchyTreeView {
        fn names(&self) -> Vec<&str> {
            self.nodes.iter().map(|n| n.name.as_str()).collect()
        }
    }

    #[tokio::test]
    async fn list_files_is_left_to_other_tiers() {
        let dir = project();
        assert!(matches!(
            tier(dir.path()).execute(&AnalysisRequest::list_files(None)).await,
            TierOutcome::Unsupported
        ));
    }
}
