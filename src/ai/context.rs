//! Source text handed to a summary provider next to the routed answer.
//!
//! How much is gathered follows [`ContextDepth`]: `minimal` sends the anchor
//! line, `local` adds the code around it with the enclosing class and
//! function, `full` adds the file's includes and excerpts of the project
//! headers they name.

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::ContextDepth;
use crate::languages::cpp::{self, CppSymbol};

/// Lines kept on each side of the anchor.
const SURROUNDING_LINES: usize = 25;
const MAX_INCLUDES: usize = 20;
const MAX_RELATED_HEADERS: usize = 5;
/// Bytes kept from each related header.
const HEADER_EXCERPT: usize = 5000;
const INCLUDE_DIRS: [&str; 4] = ["include", "src", "inc", "headers"];

static INCLUDE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*#\s*include\s*[<"](?P<name>[^>"]+)[>"]"#).expect("valid include pattern")
});

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceContext {
    pub depth: ContextDepth,
    /// The anchor line, trimmed.
    pub line_text: Option<String>,
    pub surrounding: Option<String>,
    /// e.g. `class Hello`
    pub enclosing_type: Option<String>,
    pub enclosing_signature: Option<String>,
    pub includes: Vec<String>,
    pub related_headers: Vec<RelatedHeader>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedHeader {
    pub path: PathBuf,
    pub excerpt: String,
}

pub struct ContextBuilder {
    root: PathBuf,
}

impl ContextBuilder {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Gather context for `file`. `line` is 1-based and absent for
    /// file-level requests such as outlines.
    pub async fn build(&self, file: &Path, line: Option<u32>, depth: ContextDepth) -> SourceContext {
        let mut context = SourceContext {
            depth,
            ..SourceContext::default()
        };
        let source = match tokio::fs::read(file).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) => {
                debug!("no summary context for {}: {err}", file.display());
                return context;
            }
        };
        let lines: Vec<&str> = source.lines().collect();
        let anchor = line
            .and_then(|line| usize::try_from(line).ok())
            .and_then(|line| line.checked_sub(1))
            .filter(|index| *index < lines.len());

        context.line_text = anchor.map(|index| lines[index].trim().to_string());
        if depth == ContextDepth::Minimal {
            return context;
        }

        let (start, end) = match anchor {
            Some(index) => (
                index.saturating_sub(SURROUNDING_LINES),
                (index + SURROUNDING_LINES + 1).min(lines.len()),
            ),
            None => (0, lines.len().min(2 * SURROUNDING_LINES)),
        };
        context.surrounding = Some(lines[start..end].join("\n"));

        if let Some(line) = line.filter(|_| anchor.is_some()) {
            match cpp::parse_symbols(&source) {
                Ok(symbols) => {
                    context.enclosing_signature = innermost(&symbols, line, |s| {
                        s.signature.is_some()
                    })
                    .and_then(|s| s.signature.clone());
                    context.enclosing_type =
                        innermost(&symbols, line, |s| matches!(s.kind, "class" | "struct"))
                            .map(|s| format!("{} {}", s.kind, s.qualified_name()));
                }
                Err(err) => debug!("could not parse {}: {err:#}", file.display()),
            }
        }

        if depth == ContextDepth::Full {
            context.includes = lines
                .iter()
                .filter(|line| INCLUDE.is_match(line))
                .take(MAX_INCLUDES)
                .map(|line| line.trim().to_string())
                .collect();
            for include in context.includes.iter().take(MAX_RELATED_HEADERS) {
                let Some(path) = self.resolve_include(file, include) else {
                    continue;
                };
                match tokio::fs::read(&path).await {
                    Ok(bytes) => context.related_headers.push(RelatedHeader {
                        excerpt: excerpt(&String::from_utf8_lossy(&bytes), HEADER_EXCERPT),
                        path,
                    }),
                    Err(err) => debug!("skipping header {}: {err}", path.display()),
                }
            }
        }
        context
    }

    /// Project file named by an `#include` line: next to the including file,
    /// under the root, then under the usual include directories.
    fn resolve_include(&self, file: &Path, include: &str) -> Option<PathBuf> {
        let name = INCLUDE.captures(include)?.name("name")?.as_str();
        let beside = file.parent().map(|dir| dir.join(name));
        beside
            .into_iter()
            .chain(std::iter::once(self.root.join(name)))
            .chain(INCLUDE_DIRS.iter().map(|dir| self.root.join(dir).join(name)))
            .find(|candidate| candidate.is_file())
    }
}

fn innermost<'a>(
    symbols: &'a [CppSymbol],
    line: u32,
    keep: impl Fn(&CppSymbol) -> bool,
) -> Option<&'a CppSymbol> {
    symbols
        .iter()
        .filter(|s| keep(*s) && s.start_line <= line && line <= s.last_line)
        .min_by_key(|s| s.last_line - s.start_line)
}

fn excerpt(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
