//! Symbol locations and the translation to engine positions.
//!
//! The operation surface is 1-based for both line and column; columns count
//! UTF-8 bytes, which is what tree-sitter and the regex scanner report. The
//! engine speaks 0-based positions, and the client negotiates the utf-8
//! position encoding so only the off-by-one shift happens at the boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{AnalysisError, Result};
use crate::workspace::normalize_path;

/// Zero-based engine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// One-based location in a source file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymbolLocation {
    pub file: PathBuf,
    pub line: u32,
    pub column: u32,
}

impl SymbolLocation {
    pub fn new(file: impl Into<PathBuf>, line: u32, column: u32) -> Result<Self> {
        if line == 0 || column == 0 {
            return Err(AnalysisError::InvalidRequest(format!(
                "line and column are 1-based, got {line}:{column}"
            )));
        }
        Ok(Self {
            file: file.into(),
            line,
            column,
        })
    }

    pub fn to_position(&self) -> Position {
        Position {
            line: self.line - 1,
            character: self.column - 1,
        }
    }

    pub fn from_position(file: impl Into<PathBuf>, position: Position) -> Self {
        Self {
            file: file.into(),
            line: position.line + 1,
            column: position.character + 1,
        }
    }

    /// Location from an engine `uri` + `position` pair.
    pub fn from_engine(uri: &str, position: Position) -> Option<Self> {
        Some(Self::from_position(uri_to_path(uri)?, position))
    }

    pub fn uri(&self) -> String {
        path_to_uri(&self.file)
    }
}

impl fmt::Display for SymbolLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file.display(), self.line, self.column)
    }
}

/// A located span on the exposed surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub file: PathBuf,
    pub line: u32,
    pub column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl Span {
    pub fn from_engine(uri: &str, range: Range) -> Option<Self> {
        Some(Self {
            file: uri_to_path(uri)?,
            line: range.start.line + 1,
            column: range.start.character + 1,
            end_line: range.end.line + 1,
            end_column: range.end.character + 1,
        })
    }

    pub fn start(&self) -> SymbolLocation {
        SymbolLocation {
            file: self.file.clone(),
            line: self.line,
            column: self.column,
        }
    }
}

const URI_RESERVED: &[u8] = b" %#?[]";

/// `file://` URI for an absolute path, percent-encoding the few characters
/// that would otherwise change its meaning.
pub fn path_to_uri(path: &Path) -> String {
    let normalized = normalize_path(path);
    let mut uri = String::with_capacity(normalized.len() + 8);
    uri.push_str("file://");
    if !normalized.starts_with('/') {
        uri.push('/');
    }
    for byte in normalized.bytes() {
        if URI_RESERVED.contains(&byte) || byte < 0x20 {
            uri.push_str(&format!("%{byte:02X}"));
        } else {
            uri.push(byte as char);
        }
    }
    uri
}

pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    let raw = uri.strip_prefix("file://")?;
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok()?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    let path = String::from_utf8(decoded).ok()?;
    // file:///C:/x on Windows
    let path = match path.as_bytes() {
        [b'/', drive, b':', ..] if drive.is_ascii_alphabetic() => path[1..].to_string(),
        _ => path,
    };
    Some(PathBuf::from(path))
}
