//! Engine wire payloads: request parameter builders and result decoders.

use serde_json::{json, Value};
use std::path::Path;

use crate::error::{AnalysisError, Result};
use crate::hierarchy::{Direction, Edge, HierarchyItem};
use crate::location::{path_to_uri, uri_to_path, Position, Range, Span, SymbolLocation};
use crate::tiers::{HoverInfo, SymbolInfo};

/// Call sites kept per hierarchy edge.
const MAX_CALL_SITES: usize = 5;

// ==================== Incoming messages ====================

#[derive(Debug)]
pub enum Incoming {
    Response {
        id: u64,
        outcome: Result<Value>,
    },
    Notification {
        method: String,
        params: Value,
    },
    /// Engine-initiated request; must be answered.
    Request {
        id: Value,
        method: String,
    },
}

impl Incoming {
    pub fn classify(mut message: Value) -> Option<Self> {
        let method = message
            .get("method")
            .and_then(|m| m.as_str())
            .map(str::to_string);
        let id = message.get_mut("id").map(Value::take);

        match (method, id) {
            (Some(method), Some(id)) if !id.is_null() => Some(Incoming::Request { id, method }),
            (Some(method), _) => Some(Incoming::Notification {
                method,
                params: message.get_mut("params").map(Value::take).unwrap_or(Value::Null),
            }),
            (None, Some(id)) => {
                let id = id
                    .as_u64()
                    .or_else(|| id.as_str().and_then(|s| s.parse().ok()))?;
                let outcome = match message.get("error") {
                    Some(err) if !err.is_null() => Err(AnalysisError::Rpc {
                        code: err.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
                        message: err
                            .get("message")
                            .and_then(|m| m.as_str())
                            .unwrap_or("unknown error")
                            .to_string(),
                    }),
                    _ => Ok(message
                        .get_mut("result")
                        .map(Value::take)
                        .unwrap_or(Value::Null)),
                };
                Some(Incoming::Response { id, outcome })
            }
            (None, None) => None,
        }
    }
}

// ==================== Request builders ====================

pub fn initialize_params(root: &Path) -> Value {
    let root_uri = path_to_uri(root);
    json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "rootPath": root.to_string_lossy(),
        "workspaceFolders": [{
            "uri": root_uri,
            "name": root.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
        }],
        "capabilities": {
            "general": { "positionEncodings": ["utf-8", "utf-16"] },
            "textDocument": {
                "synchronization": { "dynamicRegistration": false, "didSave": true },
                "definition": { "linkSupport": true },
                "references": {},
                "hover": { "contentFormat": ["markdown", "plaintext"] },
                "documentSymbol": { "hierarchicalDocumentSymbolSupport": true },
                "callHierarchy": { "dynamicRegistration": false },
                "typeHierarchy": { "dynamicRegistration": false },
                "publishDiagnostics": { "relatedInformation": false },
            },
            "window": { "workDoneProgress": true },
            "workspace": { "symbol": {} },
        },
        "offsetEncoding": ["utf-8", "utf-16"],
        "initializationOptions": { "clangdFileStatus": true },
    })
}

/// Encoding picked by the engine, `utf-16` when it says nothing.
pub fn negotiated_encoding(init_result: &Value) -> String {
    init_result
        .pointer("/capabilities/positionEncoding")
        .or_else(|| init_result.get("offsetEncoding"))
        .and_then(|v| v.as_str())
        .unwrap_or("utf-16")
        .to_string()
}

pub fn text_document_position(location: &SymbolLocation) -> Value {
    json!({
        "textDocument": { "uri": location.uri() },
        "position": location.to_position(),
    })
}

pub fn did_open(path: &Path, language_id: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": path_to_uri(path),
            "languageId": language_id,
            "version": version,
            "text": text,
        }
    })
}

pub fn did_change(path: &Path, version: i32, text: &str) -> Value {
    json!({
        "textDocument": { "uri": path_to_uri(path), "version": version },
        "contentChanges": [{ "text": text }],
    })
}

pub fn did_close(path: &Path) -> Value {
    json!({ "textDocument": { "uri": path_to_uri(path) } })
}

// ==================== Result decoders ====================

fn range_of(value: &Value) -> Option<Range> {
    serde_json::from_value(value.clone()).ok()
}

fn span_of(uri: &Value, range: &Value) -> Option<Span> {
    Span::from_engine(uri.as_str()?, range_of(range)?)
}

/// Decode `Location | Location[] | LocationLink[] | null`.
pub fn parse_locations(result: &Value) -> Vec<Span> {
    let items: Vec<&Value> = match result {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![result],
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|item| {
            if let Some(uri) = item.get("targetUri") {
                let range = item
                    .get("targetSelectionRange")
                    .or_else(|| item.get("targetRange"))?;
                span_of(uri, range)
            } else {
                span_of(item.get("uri")?, item.get("range")?)
            }
        })
        .collect()
}

/// Decode hover contents: MarkupContent, MarkedString or an array of either.
pub fn parse_hover(result: &Value, file: &Path) -> Option<HoverInfo> {
    let contents = result.get("contents")?;
    let text = match contents {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.as_str().or_else(|| p.get("value").and_then(|v| v.as_str())))
            .collect::<Vec<_>>()
            .join("\n\n"),
        Value::Object(_) => contents.get("value")?.as_str()?.to_string(),
        _ => return None,
    };
    if text.trim().is_empty() {
        return None;
    }
    let range = result.get("range").and_then(range_of).map(|r| Span {
        file: file.to_path_buf(),
        line: r.start.line + 1,
        column: r.start.character + 1,
        end_line: r.end.line + 1,
        end_column: r.end.character + 1,
    });
    Some(HoverInfo {
        signature: signature_from_markdown(&text),
        documentation: text,
        range,
    })
}

/// First code line of a markdown hover, skipping fences, headings and `// In file` notes.
pub fn signature_from_markdown(markdown: &str) -> String {
    let mut in_code = false;
    let mut first_plain = None;
    for line in markdown.lines() {
        let line = line.trim();
        if line.starts_with("```") {
            in_code = !in_code;
            continue;
        }
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        if in_code {
            return line.to_string();
        }
        if first_plain.is_none() && !line.starts_with('#') && !line.starts_with("---") {
            first_plain = Some(line.to_string());
        }
    }
    first_plain.unwrap_or_default()
}

pub fn symbol_kind_name(kind: u64) -> &'static str {
    match kind {
        1 => "file",
        2 => "module",
        3 => "namespace",
        4 => "package",
        5 => "class",
        6 => "method",
        7 => "property",
        8 => "field",
        9 => "constructor",
        10 => "enum",
        11 => "interface",
        12 => "function",
        13 => "variable",
        14 => "constant",
        15 => "string",
        16 => "number",
        17 => "boolean",
        18 => "array",
        19 => "object",
        20 => "key",
        21 => "null",
        22 => "enum_member",
        23 => "struct",
        24 => "event",
        25 => "operator",
        26 => "type_parameter",
        _ => "unknown",
    }
}

fn kind_of(value: &Value) -> String {
    symbol_kind_name(value.get("kind").and_then(|k| k.as_u64()).unwrap_or(0)).to_string()
}

/// Flatten `DocumentSymbol[]` (hierarchical) or `SymbolInformation[]` for one file.
pub fn parse_document_symbols(result: &Value, file: &Path) -> Vec<SymbolInfo> {
    let Some(items) = result.as_array() else {
        return Vec::new();
    };
    let mut symbols = Vec::new();
    let mut stack: Vec<(&Value, Option<String>)> =
        items.iter().rev().map(|item| (item, None)).collect();

    while let Some((item, container)) = stack.pop() {
        let Some(name) = item.get("name").and_then(|n| n.as_str()) else {
            continue;
        };
        let range = item
            .get("selectionRange")
            .or_else(|| item.get("range"))
            .or_else(|| item.pointer("/location/range"))
            .and_then(range_of);
        let Some(range) = range else { continue };
        let container = container.or_else(|| {
            item.get("containerName")
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .map(str::to_string)
        });
        symbols.push(SymbolInfo::new(name, kind_of(item), container.clone(), file, range));

        if let Some(children) = item.get("children").and_then(|c| c.as_array()) {
            for child in children.iter().rev() {
                stack.push((child, Some(name.to_string())));
            }
        }
    }
    symbols
}

pub fn parse_workspace_symbols(result: &Value) -> Vec<SymbolInfo> {
    let Some(items) = result.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let name = item.get("name")?.as_str()?;
            let location = item.get("location")?;
            let file = uri_to_path(location.get("uri")?.as_str()?)?;
            let range = location.get("range").and_then(range_of).unwrap_or(Range {
                start: Position { line: 0, character: 0 },
                end: Position { line: 0, character: 0 },
            });
            let container = item
                .get("containerName")
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            Some(SymbolInfo::new(name, kind_of(item), container, &file, range))
        })
        .collect()
}

// ==================== Hierarchy items ====================

/// Decode a `CallHierarchyItem` or `TypeHierarchyItem`, keeping the raw item
/// so it can be sent back for expansion.
pub fn hierarchy_item(value: &Value) -> Option<HierarchyItem> {
    let name = value.get("name")?.as_str()?.to_string();
    let uri = value.get("uri")?.as_str()?;
    let range = value
        .get("selectionRange")
        .or_else(|| value.get("range"))
        .and_then(range_of)?;
    Some(HierarchyItem {
        name,
        kind: Some(kind_of(value)),
        detail: value
            .get("detail")
            .and_then(|d| d.as_str())
            .map(str::to_string),
        location: SymbolLocation::from_engine(uri, range.start)?,
        handle: value.clone(),
    })
}

pub fn hierarchy_items(result: &Value) -> Vec<HierarchyItem> {
    result
        .as_array()
        .map(|items| items.iter().filter_map(hierarchy_item).collect())
        .unwrap_or_default()
}

/// Decode the edges returned for one expansion of `parent`.
pub fn hierarchy_edges(result: &Value, parent: &HierarchyItem, direction: Direction) -> Vec<Edge> {
    let Some(items) = result.as_array() else {
        return Vec::new();
    };
    match direction {
        Direction::Supertypes | Direction::Subtypes => items
            .iter()
            .filter_map(hierarchy_item)
            .map(|target| Edge {
                target,
                sites: Vec::new(),
            })
            .collect(),
        Direction::Incoming | Direction::Outgoing => items
            .iter()
            .filter_map(|call| {
                let key = if direction == Direction::Incoming { "from" } else { "to" };
                let target = hierarchy_item(call.get(key)?)?;
                // fromRanges live in the caller's file
                let site_file = if direction == Direction::Incoming {
                    target.location.file.clone()
                } else {
                    parent.location.file.clone()
                };
                let sites = call
                    .get("fromRanges")
                    .and_then(|r| r.as_array())
                    .map(|ranges| {
                        ranges
                            .iter()
                            .filter_map(range_of)
                            .take(MAX_CALL_SITES)
                            .map(|r| SymbolLocation::from_position(site_file.clone(), r.start))
                            .collect()
                    })
                    .unwrap_or_default();
                Some(Edge { target, sites })
            })
            .collect(),
    }
}
