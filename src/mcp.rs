//! MCP (Model Context Protocol) server.
//!
//! Exposes the service operations as tools over newline-delimited JSON-RPC
//! 2.0 on stdio. Each tool call runs on its own task and all responses go
//! through a single writer, so a slow hierarchy query never holds up a hover.

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::AnalysisError;
use crate::location::SymbolLocation;
use crate::service::ServiceContext;

/// MCP Protocol version
const PROTOCOL_VERSION: &str = "2024-11-05";

const SERVER_NAME: &str = "clangaroo";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

// ==================== JSON-RPC Types ====================

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

// JSON-RPC error codes
const PARSE_ERROR: i32 = -32700;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;

// ==================== MCP Types ====================

#[derive(Debug, Serialize)]
struct Tool {
    name: &'static str,
    description: &'static str,
    #[serde(rename = "inputSchema")]
    input_schema: Value,
}

#[derive(Debug, Serialize)]
struct ToolResult {
    content: Vec<ToolContent>,
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    is_error: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ToolContent {
    #[serde(rename = "type")]
    content_type: &'static str,
    text: String,
}

impl ToolResult {
    fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                content_type: "text",
                text: text.into(),
            }],
            is_error: None,
        }
    }

    fn error(err: &AnalysisError) -> Self {
        let body = json!({ "error": err.kind(), "message": err.to_string() });
        Self {
            is_error: Some(true),
            ..Self::text(body.to_string())
        }
    }
}

fn position_schema(extra: Value) -> Value {
    let mut properties = json!({
        "file": {
            "type": "string",
            "description": "Source file, absolute or relative to the project root"
        },
        "line": { "type": "integer", "description": "1-based line number" },
        "column": { "type": "integer", "description": "1-based column (UTF-8 bytes)" }
    });
    if let (Value::Object(props), Value::Object(extra)) = (&mut properties, extra) {
        props.extend(extra);
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": ["file", "line", "column"]
    })
}

fn depth_property() -> Value {
    json!({
        "depth": {
            "type": "integer",
            "description": "Levels to expand (1-10, default 3)"
        }
    })
}

fn tools() -> Vec<Tool> {
    let with_summary = |mut base: Value| {
        if let Value::Object(map) = &mut base {
            map.insert(
                "summarize".to_string(),
                json!({
                    "type": "boolean",
                    "description": "Attach an AI summary when enrichment is configured"
                }),
            );
        }
        base
    };
    vec![
        Tool {
            name: "cpp_definition",
            description: "Go to the definition of the C/C++ symbol at a position.",
            input_schema: position_schema(json!({})),
        },
        Tool {
            name: "cpp_references",
            description: "Find every reference to the symbol at a position, with a one-line preview each.",
            input_schema: position_schema(json!({
                "include_declaration": {
                    "type": "boolean",
                    "description": "Include the declaration itself (default true)"
                }
            })),
        },
        Tool {
            name: "cpp_hover",
            description: "Type, signature and documentation of the symbol at a position.",
            input_schema: position_schema(with_summary(json!({}))),
        },
        Tool {
            name: "cpp_incoming_calls",
            description: "Call hierarchy: who calls the function at a position, expanded level by level.",
            input_schema: position_schema(with_summary(depth_property())),
        },
        Tool {
            name: "cpp_outgoing_calls",
            description: "Call hierarchy: what the function at a position calls, expanded level by level.",
            input_schema: position_schema(with_summary(depth_property())),
        },
        Tool {
            name: "cpp_type_hierarchy",
            description: "Resolve the class or struct at a position for type hierarchy queries.",
            input_schema: position_schema(json!({})),
        },
        Tool {
            name: "cpp_supertypes",
            description: "Base classes of the type at a position.",
            input_schema: position_schema(depth_property()),
        },
        Tool {
            name: "cpp_subtypes",
            description: "Derived classes of the type at a position.",
            input_schema: position_schema(depth_property()),
        },
        Tool {
            name: "cpp_signature",
            description: "Declaration signature of the function or type at a position.",
            input_schema: position_schema(json!({})),
        },
        Tool {
            name: "cpp_outline",
            description: "Symbols declared in one file, in source order.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "file": { "type": "string", "description": "Source file to outline" }
                },
                "required": ["file"]
            }),
        },
        Tool {
            name: "cpp_search_symbols",
            description: "Search project symbols by name (case-insensitive substring).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Name or part of a name" },
                    "file_pattern": { "type": "string", "description": "Glob restricting the files searched" }
                },
                "required": ["query"]
            }),
        },
        Tool {
            name: "cpp_list_files",
            description: "List C and C++ source files in the project.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string", "description": "Glob such as src/**/*.cpp or *.h" }
                }
            }),
        },
        Tool {
            name: "cpp_status",
            description: "Engine, indexing and cache status of the service.",
            input_schema: json!({ "type": "object", "properties": {} }),
        },
    ]
}

// ==================== MCP Server ====================

pub struct McpServer {
    service: Arc<ServiceContext>,
}

impl McpServer {
    pub fn new(service: Arc<ServiceContext>) -> Self {
        Self { service }
    }

    /// Serve until `input` reaches end of file. Requests still in flight are
    /// answered before this returns.
    pub async fn run<R, W>(self: Arc<Self>, input: R, mut output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
        let writer = tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                let mut line = match serde_json::to_vec(&response) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!("failed to encode response: {err}");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(err) = output.write_all(&line).await {
                    warn!("failed to write response: {err}");
                    break;
                }
                if output.flush().await.is_err() {
                    break;
                }
            }
        });

        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let server = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Some(response) = server.handle_message(&line).await {
                    if tx.send(response).is_err() {
                        debug!("response dropped; writer is gone");
                    }
                }
            });
        }
        drop(tx);
        writer
            .await
            .map_err(|err| anyhow!("response writer failed: {err}"))?;
        Ok(())
    }

    async fn handle_message(&self, line: &str) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => {
                return Some(JsonRpcResponse::error(
                    Value::Null,
                    PARSE_ERROR,
                    format!("Parse error: {e}"),
                ));
            }
        };

        // Notifications don't get responses
        let Some(id) = request.id else {
            match request.method.as_str() {
                "notifications/initialized" => info!("MCP client initialized"),
                other => debug!("Unknown notification: {other}"),
            }
            return None;
        };

        Some(match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(id, initialize_result()),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => JsonRpcResponse::success(id, json!({ "tools": tools() })),
            "tools/call" => match self.handle_tools_call(&request.params).await {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => JsonRpcResponse::error(id, INVALID_PARAMS, e.to_string()),
            },
            other => JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {other}")),
        })
    }

    async fn handle_tools_call(&self, params: &Value) -> Result<Value> {
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Missing tool name"))?;
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
        debug!("tool call {name} {arguments}");

        let result = match self.call_tool(name, &arguments).await {
            Ok(Some(text)) => ToolResult::text(text),
            Ok(None) => {
                let err = AnalysisError::InvalidRequest(format!("Unknown tool: {name}"));
                ToolResult::error(&err)
            }
            Err(err) => ToolResult::error(&err),
        };
        Ok(serde_json::to_value(result)?)
    }

    /// `Ok(None)` for an unknown tool name.
    async fn call_tool(&self, name: &str, args: &Value) -> Result<Option<String>, AnalysisError> {
        let service = &self.service;
        let answer = match name {
            "cpp_definition" => service.definition(self.location(args)?).await?,
            "cpp_references" => {
                let include_declaration = flag(args, "include_declaration").unwrap_or(true);
                service
                    .references(self.location(args)?, include_declaration)
                    .await?
            }
            "cpp_hover" => {
                service
                    .hover(self.location(args)?, flag(args, "summarize").unwrap_or(false))
                    .await?
            }
            "cpp_incoming_calls" => {
                service
                    .incoming_calls(
                        self.location(args)?,
                        depth(args),
                        flag(args, "summarize").unwrap_or(false),
                    )
                    .await?
            }
            "cpp_outgoing_calls" => {
                service
                    .outgoing_calls(
                        self.location(args)?,
                        depth(args),
                        flag(args, "summarize").unwrap_or(false),
                    )
                    .await?
            }
            "cpp_type_hierarchy" => service.prepare_type_hierarchy(self.location(args)?).await?,
            "cpp_supertypes" => service.supertypes(self.location(args)?, depth(args)).await?,
            "cpp_subtypes" => service.subtypes(self.location(args)?, depth(args)).await?,
            "cpp_signature" => service.signature(self.location(args)?).await?,
            "cpp_outline" => service.outline(self.file(args)?).await?,
            "cpp_search_symbols" => {
                let query = string(args, "query")
                    .ok_or_else(|| AnalysisError::InvalidRequest("missing 'query'".into()))?;
                service
                    .search_symbols(query, string(args, "file_pattern"))
                    .await?
            }
            "cpp_list_files" => service.list_files(string(args, "pattern")).await?,
            "cpp_status" => {
                let status = service.status().await;
                return Ok(Some(to_text(&status)?));
            }
            _ => return Ok(None),
        };
        Ok(Some(to_text(&answer)?))
    }

    fn file(&self, args: &Value) -> Result<PathBuf, AnalysisError> {
        let file = string(args, "file")
            .ok_or_else(|| AnalysisError::InvalidRequest("missing 'file'".into()))?;
        Ok(resolve_path(&self.service.config().project_root, &file))
    }

    fn location(&self, args: &Value) -> Result<SymbolLocation, AnalysisError> {
        let file = self.file(args)?;
        let number = |key: &str| {
            args.get(key)
                .and_then(|v| v.as_u64())
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| AnalysisError::InvalidRequest(format!("missing '{key}'")))
        };
        SymbolLocation::new(file, number("line")?, number("column")?)
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": { "listChanged": false }
        },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": SERVER_VERSION
        }
    })
}

fn string(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn flag(args: &Value, key: &str) -> Option<bool> {
    args.get(key).and_then(|v| v.as_bool())
}

fn depth(args: &Value) -> Option<u32> {
    args.get("depth")
        .and_then(|v| v.as_u64())
        .map(|d| d.min(u32::MAX as u64) as u32)
}

/// Resolve `file` against the project root so that `./a.cpp`, `a.cpp` and
/// the absolute path all name the same cache entry.
fn resolve_path(root: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    // components() drops interior `.` segments for files that do not exist
    joined
        .canonicalize()
        .unwrap_or_else(|_| joined.components().collect())
}

fn to_text<T: Serialize>(value: &T) -> Result<String, AnalysisError> {
    serde_json::to_string_pretty(value).map_err(|e| AnalysisError::Protocol(e.to_string()))
}

/// Run the MCP server on stdio until stdin closes.
pub async fn run_server(service: Arc<ServiceContext>) -> Result<()> {
    let server = Arc::new(McpServer::new(service));
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    server.run(stdin, tokio::io::stdout()).await
}
