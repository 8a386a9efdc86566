//! Stdio tool server
//!
//! Exposes memory operations as MCP tools over line-delimited JSON-RPC.
//! Stdout carries protocol traffic only; logs go to stderr.

use crate::artifact::{Artifact, ArtifactType, ScopeType};
use crate::memory::{HierarchicalMemory, TaskContext};
use crate::protocol::{
    error_codes, methods, tools, JsonRpcRequest, JsonRpcResponse, ToolCallParams, ToolDefinition,
    ToolResult, PROTOCOL_VERSION,
};
use crate::Result;
use anyhow::{anyhow, bail};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SERVER_NAME: &str = "cca-memory";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreMetadata {
    submodule: Option<String>,
    task_id: Option<String>,
    file: Option<String>,
    language: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    confidence: Option<f64>,
    #[serde(default)]
    related: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreArgs {
    scope: ScopeType,
    artifact_type: ArtifactType,
    content: String,
    #[serde(default)]
    metadata: StoreMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveArgs {
    query: String,
    active_scope: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskArgs {
    task_id: String,
    #[serde(default)]
    task_context: TaskContext,
}

#[derive(Debug, Deserialize)]
struct ClearArgs {
    #[serde(default)]
    confirm: bool,
    #[serde(default)]
    purge: bool,
}

#[derive(Debug, Deserialize)]
struct SearchScopesArgs {
    query: String,
    scope: String,
}

fn parse_args<T: serde::de::DeserializeOwned>(arguments: Value) -> anyhow::Result<T> {
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    serde_json::from_value(arguments).map_err(|e| anyhow!("Invalid arguments: {}", e))
}

/// JSON-RPC front end over a shared memory
pub struct ToolServer {
    memory: Arc<HierarchicalMemory>,
}

impl ToolServer {
    pub fn new(memory: Arc<HierarchicalMemory>) -> Self {
        Self { memory }
    }

    pub fn memory(&self) -> &Arc<HierarchicalMemory> {
        &self.memory
    }

    /// Serve requests from stdin until it closes
    pub async fn run(&self) -> Result<()> {
        info!("Tool server running on stdio");
        self.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }

    /// Serve line-delimited requests from `reader`, writing responses to `writer`
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = LinesStream::new(reader.lines());
        while let Some(line) = lines.next().await {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Some(response) = self.handle_line(&line).await {
                writer.write_all(response.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
        }
        debug!("Input closed, stopping tool server");
        Ok(())
    }

    /// Handle one raw line; `None` for notifications
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let response = match serde_json::from_str::<Value>(line) {
            Err(e) => Some(JsonRpcResponse::failure(
                Value::Null,
                error_codes::PARSE_ERROR,
                format!("Parse error: {}", e),
            )),
            Ok(value) => {
                let id = value.get("id").cloned().unwrap_or(Value::Null);
                match serde_json::from_value::<JsonRpcRequest>(value) {
                    Ok(request) => self.handle_request(request).await,
                    Err(e) => Some(JsonRpcResponse::failure(
                        id,
                        error_codes::INVALID_REQUEST,
                        format!("Invalid request: {}", e),
                    )),
                }
            }
        };

        response.and_then(|r| match serde_json::to_string(&r) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("Failed to encode response: {}", e);
                None
            }
        })
    }

    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        debug!("Request: {}", request.method);
        let Some(id) = request.id.clone() else {
            // Notifications get no reply
            return None;
        };

        let response = match request.method.as_str() {
            methods::INITIALIZE => JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": SERVER_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            ),
            methods::PING => JsonRpcResponse::success(id, json!({})),
            methods::TOOLS_LIST => JsonRpcResponse::success(id, json!({ "tools": tool_definitions() })),
            methods::TOOLS_CALL => {
                let params = request.params.unwrap_or(Value::Null);
                match serde_json::from_value::<ToolCallParams>(params) {
                    Ok(call) => {
                        let result = self.call_tool(&call.name, call.arguments).await;
                        match serde_json::to_value(result) {
                            Ok(value) => JsonRpcResponse::success(id, value),
                            Err(e) => JsonRpcResponse::failure(id, error_codes::INTERNAL_ERROR, e.to_string()),
                        }
                    }
                    Err(e) => JsonRpcResponse::failure(
                        id,
                        error_codes::INVALID_PARAMS,
                        format!("Invalid tools/call params: {}", e),
                    ),
                }
            }
            other => JsonRpcResponse::failure(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
            ),
        };
        Some(response)
    }

    /// Run a tool. Failures become `isError` results.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> ToolResult {
        let outcome = match name {
            tools::MEMORY_STORE => self.memory_store(arguments).await,
            tools::MEMORY_RETRIEVE => self.memory_retrieve(arguments).await,
            tools::MEMORY_CREATE_TASK => self.memory_create_task(arguments).await,
            tools::MEMORY_STATS => self.memory_stats().await,
            tools::MEMORY_CLEAR => self.memory_clear(arguments).await,
            tools::MEMORY_SEARCH_SCOPES => self.memory_search_scopes(arguments).await,
            other => Err(anyhow!("Unknown tool: {}", other)),
        };

        match outcome {
            Ok(payload) => ToolResult::ok(payload),
            Err(e) => {
                warn!("Tool {} failed: {}", name, e);
                ToolResult::error(name, e)
            }
        }
    }

    async fn memory_store(&self, arguments: Value) -> anyhow::Result<Value> {
        let args: StoreArgs = parse_args(arguments)?;
        let meta = args.metadata;
        if args.scope == ScopeType::Submodule && meta.submodule.is_none() {
            bail!("submodule is required when scope=submodule");
        }
        if args.scope == ScopeType::Task && meta.task_id.is_none() {
            bail!("taskId is required when scope=task");
        }

        let id = format!(
            "{}-{}-{}-{}",
            args.scope,
            args.artifact_type.as_str(),
            Utc::now().timestamp_millis(),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let mut artifact = Artifact::new(id, args.artifact_type, args.content, args.scope);
        artifact.metadata.submodule = meta.submodule;
        artifact.metadata.task_id = meta.task_id;
        artifact.metadata.file = meta.file;
        artifact.metadata.language = meta.language;
        artifact.metadata.tags = meta.tags;
        artifact.metadata.confidence = meta.confidence;
        artifact.metadata.related = meta.related;

        let artifact_id = artifact.id.clone();
        let scope_name = artifact.scope_name();
        let type_name = artifact.artifact_type.as_str().to_string();
        self.memory.store(artifact).await?;

        Ok(json!({
            "success": true,
            "message": format!("Successfully stored {} artifact in {} scope", type_name, scope_name),
            "artifactId": artifact_id,
        }))
    }

    async fn memory_retrieve(&self, arguments: Value) -> anyhow::Result<Value> {
        let args: RetrieveArgs = parse_args(arguments)?;
        let context = self
            .memory
            .retrieve(&args.query, args.active_scope.as_deref())
            .await?;

        Ok(json!({
            "success": true,
            "query": args.query,
            "activeScope": args.active_scope.as_deref().unwrap_or("all"),
            "results": {
                "artifacts": context.artifacts,
                "stats": {
                    "totalArtifacts": context.artifacts.len(),
                    "compressionRatio": context.compression_ratio,
                    "totalTokens": context.total_tokens,
                    "scopeBreakdown": context.scopes,
                }
            }
        }))
    }

    async fn memory_create_task(&self, arguments: Value) -> anyhow::Result<Value> {
        let args: CreateTaskArgs = parse_args(arguments)?;
        let injected = self
            .memory
            .create_task_scope(&args.task_id, args.task_context)
            .await?;

        Ok(json!({
            "success": true,
            "message": format!("Created task scope for {} with relevant context injected", args.task_id),
            "taskId": args.task_id,
            "injected": injected,
        }))
    }

    async fn memory_stats(&self) -> anyhow::Result<Value> {
        let stats = self.memory.stats().await;
        let config = self.memory.config();
        Ok(json!({
            "success": true,
            "stats": {
                "scopes": stats.scopes,
                "artifacts": stats.artifacts,
                "totalTokens": stats.total_tokens,
                "config": {
                    "repository": config.repository,
                    "submodules": config.submodules,
                }
            }
        }))
    }

    async fn memory_clear(&self, arguments: Value) -> anyhow::Result<Value> {
        let args: ClearArgs = parse_args(arguments)?;
        if !args.confirm {
            bail!("Must confirm deletion by setting confirm=true");
        }

        let message = if args.purge {
            self.memory.purge().await?;
            "Cleared all memories from all scopes and durable storage"
        } else {
            self.memory.clear().await;
            "Cleared all memories from all scopes"
        };
        Ok(json!({ "success": true, "message": message }))
    }

    /// `scope` is a scope name (`submodule:sdk`) or a kind (`submodule`)
    /// selecting every scope of that kind
    async fn memory_search_scopes(&self, arguments: Value) -> anyhow::Result<Value> {
        let args: SearchScopesArgs = parse_args(arguments)?;
        let prefix = format!("{}:", args.scope);
        let selected: Vec<String> = self
            .memory
            .scope_names()
            .await
            .into_iter()
            .filter(|name| *name == args.scope || name.starts_with(&prefix))
            .collect();
        if selected.is_empty() {
            bail!("Scope not found: {}", args.scope);
        }

        let mut artifacts = Vec::new();
        for name in &selected {
            artifacts.extend(self.memory.retrieve_from_scope(name, &args.query).await?);
        }
        let total_tokens: usize = artifacts.iter().map(Artifact::tokens).sum();

        Ok(json!({
            "success": true,
            "query": args.query,
            "scope": args.scope,
            "results": {
                "artifacts": artifacts,
                "stats": {
                    "totalArtifacts": artifacts.len(),
                    "totalTokens": total_tokens,
                    "scopes": selected,
                }
            }
        }))
    }
}

const SCOPE_ENUM: [&str; 4] = ["repository", "submodule", "session", "task"];

/// Descriptors for every tool
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: tools::MEMORY_STORE,
            description: "Store an artifact (pattern, error message, design decision, log, ...) in hierarchical memory.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "scope": { "type": "string", "enum": SCOPE_ENUM, "description": "Memory scope level" },
                    "artifactType": {
                        "type": "string",
                        "enum": ["code_diff", "error_message", "design_decision", "build_log", "test_result", "conversation", "pattern"],
                        "description": "Type of artifact being stored"
                    },
                    "content": { "type": "string", "description": "Content to store" },
                    "metadata": {
                        "type": "object",
                        "description": "submodule, taskId, file, language, tags, confidence, related",
                        "properties": {
                            "submodule": { "type": "string" },
                            "taskId": { "type": "string" },
                            "file": { "type": "string" },
                            "language": { "type": "string" },
                            "tags": { "type": "array", "items": { "type": "string" } },
                            "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                            "related": { "type": "array", "items": { "type": "string" } }
                        }
                    }
                },
                "required": ["scope", "artifactType", "content"]
            }),
        },
        ToolDefinition {
            name: tools::MEMORY_RETRIEVE,
            description: "Retrieve relevant artifacts across scopes, compressed to the token budget.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Substring to search for" },
                    "activeScope": { "type": "string", "description": "Task scope to include, e.g. task:bd-123" }
                },
                "required": ["query"]
            }),
        },
        ToolDefinition {
            name: tools::MEMORY_CREATE_TASK,
            description: "Create a task scope and inject relevant context from the other scopes.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "taskId": { "type": "string", "description": "Task identifier, e.g. bd-123" },
                    "taskContext": { "type": "object", "description": "title, description, labels, ..." }
                },
                "required": ["taskId", "taskContext"]
            }),
        },
        ToolDefinition {
            name: tools::MEMORY_STATS,
            description: "Number of scopes, artifacts and tokens held in memory.",
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolDefinition {
            name: tools::MEMORY_CLEAR,
            description: "Clear every scope. Destructive; requires confirm=true. purge=true also deletes durable records.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "confirm": { "type": "boolean", "description": "Must be true to confirm deletion" },
                    "purge": { "type": "boolean", "description": "Also delete persisted artifacts" }
                },
                "required": ["confirm"]
            }),
        },
        ToolDefinition {
            name: tools::MEMORY_SEARCH_SCOPES,
            description: "Search within one scope, or every scope of a kind, without compression.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" },
                    "scope": { "type": "string", "description": "Scope name (submodule:sdk) or kind (submodule)" }
                },
                "required": ["query", "scope"]
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn make_server() -> (TempDir, ToolServer) {
        let dir = TempDir::new().unwrap();
        let config = MemoryConfig::new(PathBuf::from("/repo"))
            .with_submodules(["sdk", "juce_backend"])
            .with_storage_path(dir.path().join("memory"));
        let memory = HierarchicalMemory::new(config).unwrap();
        (dir, ToolServer::new(Arc::new(memory)))
    }

    fn payload(result: &ToolResult) -> Value {
        serde_json::from_str(&result.content[0].text).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_and_list() {
        let (_dir, server) = make_server();
        let init = server
            .handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#)
            .await
            .unwrap();
        let init: Value = serde_json::from_str(&init).unwrap();
        assert_eq!(init["result"]["serverInfo"]["name"], json!(SERVER_NAME));

        let list = server
            .handle_line(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .await
            .unwrap();
        let list: Value = serde_json::from_str(&list).unwrap();
        let names: Vec<&str> = list["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "memory_store",
                "memory_retrieve",
                "memory_create_task",
                "memory_stats",
                "memory_clear",
                "memory_search_scopes"
            ]
        );
    }

    #[tokio::test]
    async fn test_notification_has_no_reply() {
        let (_dir, server) = make_server();
        assert!(server
            .handle_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let (_dir, server) = make_server();
        let parse: Value = serde_json::from_str(&server.handle_line("{oops").await.unwrap()).unwrap();
        assert_eq!(parse["error"]["code"], json!(error_codes::PARSE_ERROR));
        assert_eq!(parse["id"], Value::Null);

        let unknown: Value = serde_json::from_str(
            &server
                .handle_line(r#"{"jsonrpc":"2.0","id":"x","method":"resources/list"}"#)
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(unknown["error"]["code"], json!(error_codes::METHOD_NOT_FOUND));
        assert_eq!(unknown["id"], json!("x"));

        let bad_params: Value = serde_json::from_str(
            &server
                .handle_line(r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"arguments":{}}}"#)
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(bad_params["error"]["code"], json!(error_codes::INVALID_PARAMS));
    }

    #[tokio::test]
    async fn test_store_then_retrieve() {
        let (_dir, server) = make_server();
        let stored = server
            .call_tool(
                "memory_store",
                json!({
                    "scope": "submodule",
                    "artifactType": "pattern",
                    "content": "SDK tests use Vitest",
                    "metadata": { "submodule": "sdk", "tags": ["testing"], "confidence": 0.9 }
                }),
            )
            .await;
        assert!(!stored.is_error);
        let stored = payload(&stored);
        assert!(stored["artifactId"].as_str().unwrap().starts_with("submodule-pattern-"));

        let found = payload(&server.call_tool("memory_retrieve", json!({ "query": "vitest" })).await);
        assert_eq!(found["activeScope"], json!("all"));
        assert_eq!(found["results"]["stats"]["totalArtifacts"], json!(1));
        assert_eq!(
            found["results"]["stats"]["scopeBreakdown"]["submodule:sdk"]["artifacts"],
            json!(1)
        );
    }

    #[tokio::test]
    async fn test_store_admission_failure_is_tool_error() {
        let (_dir, server) = make_server();
        let result = server
            .call_tool(
                "memory_store",
                json!({
                    "scope": "submodule",
                    "artifactType": "pattern",
                    "content": "x",
                    "metadata": { "submodule": "wrong_submodule" }
                }),
            )
            .await;
        assert!(result.is_error);
        assert_eq!(payload(&result)["tool"], json!("memory_store"));
        assert_eq!(server.memory().stats().await.artifacts, 0);

        let missing = server
            .call_tool("memory_store", json!({ "scope": "task", "artifactType": "pattern", "content": "x" }))
            .await;
        assert!(payload(&missing)["error"].as_str().unwrap().contains("taskId is required"));
    }

    #[tokio::test]
    async fn test_store_rejects_confidence_out_of_range() {
        let (_dir, server) = make_server();
        let result = server
            .call_tool(
                "memory_store",
                json!({
                    "scope": "repository",
                    "artifactType": "pattern",
                    "content": "x",
                    "metadata": { "confidence": 7.5 }
                }),
            )
            .await;
        assert!(result.is_error);
        assert!(payload(&result)["error"].as_str().unwrap().contains("Confidence"));
        assert_eq!(server.memory().storage().stats().await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_create_task_and_search_scopes() {
        let (_dir, server) = make_server();
        server
            .call_tool(
                "memory_store",
                json!({
                    "scope": "submodule",
                    "artifactType": "error_message",
                    "content": "python 3.9 breaks juce build",
                    "metadata": { "submodule": "juce_backend" }
                }),
            )
            .await;

        let created = server
            .call_tool(
                "memory_create_task",
                json!({ "taskId": "bd-1", "taskContext": { "title": "python", "description": "" } }),
            )
            .await;
        assert_eq!(payload(&created)["injected"], json!(1));

        let duplicate = server
            .call_tool("memory_create_task", json!({ "taskId": "bd-1", "taskContext": {} }))
            .await;
        assert!(duplicate.is_error);

        let by_kind = payload(
            &server
                .call_tool("memory_search_scopes", json!({ "query": "python", "scope": "task" }))
                .await,
        );
        assert_eq!(by_kind["results"]["stats"]["totalArtifacts"], json!(1));
        assert_eq!(by_kind["results"]["stats"]["scopes"], json!(["task:bd-1"]));

        let missing = server
            .call_tool("memory_search_scopes", json!({ "query": "python", "scope": "submodule:nope" }))
            .await;
        assert!(missing.is_error);
    }

    #[tokio::test]
    async fn test_clear_requires_confirm() {
        let (_dir, server) = make_server();
        server
            .call_tool(
                "memory_store",
                json!({ "scope": "repository", "artifactType": "pattern", "content": "keep" }),
            )
            .await;

        let refused = server.call_tool("memory_clear", json!({ "confirm": false })).await;
        assert!(refused.is_error);
        assert_eq!(server.memory().stats().await.artifacts, 1);

        let cleared = server.call_tool("memory_clear", json!({ "confirm": true })).await;
        assert!(!cleared.is_error);
        let stats = payload(&server.call_tool("memory_stats", Value::Null).await);
        assert_eq!(stats["stats"]["artifacts"], json!(0));
        assert_eq!(stats["stats"]["scopes"], json!(4));
        assert_eq!(stats["stats"]["config"]["submodules"], json!(["sdk", "juce_backend"]));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let (_dir, server) = make_server();
        let result = server.call_tool("memory_teleport", json!({})).await;
        assert!(result.is_error);
        assert!(payload(&result)["error"].as_str().unwrap().contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_serve_over_streams() {
        let (_dir, server) = make_server();
        let input = concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n",
            "\n",
            "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/call\",\"params\":{\"name\":\"memory_stats\"}}\n",
        );
        let mut output = Vec::new();
        server.serve(input.as_bytes(), &mut output).await.unwrap();

        let lines: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], json!(1));
        assert_eq!(lines[1]["result"]["isError"], json!(false));
    }
}
