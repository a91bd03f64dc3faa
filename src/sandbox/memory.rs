//! An in-process sandbox that serves scripted MCP servers over memory pipes.
//!
//! Useful for tests and dry runs: every `launch` spawns a task speaking the
//! same newline-delimited JSON-RPC a real server would write to stdout.

use super::{SandboxHandle, SandboxProcess, SandboxProvider};
use crate::error::{McpError, Result};
use crate::models::{ServerConfig, ToolResult};
use crate::network_adapter::{NdjsonAdapter, NetworkAdapter};
use crate::protocol::ProtocolConnection;
use crate::types::{
    CallToolParams, Content, ErrorData, ErrorResponse, Implementation, InitializeResult,
    ListToolsResult, Notification, RequestId, Response, ServerCapabilities, ToolDefinition,
    ToolsCapability, INVALID_PARAMS, JSONRPC_VERSION, LATEST_PROTOCOL_VERSION,
    METHOD_INITIALIZE, METHOD_NOT_FOUND, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
    METHOD_TOOLS_LIST_CHANGED,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Executes a stub tool. An `Err` is reported to the client in-band with `isError`.
pub type ToolHandler = Arc<dyn Fn(&str, Value) -> anyhow::Result<ToolResult> + Send + Sync>;

const PIPE_CAPACITY: usize = 64 * 1024;

/// A scripted MCP server.
///
/// # Example
///
/// ```
/// use e2b_mcp::sandbox::StubServer;
/// use e2b_mcp::models::ToolResult;
/// use e2b_mcp::types::Content;
/// use serde_json::json;
///
/// let server = StubServer::new("echo")
///     .with_tool("echo", "Echoes its input", json!({ "type": "object" }))
///     .with_handler(|_name, args| {
///         Ok(ToolResult {
///             content: vec![Content::text(args.to_string())],
///             is_error: false,
///         })
///     });
/// assert_eq!(server.tools().len(), 1);
/// ```
#[derive(Clone)]
pub struct StubServer {
    info: Implementation,
    tools: Vec<ToolDefinition>,
    /// Tools that appear after the first `tools/list` reply, announced with `list_changed`.
    late_tools: Vec<ToolDefinition>,
    page_size: Option<usize>,
    handler: ToolHandler,
    advertise_tools: bool,
    response_delay: Option<Duration>,
}

impl StubServer {
    pub fn new(name: &str) -> Self {
        Self {
            info: Implementation {
                name: name.to_string(),
                version: "0.0.0".to_string(),
            },
            tools: Vec::new(),
            late_tools: Vec::new(),
            page_size: None,
            handler: Arc::new(|name: &str, _args: Value| {
                Err(anyhow::anyhow!("tool '{name}' has no handler"))
            }),
            advertise_tools: true,
            response_delay: None,
        }
    }

    pub fn with_tool(mut self, name: &str, description: &str, input_schema: Value) -> Self {
        self.tools.push(ToolDefinition {
            name: name.to_string(),
            description: Some(description.to_string()),
            input_schema: Some(input_schema),
        });
        self
    }

    /// Adds a tool right after the first `tools/list` reply and sends
    /// `notifications/tools/list_changed` for it.
    pub fn with_tool_added_after_list(
        mut self,
        name: &str,
        description: &str,
        input_schema: Value,
    ) -> Self {
        self.late_tools.push(ToolDefinition {
            name: name.to_string(),
            description: Some(description.to_string()),
            input_schema: Some(input_schema),
        });
        self
    }

    /// Splits `tools/list` replies into pages of `size` tools linked by cursors.
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size.max(1));
        self
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, Value) -> anyhow::Result<ToolResult> + Send + Sync + 'static,
    {
        self.handler = Arc::new(handler);
        self
    }

    /// Omits the `tools` capability from the `initialize` result.
    pub fn without_tools_capability(mut self) -> Self {
        self.advertise_tools = false;
        self
    }

    /// Delays every response, to exercise client timeouts.
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = Some(delay);
        self
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    async fn serve<A: NetworkAdapter>(mut self, mut connection: ProtocolConnection<A>) -> Result<()> {
        while let Some(message) = connection.recv_json().await? {
            // Notifications such as `notifications/initialized` need no reply.
            let (Some(id), Some(method)) = (message.get("id"), message["method"].as_str()) else {
                continue;
            };
            let id: RequestId = serde_json::from_value(id.clone())?;
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            if let Some(delay) = self.response_delay {
                tokio::time::sleep(delay).await;
            }
            let reply = match self.dispatch(method, params) {
                Ok(result) => serde_json::to_value(Response {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    id,
                    result,
                })?,
                Err(error) => serde_json::to_value(ErrorResponse {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    id,
                    error,
                })?,
            };
            connection.send_serializable(reply).await?;

            if method == METHOD_TOOLS_LIST && !self.late_tools.is_empty() {
                self.tools.append(&mut self.late_tools);
                connection
                    .send_serializable(Notification::<Value>::new(METHOD_TOOLS_LIST_CHANGED, None))
                    .await?;
            }
        }
        Ok(())
    }

    fn dispatch(&self, method: &str, params: Value) -> std::result::Result<Value, ErrorData> {
        let to_value = |v: std::result::Result<Value, serde_json::Error>| {
            v.map_err(|e| error_data(INVALID_PARAMS, e.to_string()))
        };
        match method {
            METHOD_INITIALIZE => to_value(serde_json::to_value(InitializeResult {
                protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
                capabilities: ServerCapabilities {
                    tools: self.advertise_tools.then(ToolsCapability::default),
                    ..Default::default()
                },
                server_info: self.info.clone(),
            })),
            METHOD_TOOLS_LIST => {
                let start = match params.get("cursor").and_then(Value::as_str) {
                    Some(cursor) => cursor.parse::<usize>().map_err(|_| {
                        error_data(INVALID_PARAMS, format!("Invalid cursor: {cursor}"))
                    })?,
                    None => 0,
                };
                let end = self
                    .page_size
                    .map_or(self.tools.len(), |size| start.saturating_add(size))
                    .min(self.tools.len());
                let page = self.tools.get(start..end).unwrap_or_default().to_vec();
                to_value(serde_json::to_value(ListToolsResult {
                    tools: page,
                    next_cursor: (end < self.tools.len()).then(|| end.to_string()),
                }))
            }
            METHOD_TOOLS_CALL => {
                let params: CallToolParams = serde_json::from_value(params)
                    .map_err(|e| error_data(INVALID_PARAMS, e.to_string()))?;
                if !self.tools.iter().any(|t| t.name == params.name) {
                    return Err(error_data(
                        INVALID_PARAMS,
                        format!("Unknown tool: {}", params.name),
                    ));
                }
                let result = match (self.handler)(&params.name, params.arguments) {
                    Ok(result) => result,
                    Err(e) => ToolResult {
                        content: vec![Content::text(e.to_string())],
                        is_error: true,
                    },
                };
                to_value(serde_json::to_value(result))
            }
            "ping" => Ok(json!({})),
            other => Err(error_data(METHOD_NOT_FOUND, format!("Method not found: {other}"))),
        }
    }
}

fn error_data(code: i64, message: String) -> ErrorData {
    ErrorData {
        code,
        message,
        data: None,
    }
}

/// Serves registered `StubServer`s, keyed by `ServerConfig::name`.
#[derive(Default, Clone)]
pub struct InMemorySandboxProvider {
    servers: HashMap<String, StubServer>,
    require_api_key: bool,
    live: Arc<AtomicUsize>,
    launched: Arc<AtomicUsize>,
}

impl InMemorySandboxProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `server` whenever a config named `name` is launched.
    pub fn with_server(mut self, name: &str, server: StubServer) -> Self {
        self.servers.insert(name.to_string(), server);
        self
    }

    /// Makes the provider behave like one backed by the hosted service.
    pub fn with_api_key_required(mut self, required: bool) -> Self {
        self.require_api_key = required;
        self
    }

    /// Sandboxes launched and not yet terminated.
    pub fn live_sandboxes(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn launched_sandboxes(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxProvider for InMemorySandboxProvider {
    async fn launch(&self, config: &ServerConfig) -> Result<SandboxProcess> {
        let server = self.servers.get(&config.name).cloned().ok_or_else(|| {
            McpError::Sandbox(format!("no in-memory server registered as '{}'", config.name))
        })?;

        let (client_side, server_side) = tokio::io::duplex(PIPE_CAPACITY);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (server_read, server_write) = tokio::io::split(server_side);

        let id = format!("memory-{}", Uuid::new_v4().simple());
        let server_name = config.name.clone();
        let task = tokio::spawn(async move {
            let connection = ProtocolConnection::new(NdjsonAdapter::new(server_read, server_write));
            if let Err(e) = server.serve(connection).await {
                warn!(server = %server_name, error = %e, "In-memory server stopped with an error");
            }
        });

        self.launched.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        debug!(sandbox = %id, server = %config.name, "Launched in-memory sandbox");

        Ok(SandboxProcess {
            adapter: Box::new(NdjsonAdapter::new(client_read, client_write)),
            handle: Box::new(MemorySandboxHandle {
                id,
                task: Some(task),
                live: Arc::clone(&self.live),
            }),
        })
    }

    fn requires_api_key(&self) -> bool {
        self.require_api_key
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemorySandboxHandle {
    id: String,
    task: Option<JoinHandle<()>>,
    live: Arc<AtomicUsize>,
}

#[async_trait]
impl SandboxHandle for MemorySandboxHandle {
    fn id(&self) -> &str {
        &self.id
    }

    async fn terminate(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemorySandboxHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
