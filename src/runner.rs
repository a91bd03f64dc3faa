//! Defines `E2bMcpRunner`, which manages MCP servers running in sandboxes.

use crate::client::McpClient;
use crate::config::RunnerConfig;
use crate::error::{McpError, Result};
use crate::models::{ServerConfig, Session, Tool, ToolResult};
use crate::sandbox::{SandboxHandle, SandboxProcess, SandboxProvider};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// A session the runner holds open: its snapshot, client and sandbox.
struct LiveSession {
    session: RwLock<Session>,
    client: McpClient,
    sandbox: Mutex<Box<dyn SandboxHandle>>,
    /// Set by `notifications/tools/list_changed`; the cached tool list is re-read on next use.
    tools_stale: Arc<AtomicBool>,
}

/// Runs MCP servers inside sandboxes and calls their tools.
///
/// Servers are registered by name with a `ServerConfig`. Each
/// `start_session` launches a fresh sandbox through the configured
/// `SandboxProvider`, performs the MCP handshake and caches the server's
/// tools. Sessions stay open until `close_session` or `shutdown`.
///
/// # Example
///
/// ```no_run
/// use e2b_mcp::{E2bMcpRunner, ServerConfig, Result};
/// use e2b_mcp::config::RunnerConfig;
/// use e2b_mcp::sandbox::LocalSandboxProvider;
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> Result<()> {
///     let runner = E2bMcpRunner::new(RunnerConfig::from_env()?, LocalSandboxProvider::new())?;
///     runner
///         .add_server(ServerConfig::new("fetch", "uvx mcp-server-fetch"))
///         .await?;
///
///     let session = runner.start_session("fetch").await?;
///     for tool in &session.tools {
///         println!("{}: {:?}", tool.qualified_name(), tool.description);
///     }
///
///     let result = runner
///         .call_tool(&session.id, "fetch", json!({ "url": "https://example.com" }))
///         .await?;
///     println!("{}", result.text());
///
///     runner.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct E2bMcpRunner {
    config: RunnerConfig,
    provider: Arc<dyn SandboxProvider>,
    servers: RwLock<BTreeMap<String, ServerConfig>>,
    sessions: DashMap<String, Arc<LiveSession>>,
    /// Live sessions plus sessions being started; bounded by `max_sessions`.
    reserved_slots: AtomicUsize,
}

impl E2bMcpRunner {
    /// Creates a runner that launches sandboxes through `provider`.
    ///
    /// Fails with `McpError::MissingApiKey` if the provider needs a credential
    /// and `config` carries none.
    pub fn new<P>(config: RunnerConfig, provider: P) -> Result<Self>
    where
        P: SandboxProvider + 'static,
    {
        Self::with_shared_provider(config, Arc::new(provider))
    }

    pub fn with_shared_provider(
        config: RunnerConfig,
        provider: Arc<dyn SandboxProvider>,
    ) -> Result<Self> {
        config.validate()?;
        if provider.requires_api_key() && config.api_key.is_none() {
            return Err(McpError::MissingApiKey);
        }
        info!(
            provider = provider.name(),
            max_sessions = config.max_sessions,
            "Created MCP runner"
        );
        Ok(Self {
            config,
            provider,
            servers: RwLock::new(BTreeMap::new()),
            sessions: DashMap::new(),
            reserved_slots: AtomicUsize::new(0),
        })
    }

    /// Creates a runner from `RunnerConfig::from_env`.
    pub fn from_env<P>(provider: P) -> Result<Self>
    where
        P: SandboxProvider + 'static,
    {
        Self::new(RunnerConfig::from_env()?, provider)
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    // --- Server registry ---

    /// Registers a server. Names are unique within a runner.
    pub async fn add_server(&self, config: ServerConfig) -> Result<()> {
        config.validate()?;
        let mut servers = self.servers.write().await;
        if servers.contains_key(&config.name) {
            return Err(McpError::DuplicateServer(config.name));
        }
        info!(server = %config.name, "Registered MCP server");
        servers.insert(config.name.clone(), config);
        Ok(())
    }

    /// Unregisters a server. Sessions already running for it stay open.
    pub async fn remove_server(&self, name: &str) -> Result<ServerConfig> {
        let removed = self
            .servers
            .write()
            .await
            .remove(name)
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;
        info!(server = name, "Unregistered MCP server");
        Ok(removed)
    }

    pub async fn server(&self, name: &str) -> Result<ServerConfig> {
        self.servers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))
    }

    /// All registered servers, ordered by name.
    pub async fn list_servers(&self) -> Vec<ServerConfig> {
        self.servers.read().await.values().cloned().collect()
    }

    // --- Sessions ---

    /// Launches a sandbox for `server_name`, connects and lists its tools.
    #[instrument(skip(self))]
    pub async fn start_session(&self, server_name: &str) -> Result<Session> {
        let config = self.server(server_name).await?;
        self.reserve_slot()?;
        match self.open_session(config).await {
            Ok(live) => {
                let snapshot = live.session.read().await.clone();
                self.sessions.insert(snapshot.id.clone(), live);
                info!(
                    session = %snapshot.id,
                    sandbox = %snapshot.sandbox_id,
                    tools = snapshot.tools.len(),
                    "Session started"
                );
                Ok(snapshot)
            }
            Err(e) => {
                self.release_slot();
                Err(e)
            }
        }
    }

    async fn open_session(&self, config: ServerConfig) -> Result<Arc<LiveSession>> {
        let timeout = config.timeout.unwrap_or(self.config.default_timeout);
        let SandboxProcess {
            adapter,
            mut handle,
        } = self.provider.launch(&config).await?;
        let sandbox_id = handle.id().to_string();
        debug!(sandbox = %sandbox_id, "Sandbox launched, starting handshake");

        let tools_stale = Arc::new(AtomicBool::new(false));
        let handshake = async {
            let client = McpClient::connect(&config.name, adapter, timeout).await?;
            // Registered before the first listing so no change notification is missed.
            let stale_flag = Arc::clone(&tools_stale);
            let server_name = config.name.clone();
            client.on_tools_list_changed(move || {
                debug!(server = %server_name, "Server reported a tool list change");
                stale_flag.store(true, Ordering::SeqCst);
            });
            let tools = client.list_tools().await?;
            Ok::<_, McpError>((client, tools))
        }
        .await;

        let (client, tools) = match handshake {
            Ok(connected) => connected,
            Err(e) => {
                warn!(sandbox = %sandbox_id, error = %e, "Handshake failed, terminating sandbox");
                if let Err(term_err) = handle.terminate().await {
                    warn!(sandbox = %sandbox_id, error = %term_err, "Failed to terminate sandbox");
                }
                return Err(e);
            }
        };

        let session = Session {
            id: Uuid::new_v4().to_string(),
            server_name: config.name.clone(),
            sandbox_id,
            protocol_version: client.protocol_version().to_string(),
            server_info: Some(client.server_info().clone()),
            tools,
        };

        Ok(Arc::new(LiveSession {
            session: RwLock::new(session),
            client,
            sandbox: Mutex::new(handle),
            tools_stale,
        }))
    }

    fn reserve_slot(&self) -> Result<()> {
        let max = self.config.max_sessions;
        self.reserved_slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| McpError::SessionLimit(max))
    }

    fn release_slot(&self) {
        let released = self
            .reserved_slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if released.is_err() {
            warn!("Released a session slot that was never reserved");
        }
    }

    fn live(&self, session_id: &str) -> Result<Arc<LiveSession>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| McpError::SessionNotFound(session_id.to_string()))
    }

    /// The current snapshot of a live session.
    pub async fn session(&self, session_id: &str) -> Result<Session> {
        let live = self.live(session_id)?;
        let snapshot = live.session.read().await.clone();
        Ok(snapshot)
    }

    /// Snapshots of every live session, ordered by server name then id.
    pub async fn list_sessions(&self) -> Vec<Session> {
        let live: Vec<Arc<LiveSession>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut sessions = Vec::with_capacity(live.len());
        for session in live {
            sessions.push(session.session.read().await.clone());
        }
        sessions.sort_by(|a, b| (&a.server_name, &a.id).cmp(&(&b.server_name, &b.id)));
        sessions
    }

    // --- Tools ---

    /// The tools of a live session, re-read first if the server announced a change.
    pub async fn list_tools(&self, session_id: &str) -> Result<Vec<Tool>> {
        let live = self.live(session_id)?;
        if live.tools_stale.swap(false, Ordering::SeqCst) {
            return Self::reload_tools(&live).await;
        }
        let tools = live.session.read().await.tools.clone();
        Ok(tools)
    }

    /// Re-queries `tools/list` and updates the session's cached tools.
    pub async fn refresh_tools(&self, session_id: &str) -> Result<Vec<Tool>> {
        let live = self.live(session_id)?;
        live.tools_stale.store(false, Ordering::SeqCst);
        Self::reload_tools(&live).await
    }

    /// Callers clear `tools_stale` first; a failed reload sets it again.
    async fn reload_tools(live: &LiveSession) -> Result<Vec<Tool>> {
        let tools = match live.client.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                live.tools_stale.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };
        live.session.write().await.tools = tools.clone();
        Ok(tools)
    }

    /// Calls `tool_name` on a live session.
    ///
    /// Failures the tool itself reports come back as `Ok` with
    /// `ToolResult::is_error` set; transport and protocol failures are `Err`.
    #[instrument(skip(self, arguments))]
    pub async fn call_tool(
        &self,
        session_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolResult> {
        let tools = self.list_tools(session_id).await?;
        let live = self.live(session_id)?;
        if !tools.iter().any(|t| t.name == tool_name) {
            let server = live.session.read().await.server_name.clone();
            return Err(McpError::ToolNotFound {
                server,
                tool: tool_name.to_string(),
            });
        }

        let result = live.client.call_tool(tool_name, arguments).await?;
        if result.is_error {
            warn!(tool = tool_name, "Tool reported an error: {}", result.text());
        } else {
            debug!(tool = tool_name, parts = result.content.len(), "Tool call succeeded");
        }
        Ok(result)
    }

    /// Starts a throwaway session to list a server's tools.
    pub async fn discover_tools(&self, server_name: &str) -> Result<Vec<Tool>> {
        let session = self.start_session(server_name).await?;
        if let Err(e) = self.close_session(&session.id).await {
            warn!(session = %session.id, error = %e, "Failed to close discovery session");
        }
        Ok(session.tools)
    }

    /// Starts a session, calls one tool and closes the session again.
    ///
    /// The session is closed whether or not the call succeeds.
    pub async fn execute_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolResult> {
        let session = self.start_session(server_name).await?;
        let result = self.call_tool(&session.id, tool_name, arguments).await;
        if let Err(e) = self.close_session(&session.id).await {
            warn!(session = %session.id, error = %e, "Failed to close one-shot session");
        }
        result
    }

    /// Terminates a session's sandbox and forgets the session.
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        let (_, live) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| McpError::SessionNotFound(session_id.to_string()))?;
        self.release_slot();

        let mut sandbox = live.sandbox.lock().await;
        let sandbox_id = sandbox.id().to_string();
        sandbox.terminate().await?;
        info!(session = session_id, sandbox = %sandbox_id, "Session closed");
        Ok(())
    }

    /// Closes every live session. Individual failures are logged, not returned.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.close_session(&id).await {
                warn!(session = %id, error = %e, "Failed to close session during shutdown");
            }
        }
        info!("Runner shut down");
    }
}
