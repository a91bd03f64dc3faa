//! User-facing data model: server configurations, tools, sessions and tool results.

use crate::types::{Content, Implementation, ToolDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

pub use crate::error::{McpError, Result};

/// Per-request timeout used when neither the server nor the runner sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How to install and start one MCP server inside a sandbox.
///
/// # Example
///
/// ```
/// use e2b_mcp::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::new("filesystem", "npx -y @modelcontextprotocol/server-filesystem /tmp")
///     .with_install_command("npm install -g npx")
///     .with_env("NODE_ENV", "production")
///     .with_timeout(Duration::from_secs(60));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub install_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Per-request timeout; the runner's default applies when unset.
    #[serde(
        rename = "timeout_secs",
        with = "duration_secs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            install_commands: Vec::new(),
            env: BTreeMap::new(),
            timeout: None,
            description: None,
        }
    }

    pub fn with_install_command(mut self, command: impl Into<String>) -> Self {
        self.install_commands.push(command.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Checks the invariants the runner relies on.
    ///
    /// Names key the runner's registry and appear in qualified tool names, so
    /// they are restricted to ASCII alphanumerics, `-` and `_`.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(McpError::InvalidConfig("server name must not be empty".into()));
        }
        if let Some(bad) = self
            .name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(McpError::InvalidConfig(format!(
                "server name '{}' contains invalid character '{}'",
                self.name, bad
            )));
        }
        if self.command.trim().is_empty() {
            return Err(McpError::InvalidConfig(format!(
                "server '{}' has an empty command",
                self.name
            )));
        }
        if self.install_commands.iter().any(|c| c.trim().is_empty()) {
            return Err(McpError::InvalidConfig(format!(
                "server '{}' has an empty install command",
                self.name
            )));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(McpError::InvalidConfig(format!(
                "server '{}' has a zero timeout",
                self.name
            )));
        }
        Ok(())
    }
}

/// A tool exposed by an MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
    pub server_name: String,
}

impl Tool {
    /// Builds a tool from its `tools/list` description.
    ///
    /// Servers may omit `inputSchema`; an empty object schema stands in.
    pub fn from_definition(definition: ToolDefinition, server_name: &str) -> Self {
        Self {
            name: definition.name,
            description: definition.description,
            input_schema: definition
                .input_schema
                .unwrap_or_else(|| json!({ "type": "object" })),
            server_name: server_name.to_string(),
        }
    }

    /// `server.tool`, unique across every server registered with a runner.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.server_name, self.name)
    }
}

/// A snapshot of a live connection to a sandboxed MCP server.
///
/// The runner owns the connection itself; a `Session` value only describes it
/// and is safe to clone, log or serialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub server_name: String,
    pub sandbox_id: String,
    pub protocol_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Implementation>,
    pub tools: Vec<Tool>,
}

impl Session {
    pub fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tool(name).is_some()
    }
}

/// The outcome of a `tools/call`.
///
/// A server reports tool-level failures in-band with `isError`; those arrive
/// here with `is_error` set rather than as an `McpError`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    /// All text parts, joined by newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(Content::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
