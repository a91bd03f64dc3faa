//! The sandbox boundary: where MCP server processes actually run.
//!
//! A `SandboxProvider` turns a `ServerConfig` into a running server and hands
//! back a message adapter wired to the server's stdio plus a handle that owns
//! the sandbox's lifetime. The runner never sees how isolation is achieved.

pub mod local;
pub mod memory;

pub use local::LocalSandboxProvider;
pub use memory::{InMemorySandboxProvider, StubServer, ToolHandler};

use crate::error::Result;
use crate::models::ServerConfig;
use crate::network_adapter::BoxedAdapter;
use async_trait::async_trait;

/// Owns one sandbox; terminating it stops the server inside.
#[async_trait]
pub trait SandboxHandle: Send {
    fn id(&self) -> &str;

    /// Stops the server and releases the sandbox. Calling it twice is a no-op.
    async fn terminate(&mut self) -> Result<()>;
}

/// A freshly launched server: its stdio adapter and its sandbox.
pub struct SandboxProcess {
    pub adapter: BoxedAdapter,
    pub handle: Box<dyn SandboxHandle>,
}

impl SandboxProcess {
    pub fn sandbox_id(&self) -> &str {
        self.handle.id()
    }
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Prepares a sandbox for `config` (running its install commands) and starts the server.
    async fn launch(&self, config: &ServerConfig) -> Result<SandboxProcess>;

    /// Whether this provider needs `E2B_API_KEY` to create sandboxes.
    fn requires_api_key(&self) -> bool {
        false
    }

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}
