//! Run MCP (Model Context Protocol) servers inside sandboxes.
//!
//! Register servers with an [`E2bMcpRunner`], start sessions to launch them in
//! a sandbox, then list and call their tools. Sandboxes come from a
//! [`sandbox::SandboxProvider`]; the crate ships a local-process provider and
//! an in-memory one for tests.

pub mod client;
pub mod config;
pub mod error;
pub mod integration;
pub mod models;
pub mod network_adapter;
pub mod protocol;
pub mod runner;
pub mod sandbox;
pub mod types;
pub mod version;

pub use error::Result;
pub use models::{McpError, ServerConfig, Session, Tool};
pub use runner::E2bMcpRunner;
pub use version::VERSION;
