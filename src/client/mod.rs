//! Defines the MCP client used to drive servers running inside sandboxes.

mod client;
mod session;

pub use client::{McpClient, CLIENT_NAME};
