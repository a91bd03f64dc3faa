//! Defines the protocol layer for handling MCP message serialization and deserialization.
//!
//! This layer sits on top of the `NetworkAdapter` and provides a strongly-typed interface
//! for sending and receiving MCP messages. It is responsible for all `serde_json`
//! operations, keeping the client logic focused on request bookkeeping.

use crate::error::Result;
use crate::network_adapter::NetworkAdapter;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// A connection that handles MCP protocol logic over a generic `NetworkAdapter`.
pub struct ProtocolConnection<A: NetworkAdapter> {
    adapter: A,
}

impl<A: NetworkAdapter> ProtocolConnection<A> {
    /// Creates a new `ProtocolConnection` that will use the given adapter for communication.
    pub fn new(adapter: A) -> Self {
        Self { adapter }
    }

    /// Serializes a message struct into a JSON string and sends it via the adapter.
    pub async fn send_serializable<T: Serialize + Send + Sync>(&mut self, msg: T) -> Result<()> {
        let json_string = serde_json::to_string(&msg)?;
        self.adapter.send(&json_string).await
    }

    /// Receives the next JSON object from the adapter.
    ///
    /// Servers launched through package managers often print banners or
    /// progress lines on stdout before speaking JSON-RPC. Anything that is not
    /// a JSON object is skipped.
    pub async fn recv_json(&mut self) -> Result<Option<Value>> {
        loop {
            let Some(line) = self.adapter.recv().await? else {
                return Ok(None);
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) if value.is_object() => return Ok(Some(value)),
                _ => debug!(line = trimmed, "Skipping non-JSON-RPC output"),
            }
        }
    }
}
