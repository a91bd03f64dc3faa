// src/network_adapter/trait.rs
use crate::error::Result;
use async_trait::async_trait;

/// A message-based transport to one MCP server.
///
/// `recv` returns `Ok(None)` once the peer has closed its side.
#[async_trait]
pub trait NetworkAdapter: Send {
    async fn send(&mut self, msg: &str) -> Result<()>;
    async fn recv(&mut self) -> Result<Option<String>>;
}

/// A type-erased adapter, as handed out by sandbox providers.
pub type BoxedAdapter = Box<dyn NetworkAdapter>;

#[async_trait]
impl NetworkAdapter for BoxedAdapter {
    async fn send(&mut self, msg: &str) -> Result<()> {
        (**self).send(msg).await
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        (**self).recv().await
    }
}
