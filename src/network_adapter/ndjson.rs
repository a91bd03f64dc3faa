// src/network_adapter/ndjson.rs
use super::r#trait::NetworkAdapter;
use crate::error::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

/// Newline-delimited JSON framing over any byte pipe.
///
/// This is the stdio framing MCP servers use: one JSON-RPC message per line.
/// The pipe is usually a sandboxed child's stdout/stdin pair.
///
/// Lines that are not valid UTF-8 are decoded lossily rather than failing the
/// connection; they are never valid JSON-RPC and get skipped further up.
///
/// `recv` is cancel-safe: a partially received line is kept in `partial` and
/// completed by the next call, so the adapter can sit in a `tokio::select!`.
pub struct NdjsonAdapter<R, W> {
    reader: BufReader<R>,
    writer: W,
    partial: Vec<u8>,
}

impl<R, W> NdjsonAdapter<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            partial: Vec::new(),
        }
    }
}

#[async_trait]
impl<R, W> NetworkAdapter for NdjsonAdapter<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: &str) -> Result<()> {
        let mut frame = Vec::with_capacity(msg.len() + 1);
        frame.extend_from_slice(msg.as_bytes());
        frame.push(b'\n');
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.partial).await?;
        if read == 0 && self.partial.is_empty() {
            return Ok(None);
        }
        let mut bytes = std::mem::take(&mut self.partial);
        if bytes.ends_with(b"\n") {
            bytes.pop();
        }
        if bytes.ends_with(b"\r") {
            bytes.pop();
        }
        match String::from_utf8(bytes) {
            Ok(line) => Ok(Some(line)),
            Err(e) => {
                debug!(error = %e, "Received a line that is not valid UTF-8");
                Ok(Some(String::from_utf8_lossy(e.as_bytes()).into_owned()))
            }
        }
    }
}
