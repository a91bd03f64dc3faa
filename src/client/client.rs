//! Defines the `McpClient` the runner uses to talk to one sandboxed server.

use super::session::{ClientSession, NotificationHandler, NotificationHandlerMap, Outgoing, PendingRequestMap};
use crate::{
    error::{McpError, Result},
    models::{Tool, ToolResult},
    network_adapter::NetworkAdapter,
    protocol::ProtocolConnection,
    types::{
        CallToolParams, ClientCapabilities, Implementation, InitializeRequestParams,
        InitializeResult, ListToolsParams, ListToolsResult, Notification, Request, RequestId,
        LATEST_PROTOCOL_VERSION, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_TOOLS_CALL,
        METHOD_TOOLS_LIST, METHOD_TOOLS_LIST_CHANGED,
    },
    version::VERSION,
};
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Name this crate reports in `clientInfo`.
pub const CLIENT_NAME: &str = "e2b-mcp";

/// Upper bound on `tools/list` pages followed before giving up on a server.
const MAX_TOOL_PAGES: usize = 64;

/// An asynchronous MCP client bound to one server connection.
///
/// The connection is driven by a background task that matches responses to
/// pending requests and dispatches notifications to registered handlers. The
/// task is aborted when the client is dropped.
pub struct McpClient {
    server_name: String,
    timeout: Duration,
    next_request_id: AtomicI64,
    outgoing: mpsc::Sender<Outgoing>,
    pending_requests: PendingRequestMap,
    notification_handlers: NotificationHandlerMap,
    session_handle: JoinHandle<()>,
    init: InitializeResult,
}

impl McpClient {
    /// Starts the connection task and performs the MCP handshake.
    ///
    /// The handshake is `initialize` followed by the
    /// `notifications/initialized` notification. Every request, including
    /// `initialize`, is bounded by `timeout`.
    pub async fn connect<A>(server_name: &str, adapter: A, timeout: Duration) -> Result<Self>
    where
        A: NetworkAdapter + 'static,
    {
        let pending_requests: PendingRequestMap = Arc::new(Mutex::new(HashMap::new()));
        let notification_handlers: NotificationHandlerMap = Arc::new(DashMap::new());
        let (outgoing, outgoing_receiver) = mpsc::channel(32);

        let session = ClientSession::new(
            server_name.to_string(),
            ProtocolConnection::new(adapter),
            Arc::clone(&pending_requests),
            Arc::clone(&notification_handlers),
            outgoing_receiver,
        );
        let session_handle = tokio::spawn(session.run());

        let next_request_id = AtomicI64::new(0);
        let init_params = InitializeRequestParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: CLIENT_NAME.to_string(),
                version: VERSION.to_string(),
            },
        };

        let handshake = Self::round_trip(
            &outgoing,
            &pending_requests,
            RequestId::Num(next_request_id.fetch_add(1, Ordering::SeqCst)),
            METHOD_INITIALIZE,
            init_params,
            timeout,
        )
        .await
        .and_then(|value| Ok(serde_json::from_value::<InitializeResult>(value)?));
        let init = match handshake {
            Ok(init) => init,
            Err(e) => {
                session_handle.abort();
                return Err(e);
            }
        };

        if init.protocol_version != LATEST_PROTOCOL_VERSION {
            warn!(
                server = server_name,
                server_version = %init.protocol_version,
                client_version = LATEST_PROTOCOL_VERSION,
                "Server negotiated a different protocol version"
            );
        }

        let client = Self {
            server_name: server_name.to_string(),
            timeout,
            next_request_id,
            outgoing,
            pending_requests,
            notification_handlers,
            session_handle,
            init,
        };
        client
            .notify(METHOD_INITIALIZED, None::<Value>)
            .await?;

        info!(
            server = server_name,
            server_info = ?client.init.server_info,
            "MCP handshake complete"
        );
        Ok(client)
    }

    pub fn server_info(&self) -> &Implementation {
        &self.init.server_info
    }

    pub fn protocol_version(&self) -> &str {
        &self.init.protocol_version
    }

    pub fn supports_tools(&self) -> bool {
        self.init.capabilities.tools.is_some()
    }

    /// Whether the background connection task is still running.
    pub fn is_connected(&self) -> bool {
        !self.session_handle.is_finished()
    }

    /// Registers a handler for a server notification, replacing any previous one.
    pub fn on_notification<F, P>(&self, method: &str, handler: F)
    where
        F: Fn(P) + Send + Sync + 'static,
        P: DeserializeOwned,
    {
        let method_name = method.to_string();
        let wrapped_handler: NotificationHandler =
            Arc::new(
                move |params: Value| match serde_json::from_value::<P>(params) {
                    Ok(typed_params) => (handler)(typed_params),
                    Err(e) => warn!(
                        method = %method_name,
                        error = %e,
                        "Failed to deserialize notification params"
                    ),
                },
            );

        self.notification_handlers
            .insert(method.to_string(), wrapped_handler);
    }

    /// Registers a handler for `notifications/tools/list_changed`.
    pub fn on_tools_list_changed<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_notification(METHOD_TOOLS_LIST_CHANGED, move |_: Value| handler());
    }

    /// Lists every tool the server exposes, following pagination cursors.
    ///
    /// Servers that do not advertise the `tools` capability get no request.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        if !self.supports_tools() {
            debug!(server = %self.server_name, "Server does not advertise tools");
            return Ok(Vec::new());
        }

        let mut tools = Vec::new();
        let mut cursor = None;
        for _ in 0..MAX_TOOL_PAGES {
            let page: ListToolsResult = self
                .send_request(METHOD_TOOLS_LIST, ListToolsParams { cursor })
                .await?;
            tools.extend(
                page.tools
                    .into_iter()
                    .map(|definition| Tool::from_definition(definition, &self.server_name)),
            );
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
        Err(McpError::Protocol(format!(
            "server '{}' returned more than {MAX_TOOL_PAGES} pages of tools",
            self.server_name
        )))
    }

    /// Executes a tool on the server.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult> {
        let arguments = match arguments {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        self.send_request(
            METHOD_TOOLS_CALL,
            CallToolParams {
                name: name.to_string(),
                arguments,
            },
        )
        .await
    }

    /// Sends a request with a fresh id and deserializes its result.
    async fn send_request<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = RequestId::Num(self.next_request_id.fetch_add(1, Ordering::SeqCst));
        let value = Self::round_trip(
            &self.outgoing,
            &self.pending_requests,
            id,
            method,
            params,
            self.timeout,
        )
        .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn round_trip<P: Serialize>(
        outgoing: &mpsc::Sender<Outgoing>,
        pending_requests: &PendingRequestMap,
        id: RequestId,
        method: &str,
        params: P,
        timeout: Duration,
    ) -> Result<Value> {
        let request = Request::new(id.clone(), method, serde_json::to_value(params)?);
        let payload = serde_json::to_value(request)?;
        let (responder, response) = oneshot::channel();

        // Queueing counts against the timeout too: the writer may be stuck on a full pipe.
        let exchange = async {
            outgoing
                .send(Outgoing::Request {
                    id: id.clone(),
                    payload,
                    responder,
                })
                .await?;
            response.await?
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                pending_requests.lock().await.remove(&id);
                debug!(method, ?id, ?timeout, "Request timed out");
                Err(McpError::Timeout(timeout))
            }
        }
    }

    async fn notify<P: Serialize>(&self, method: &str, params: Option<P>) -> Result<()> {
        let notification = Notification::new(method, params);
        self.outgoing
            .send(Outgoing::Notification(serde_json::to_value(notification)?))
            .await?;
        Ok(())
    }
}

impl Drop for McpClient {
    /// Ensures the background connection task is terminated when the client is dropped.
    fn drop(&mut self) {
        self.session_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Answers the handshake, then never finishes writing another message.
    struct StallingAdapter {
        sends: usize,
        replies: VecDeque<String>,
    }

    #[async_trait]
    impl NetworkAdapter for StallingAdapter {
        async fn send(&mut self, _msg: &str) -> Result<()> {
            self.sends += 1;
            if self.sends > 2 {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<String>> {
            if self.sends > 0 {
                if let Some(reply) = self.replies.pop_front() {
                    return Ok(Some(reply));
                }
            }
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_requests_time_out_while_writer_is_stuck() {
        let adapter = StallingAdapter {
            sends: 0,
            replies: VecDeque::from([r#"{"jsonrpc":"2.0","id":0,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"stuck","version":"1"}}}"#.to_string()]),
        };
        let timeout = Duration::from_millis(100);
        let client = Arc::new(McpClient::connect("stuck", adapter, timeout).await.unwrap());
        assert!(client.supports_tools());

        // More requests than the outgoing queue holds.
        let calls: Vec<_> = (0..40)
            .map(|_| {
                let client = Arc::clone(&client);
                tokio::spawn(async move { client.list_tools().await })
            })
            .collect();

        tokio::time::timeout(Duration::from_secs(2), async {
            for call in calls {
                let err = call.await.unwrap().unwrap_err();
                assert!(matches!(err, McpError::Timeout(d) if d == timeout), "{err}");
            }
        })
        .await
        .expect("requests outlived their timeout");
    }
}
