//! Defines the internal `ClientSession` that owns the connection's background task.

use crate::{
    error::{McpError, Result},
    network_adapter::NetworkAdapter,
    protocol::ProtocolConnection,
    types::{ErrorData, ErrorResponse, JSONRPCResponse, RequestId, Response, JSONRPC_VERSION, METHOD_NOT_FOUND},
};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

// --- Type Aliases ---
pub(crate) type ResponseResult = Result<Value>;
pub(crate) type ResponseSender = oneshot::Sender<ResponseResult>;
pub(crate) type PendingRequestMap = Arc<Mutex<HashMap<RequestId, ResponseSender>>>;
pub(crate) type NotificationHandler = Arc<dyn Fn(Value) + Send + Sync>;
pub(crate) type NotificationHandlerMap = Arc<DashMap<String, NotificationHandler>>;

/// A message queued by the `McpClient` for the background task to write.
pub(crate) enum Outgoing {
    /// A request whose response is routed back through the sender.
    Request {
        id: RequestId,
        payload: Value,
        responder: ResponseSender,
    },
    /// A fire-and-forget notification.
    Notification(Value),
}

pub(crate) struct ClientSession<A: NetworkAdapter> {
    server_name: String,
    connection: ProtocolConnection<A>,
    pending_requests: PendingRequestMap,
    notification_handlers: NotificationHandlerMap,
    outgoing: mpsc::Receiver<Outgoing>,
}

impl<A: NetworkAdapter + 'static> ClientSession<A> {
    pub(crate) fn new(
        server_name: String,
        connection: ProtocolConnection<A>,
        pending_requests: PendingRequestMap,
        notification_handlers: NotificationHandlerMap,
        outgoing: mpsc::Receiver<Outgoing>,
    ) -> Self {
        Self {
            server_name,
            connection,
            pending_requests,
            notification_handlers,
            outgoing,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                Some(message) = self.outgoing.recv() => {
                    let payload = match message {
                        Outgoing::Request { id, payload, responder } => {
                            self.pending_requests.lock().await.insert(id, responder);
                            payload
                        }
                        Outgoing::Notification(payload) => payload,
                    };
                    if let Err(e) = self.connection.send_serializable(payload).await {
                        warn!(server = %self.server_name, error = %e, "Error writing message to server");
                        break;
                    }
                },
                read_result = self.connection.recv_json() => {
                    match read_result {
                        Ok(Some(raw_message)) => self.handle_incoming(raw_message).await,
                        Ok(None) => {
                            debug!(server = %self.server_name, "Connection closed by server");
                            break;
                        }
                        Err(e) => {
                            warn!(server = %self.server_name, error = %e, "Error reading message from server");
                            break;
                        }
                    }
                },
            }
        }

        // Dropping the senders wakes every waiter with `ChannelClosed`.
        self.pending_requests.lock().await.clear();
    }

    async fn handle_incoming(&mut self, raw_message: Value) {
        let has_id = raw_message.get("id").is_some();
        let has_method = raw_message.get("method").is_some();
        match (has_id, has_method) {
            (true, true) => self.handle_server_request(raw_message).await,
            (true, false) => Self::handle_response(raw_message, &self.pending_requests).await,
            (false, true) => self.handle_notification(raw_message),
            (false, false) => debug!(server = %self.server_name, "Ignoring message without id or method"),
        }
    }

    async fn handle_response(raw_message: Value, pending_requests: &PendingRequestMap) {
        let Ok(id) = serde_json::from_value::<RequestId>(raw_message["id"].clone()) else {
            return;
        };
        let Some(sender) = pending_requests.lock().await.remove(&id) else {
            debug!(?id, "Response for unknown or expired request");
            return;
        };
        let response: std::result::Result<JSONRPCResponse<Value>, _> =
            serde_json::from_value(raw_message);
        let result = match response {
            Ok(JSONRPCResponse::Success(success)) => Ok(success.result),
            Ok(JSONRPCResponse::Error(err)) => Err(McpError::from(err.error)),
            Err(e) => Err(McpError::Protocol(format!("Malformed response: {e}"))),
        };
        let _ = sender.send(result);
    }

    /// Answers requests the server sends to us. Only `ping` is supported.
    async fn handle_server_request(&mut self, raw_message: Value) {
        let Ok(id) = serde_json::from_value::<RequestId>(raw_message["id"].clone()) else {
            return;
        };
        let method = raw_message["method"].as_str().unwrap_or_default();
        let sent = if method == "ping" {
            self.connection
                .send_serializable(Response {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    id,
                    result: json!({}),
                })
                .await
        } else {
            debug!(server = %self.server_name, method, "Rejecting unsupported server request");
            self.connection
                .send_serializable(ErrorResponse {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    id,
                    error: ErrorData {
                        code: METHOD_NOT_FOUND,
                        message: format!("Method '{method}' is not supported by this client"),
                        data: None,
                    },
                })
                .await
        };
        if let Err(e) = sent {
            warn!(server = %self.server_name, error = %e, "Failed to answer server request");
        }
    }

    fn handle_notification(&self, raw_message: Value) {
        let Some(method) = raw_message.get("method").and_then(Value::as_str) else {
            return;
        };
        if let Some(handler) = self.notification_handlers.get(method) {
            let handler = handler.clone();
            let params = raw_message.get("params").cloned().unwrap_or(Value::Null);

            tokio::spawn(async move {
                (handler)(params);
            });
        } else {
            debug!(server = %self.server_name, method, "Received unhandled notification");
        }
    }
}
