//! End-to-end tests for the runner against in-memory sandboxes.
//!
//! Each test registers scripted MCP servers with an `InMemorySandboxProvider`
//! and drives them through the public `E2bMcpRunner` API.

use e2b_mcp::config::RunnerConfig;
use e2b_mcp::models::ToolResult;
use e2b_mcp::sandbox::{InMemorySandboxProvider, StubServer};
use e2b_mcp::types::Content;
use e2b_mcp::{E2bMcpRunner, McpError, ServerConfig};
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn with_timeout<F: Future<Output = ()>>(test_body: F) {
    tokio::time::timeout(Duration::from_secs(6), test_body)
        .await
        .expect("Test timed out after 6 seconds");
}

fn calculator() -> StubServer {
    StubServer::new("calculator")
        .with_tool(
            "add",
            "Adds two numbers",
            json!({
                "type": "object",
                "properties": { "a": { "type": "number" }, "b": { "type": "number" } },
                "required": ["a", "b"]
            }),
        )
        .with_tool("divide", "Divides a by b", json!({ "type": "object" }))
        .with_handler(|name, args| {
            let a = args["a"].as_f64().unwrap_or_default();
            let b = args["b"].as_f64().unwrap_or_default();
            match name {
                "add" => Ok(ToolResult {
                    content: vec![Content::text((a + b).to_string())],
                    is_error: false,
                }),
                "divide" if b == 0.0 => Err(anyhow::anyhow!("division by zero")),
                "divide" => Ok(ToolResult {
                    content: vec![Content::text((a / b).to_string())],
                    is_error: false,
                }),
                other => Err(anyhow::anyhow!("unexpected tool {other}")),
            }
        })
}

async fn setup(provider: InMemorySandboxProvider, config: RunnerConfig) -> E2bMcpRunner {
    init_tracing();
    let runner = E2bMcpRunner::new(config, provider).unwrap();
    runner
        .add_server(ServerConfig::new("calculator", "python -m calculator"))
        .await
        .unwrap();
    runner
}

#[tokio::test]
async fn test_session_discovers_tools() {
    with_timeout(async {
        let provider = InMemorySandboxProvider::new().with_server("calculator", calculator());
        let runner = setup(provider, RunnerConfig::default()).await;

        let session = runner.start_session("calculator").await.unwrap();
        assert_eq!(session.server_name, "calculator");
        assert!(session.sandbox_id.starts_with("memory-"));
        assert_eq!(session.protocol_version, "2024-11-05");
        assert_eq!(session.server_info.as_ref().unwrap().name, "calculator");

        let names: Vec<&str> = session.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["add", "divide"]);
        assert_eq!(session.tool("add").unwrap().qualified_name(), "calculator.add");
        assert_eq!(
            runner.list_tools(&session.id).await.unwrap(),
            session.tools
        );
    })
    .await;
}

#[tokio::test]
async fn test_call_tool_round_trip() {
    with_timeout(async {
        let provider = InMemorySandboxProvider::new().with_server("calculator", calculator());
        let runner = setup(provider, RunnerConfig::default()).await;
        let session = runner.start_session("calculator").await.unwrap();

        let result = runner
            .call_tool(&session.id, "add", json!({ "a": 2, "b": 3 }))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.text(), "5");

        // Several calls on one session reuse the same connection.
        let result = runner
            .call_tool(&session.id, "divide", json!({ "a": 9, "b": 3 }))
            .await
            .unwrap();
        assert_eq!(result.text(), "3");
    })
    .await;
}

#[tokio::test]
async fn test_tool_failure_is_reported_in_band() {
    with_timeout(async {
        let provider = InMemorySandboxProvider::new().with_server("calculator", calculator());
        let runner = setup(provider, RunnerConfig::default()).await;
        let session = runner.start_session("calculator").await.unwrap();

        let result = runner
            .call_tool(&session.id, "divide", json!({ "a": 1, "b": 0 }))
            .await
            .unwrap();
        assert!(result.is_error);
        assert_eq!(result.text(), "division by zero");
    })
    .await;
}

#[tokio::test]
async fn test_unknown_tool_is_rejected_before_the_call() {
    with_timeout(async {
        let provider = InMemorySandboxProvider::new().with_server("calculator", calculator());
        let runner = setup(provider, RunnerConfig::default()).await;
        let session = runner.start_session("calculator").await.unwrap();

        let err = runner
            .call_tool(&session.id, "multiply", json!({}))
            .await
            .unwrap_err();
        match err {
            McpError::ToolNotFound { server, tool } => {
                assert_eq!(server, "calculator");
                assert_eq!(tool, "multiply");
            }
            other => panic!("Expected ToolNotFound, got {other:?}"),
        }
    })
    .await;
}

#[tokio::test]
async fn test_close_session_terminates_sandbox() {
    with_timeout(async {
        let provider = InMemorySandboxProvider::new().with_server("calculator", calculator());
        let runner = setup(provider.clone(), RunnerConfig::default()).await;

        let session = runner.start_session("calculator").await.unwrap();
        assert_eq!(provider.live_sandboxes(), 1);
        assert_eq!(runner.list_sessions().await.len(), 1);

        runner.close_session(&session.id).await.unwrap();
        assert_eq!(provider.live_sandboxes(), 0);
        assert!(runner.list_sessions().await.is_empty());
        assert!(matches!(
            runner.session(&session.id).await,
            Err(McpError::SessionNotFound(_))
        ));
    })
    .await;
}

#[tokio::test]
async fn test_execute_tool_always_closes_its_session() {
    with_timeout(async {
        let provider = InMemorySandboxProvider::new().with_server("calculator", calculator());
        let runner = setup(provider.clone(), RunnerConfig::default()).await;

        let result = runner
            .execute_tool("calculator", "add", json!({ "a": 1, "b": 1 }))
            .await
            .unwrap();
        assert_eq!(result.text(), "2");

        let err = runner
            .execute_tool("calculator", "missing", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ToolNotFound { .. }));

        assert_eq!(provider.launched_sandboxes(), 2);
        assert_eq!(provider.live_sandboxes(), 0);
        assert!(runner.list_sessions().await.is_empty());
    })
    .await;
}

#[tokio::test]
async fn test_discover_tools_uses_a_throwaway_session() {
    with_timeout(async {
        let provider = InMemorySandboxProvider::new().with_server("calculator", calculator());
        let runner = setup(provider.clone(), RunnerConfig::default()).await;

        let tools = runner.discover_tools("calculator").await.unwrap();
        assert_eq!(tools.len(), 2);
        assert!(tools.iter().all(|t| t.server_name == "calculator"));
        assert_eq!(provider.live_sandboxes(), 0);
    })
    .await;
}

#[tokio::test]
async fn test_session_limit_is_enforced() {
    with_timeout(async {
        let provider = InMemorySandboxProvider::new().with_server("calculator", calculator());
        let runner = setup(provider, RunnerConfig::default().with_max_sessions(2)).await;

        let first = runner.start_session("calculator").await.unwrap();
        let _second = runner.start_session("calculator").await.unwrap();
        assert!(matches!(
            runner.start_session("calculator").await,
            Err(McpError::SessionLimit(2))
        ));

        runner.close_session(&first.id).await.unwrap();
        assert!(runner.start_session("calculator").await.is_ok());
    })
    .await;
}

#[tokio::test]
async fn test_unresponsive_server_times_out_and_is_cleaned_up() {
    with_timeout(async {
        init_tracing();
        let provider = InMemorySandboxProvider::new().with_server(
            "slow",
            StubServer::new("slow").with_response_delay(Duration::from_secs(2)),
        );
        let runner = E2bMcpRunner::new(RunnerConfig::default(), provider.clone()).unwrap();
        runner
            .add_server(ServerConfig::new("slow", "sleep 100").with_timeout(Duration::from_millis(100)))
            .await
            .unwrap();

        let err = runner.start_session("slow").await.unwrap_err();
        assert!(matches!(err, McpError::Timeout(d) if d == Duration::from_millis(100)));
        assert!(err.is_retryable());
        assert_eq!(provider.live_sandboxes(), 0);
        assert!(runner.list_sessions().await.is_empty());
    })
    .await;
}

#[tokio::test]
async fn test_runner_default_timeout_applies() {
    with_timeout(async {
        let provider = InMemorySandboxProvider::new().with_server(
            "slow",
            StubServer::new("slow").with_response_delay(Duration::from_secs(2)),
        );
        let config = RunnerConfig::default().with_default_timeout(Duration::from_millis(50));
        let runner = E2bMcpRunner::new(config, provider).unwrap();
        runner
            .add_server(ServerConfig::new("slow", "sleep 100"))
            .await
            .unwrap();

        let err = runner.start_session("slow").await.unwrap_err();
        assert!(matches!(err, McpError::Timeout(d) if d == Duration::from_millis(50)));
    })
    .await;
}

#[tokio::test]
async fn test_server_without_tools_capability() {
    with_timeout(async {
        let provider = InMemorySandboxProvider::new().with_server(
            "prompts-only",
            calculator().without_tools_capability(),
        );
        let runner = E2bMcpRunner::new(RunnerConfig::default(), provider).unwrap();
        runner
            .add_server(ServerConfig::new("prompts-only", "serve"))
            .await
            .unwrap();

        let session = runner.start_session("prompts-only").await.unwrap();
        assert!(session.tools.is_empty());
        assert!(runner.refresh_tools(&session.id).await.unwrap().is_empty());
    })
    .await;
}

#[tokio::test]
async fn test_removing_a_server_keeps_its_sessions() {
    with_timeout(async {
        let provider = InMemorySandboxProvider::new().with_server("calculator", calculator());
        let runner = setup(provider, RunnerConfig::default()).await;
        let session = runner.start_session("calculator").await.unwrap();

        runner.remove_server("calculator").await.unwrap();
        let result = runner
            .call_tool(&session.id, "add", json!({ "a": 4, "b": 4 }))
            .await
            .unwrap();
        assert_eq!(result.text(), "8");
        assert!(matches!(
            runner.start_session("calculator").await,
            Err(McpError::ServerNotFound(_))
        ));
    })
    .await;
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    with_timeout(async {
        let provider = InMemorySandboxProvider::new()
            .with_server("calculator", calculator())
            .with_server("other", StubServer::new("other"));
        let runner = setup(provider.clone(), RunnerConfig::default()).await;
        runner
            .add_server(ServerConfig::new("other", "serve"))
            .await
            .unwrap();

        runner.start_session("other").await.unwrap();
        runner.start_session("calculator").await.unwrap();
        runner.start_session("calculator").await.unwrap();

        let servers: Vec<String> = runner
            .list_sessions()
            .await
            .into_iter()
            .map(|s| s.server_name)
            .collect();
        assert_eq!(servers, vec!["calculator", "calculator", "other"]);

        runner.shutdown().await;
        assert_eq!(provider.live_sandboxes(), 0);
        assert!(runner.list_sessions().await.is_empty());
    })
    .await;
}

#[tokio::test]
async fn test_tool_list_change_is_picked_up() {
    with_timeout(async {
        let provider = InMemorySandboxProvider::new().with_server(
            "growing",
            calculator().with_tool_added_after_list(
                "multiply",
                "Multiplies a by b",
                json!({ "type": "object" }),
            ),
        );
        let runner = E2bMcpRunner::new(RunnerConfig::default(), provider).unwrap();
        runner
            .add_server(ServerConfig::new("growing", "serve"))
            .await
            .unwrap();

        let session = runner.start_session("growing").await.unwrap();
        assert_eq!(session.tools.len(), 2);

        // The change notification trails the first listing; wait for it to land.
        let mut tools = runner.list_tools(&session.id).await.unwrap();
        while tools.len() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tools = runner.list_tools(&session.id).await.unwrap();
        }
        assert!(tools.iter().any(|t| t.name == "multiply"));
        assert_eq!(runner.session(&session.id).await.unwrap().tools, tools);

        // The stub's handler has no case for the new tool, so it fails in-band
        // rather than being rejected locally as unknown.
        let result = runner
            .call_tool(&session.id, "multiply", json!({ "a": 2, "b": 3 }))
            .await
            .unwrap();
        assert!(result.is_error);
        assert_eq!(result.text(), "unexpected tool multiply");
    })
    .await;
}

#[tokio::test]
async fn test_paginated_tool_list_is_followed() {
    with_timeout(async {
        let server = (0..5).fold(StubServer::new("paged").with_page_size(2), |server, i| {
            server.with_tool(&format!("tool_{i}"), "Numbered", json!({ "type": "object" }))
        });
        let provider = InMemorySandboxProvider::new().with_server("paged", server);
        let runner = E2bMcpRunner::new(RunnerConfig::default(), provider).unwrap();
        runner
            .add_server(ServerConfig::new("paged", "serve"))
            .await
            .unwrap();

        let session = runner.start_session("paged").await.unwrap();
        let names: Vec<&str> = session.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["tool_0", "tool_1", "tool_2", "tool_3", "tool_4"]);
    })
    .await;
}

#[tokio::test]
async fn test_endless_tool_pages_are_a_protocol_error() {
    with_timeout(async {
        let server = (0..65).fold(StubServer::new("endless").with_page_size(1), |server, i| {
            server.with_tool(&format!("tool_{i}"), "Numbered", json!({ "type": "object" }))
        });
        let provider = InMemorySandboxProvider::new().with_server("endless", server);
        let runner = E2bMcpRunner::new(RunnerConfig::default(), provider.clone()).unwrap();
        runner
            .add_server(ServerConfig::new("endless", "serve"))
            .await
            .unwrap();

        let err = runner.start_session("endless").await.unwrap_err();
        assert!(matches!(err, McpError::Protocol(_)), "{err}");
        assert_eq!(provider.live_sandboxes(), 0);
        assert!(runner.list_sessions().await.is_empty());
    })
    .await;
}
