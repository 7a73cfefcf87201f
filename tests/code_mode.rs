//! Code mode integration tests.
//!
//! Scripts run in the embedded VM against in-memory servers registered with
//! a session manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mcpfleet::config::VmLimits;
use mcpfleet::{
    ClientOptions, CodeExecutor, Connector, ConnectorFactory, ErrorKind, McpConfig, McpResult, NoopTelemetry,
    ServerConfig, SessionManager, ToolBridge, TransportKind, VmExecutor, CODE_MODE_SERVER,
};
use serde_json::{json, Value};

/// Server exposing `add` and `shout`, plus a shared `status` tool.
struct MathConnector {
    name: String,
    connected: AtomicBool,
}

#[async_trait]
impl Connector for MathConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn connect(&self) -> McpResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let params = params.unwrap_or(Value::Null);
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": {} },
                "serverInfo": { "name": self.name }
            })),
            "tools/list" => Ok(json!({
                "tools": [
                    { "name": format!("{}_add", self.name), "description": "Add two integers",
                      "inputSchema": { "type": "object", "required": ["a", "b"] } },
                    { "name": "status", "description": "Server status", "inputSchema": { "type": "object" } }
                ]
            })),
            "tools/call" => {
                let args = &params["arguments"];
                match params["name"].as_str() {
                    Some("status") => Ok(json!({ "content": [{ "type": "text", "text": format!("{} ok", self.name) }] })),
                    Some(_) => match (args["a"].as_i64(), args["b"].as_i64()) {
                        (Some(a), Some(b)) => Ok(json!({
                            "content": [{ "type": "text", "text": (a + b).to_string() }]
                        })),
                        _ => Ok(json!({
                            "content": [{ "type": "text", "text": "a and b are required" }],
                            "isError": true
                        })),
                    },
                    None => Ok(json!({ "content": [] })),
                }
            }
            _ => Ok(json!({})),
        }
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> McpResult<()> {
        Ok(())
    }
}

struct MathFactory;

impl ConnectorFactory for MathFactory {
    fn create(&self, config: &ServerConfig) -> McpResult<Arc<dyn Connector>> {
        Ok(Arc::new(MathConnector { name: config.name.clone(), connected: AtomicBool::new(false) }))
    }
}

async fn connected_manager() -> SessionManager {
    let config = McpConfig::new()
        .add_server(ServerConfig::http("math", "http://math.invalid/mcp"))
        .add_server(ServerConfig::http("stats", "http://stats.invalid/mcp"));
    let manager = SessionManager::builder(config)
        .options(ClientOptions::default().with_code_mode())
        .factory(Arc::new(MathFactory))
        .telemetry(Arc::new(NoopTelemetry))
        .build();
    let report = manager.create_all_sessions().await;
    assert!(report.is_complete(), "{:?}", report.failures);
    manager
}

// ============================================================================
// Basics
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_return_two_plus_two() {
    let manager = connected_manager().await;
    let result = manager.execute_code("return 2+2", Some(1_000)).await.unwrap();

    assert_eq!(result.result, Some(json!(4)));
    assert!(result.error.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_busy_loop_times_out() {
    let manager = connected_manager().await;
    let started = Instant::now();
    let result = manager.execute_code("loop { }", Some(100)).await.unwrap();

    assert!(result.result.is_none());
    assert!(result.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_logs_survive_errors() {
    let manager = connected_manager().await;
    let result = manager
        .execute_code(r#"print("before"); throw "bad input";"#, Some(1_000))
        .await
        .unwrap();

    assert_eq!(result.logs, vec!["before".to_string()]);
    assert_eq!(result.error.as_deref(), Some("bad input"));
    assert!(result.execution_time_ms < 1_000);
}

// ============================================================================
// Bridge
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_call_tool_from_script() {
    let manager = connected_manager().await;
    let result = manager
        .execute_code(r#"let sum = call_tool("math", "math_add", #{ a: 40, b: 2 }); sum * 10"#, Some(2_000))
        .await
        .unwrap();
    assert_eq!(result.result, Some(json!(420)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_tool_resolves_unique_owner() {
    let manager = connected_manager().await;
    let result = manager
        .execute_code(r#"call_tool("stats_add", #{ a: 1, b: 1 })"#, Some(2_000))
        .await
        .unwrap();
    assert_eq!(result.result, Some(json!(2)));

    // `status` exists on both servers.
    let result = manager.execute_code(r#"call_tool("status", #{})"#, Some(2_000)).await.unwrap();
    assert!(result.error.unwrap().contains("several servers"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tool_error_is_catchable() {
    let manager = connected_manager().await;
    let code = r#"
        try {
            call_tool("math", "math_add", #{ a: 1 })
        } catch (err) {
            "caught: " + err
        }
    "#;
    let result = manager.execute_code(code, Some(2_000)).await.unwrap();
    let text = result.result.unwrap();
    assert!(text.as_str().unwrap().starts_with("caught:"));
    assert!(text.as_str().unwrap().contains("a and b are required"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_search_tools_from_script() {
    let manager = connected_manager().await;
    let code = r#"
        let names = search_tools("", "names");
        let full = search_tools("add");
        #{ count: names.len(), has_desc: names[0].contains("description"), schema: full[0].inputSchema["type"] }
    "#;
    let result = manager.execute_code(code, Some(2_000)).await.unwrap();
    assert_eq!(result.result, Some(json!({ "count": 4, "has_desc": false, "schema": "object" })));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_list_servers_excludes_code_mode() {
    let manager = connected_manager().await;
    assert!(manager.active_sessions().contains(&CODE_MODE_SERVER.to_string()));

    let result = manager.execute_code("list_servers()", Some(1_000)).await.unwrap();
    assert_eq!(result.result, Some(json!(["math", "stats"])));
}

// ============================================================================
// Code mode as a session
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_execute_code_tool_on_code_mode_session() {
    let manager = connected_manager().await;
    let mut args = std::collections::HashMap::new();
    args.insert("code".to_string(), json!(r#"call_tool("math", "math_add", #{ a: 2, b: 3 })"#));

    let result = manager.call_tool(CODE_MODE_SERVER, "execute_code", Some(args)).await.unwrap();
    assert!(!result.is_error());
    assert_eq!(result.structured_content.unwrap()["result"], 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_separate_executors_are_independent() {
    let manager = connected_manager().await;
    let bridge: ToolBridge = manager.bridge();
    let a = VmExecutor::new(bridge.clone(), VmLimits::default());
    let b = VmExecutor::new(bridge, VmLimits::default());

    let (slow, fast) = tokio::join!(a.execute("loop { }", 300), b.execute("1 + 1", 1_000));
    assert!(slow.error.unwrap().contains("timed out"));
    assert_eq!(fast.result, Some(json!(2)));
    assert!(fast.execution_time_ms < 300);
}
