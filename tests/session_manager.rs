//! Session manager integration tests.
//!
//! In-memory servers are injected through the connector factory; servers
//! configured with any other command go through the real stdio transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcpfleet::{
    Connector, ConnectorFactory, DefaultConnectorFactory, DetailLevel, ErrorKind, McpConfig, McpResult,
    NoopTelemetry, ServerConfig, SessionManager, SessionState, TransportConfig, TransportKind,
};
use serde_json::{json, Value};

const MOCK_COMMAND: &str = "mock-server";

// ============================================================================
// Fixtures
// ============================================================================

/// In-memory server with two tools.
struct MockConnector {
    server: String,
    connected: AtomicBool,
    disconnects: Arc<AtomicUsize>,
    delay: Duration,
}

#[async_trait]
impl Connector for MockConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn connect(&self) -> McpResult<()> {
        tokio::time::sleep(self.delay).await;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": {}, "resources": {} },
                "serverInfo": { "name": self.server, "version": "1.0.0" }
            })),
            "tools/list" => Ok(json!({
                "tools": [
                    {
                        "name": format!("{}_search", self.server),
                        "description": format!("Search {} records", self.server),
                        "inputSchema": { "type": "object", "properties": { "q": { "type": "string" } } }
                    },
                    {
                        "name": "echo",
                        "description": "Echo the arguments back",
                        "inputSchema": { "type": "object" }
                    }
                ]
            })),
            "resources/list" => Ok(json!({
                "resources": [{ "uri": format!("mem://{}/readme", self.server), "name": "readme" }]
            })),
            "tools/call" => {
                let args = params.and_then(|p| p.get("arguments").cloned()).unwrap_or(Value::Null);
                Ok(json!({ "content": [{ "type": "text", "text": args.to_string() }] }))
            }
            _ => Ok(json!({})),
        }
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> McpResult<()> {
        Ok(())
    }
}

/// Mock servers for `MOCK_COMMAND`, real connectors for everything else.
#[derive(Default)]
struct MockFactory {
    created: AtomicUsize,
    disconnects: Arc<AtomicUsize>,
    delay: Duration,
}

impl ConnectorFactory for MockFactory {
    fn create(&self, config: &ServerConfig) -> McpResult<Arc<dyn Connector>> {
        match &config.transport {
            TransportConfig::Stdio { command, .. } if command == MOCK_COMMAND => {
                self.created.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(MockConnector {
                    server: config.name.clone(),
                    connected: AtomicBool::new(false),
                    disconnects: self.disconnects.clone(),
                    delay: self.delay,
                }))
            }
            _ => DefaultConnectorFactory::default().create(config),
        }
    }
}

fn mock(name: &str) -> ServerConfig {
    ServerConfig::stdio(name, MOCK_COMMAND, vec![])
}

fn manager_with(servers: Vec<ServerConfig>, factory: Arc<MockFactory>) -> SessionManager {
    let config = servers.into_iter().fold(McpConfig::new(), McpConfig::add_server);
    SessionManager::builder(config).factory(factory).telemetry(Arc::new(NoopTelemetry)).build()
}

fn manager(names: &[&str]) -> (SessionManager, Arc<MockFactory>) {
    let factory = Arc::new(MockFactory::default());
    let manager = manager_with(names.iter().map(|n| mock(n)).collect(), factory.clone());
    (manager, factory)
}

// ============================================================================
// Single session lifecycle
// ============================================================================

#[tokio::test]
async fn test_create_twice_keeps_one_session() {
    let (manager, factory) = manager(&["alpha"]);

    let first = manager.create_session("alpha").await.unwrap();
    let second = manager.create_session("alpha").await.unwrap();

    assert_eq!(manager.active_sessions(), vec!["alpha".to_string()]);
    assert_eq!(first.state(), SessionState::Closed);
    assert_eq!(second.state(), SessionState::Ready);
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    assert_eq!(factory.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_creates_on_one_name_do_not_leak() {
    let (manager, factory) = manager(&["alpha"]);

    let (a, b) = tokio::join!(manager.create_session("alpha"), manager.create_session("alpha"));
    a.unwrap();
    b.unwrap();

    assert_eq!(manager.active_sessions().len(), 1);
    // Every connector except the surviving one was released.
    assert_eq!(
        factory.disconnects.load(Ordering::SeqCst),
        factory.created.load(Ordering::SeqCst) - 1
    );
}

#[tokio::test]
async fn test_session_caches_metadata() {
    let (manager, _) = manager(&["alpha"]);
    let session = manager.create_session("alpha").await.unwrap();

    assert!(session.is_ready());
    assert_eq!(session.server_info().unwrap().server_info.name, "alpha");
    assert_eq!(session.tools().len(), 2);
    assert_eq!(session.resources()[0].uri, "mem://alpha/readme");
}

#[tokio::test]
async fn test_close_absent_session_is_ok() {
    let (manager, _) = manager(&["alpha"]);
    manager.close_session("alpha").await;
    manager.close_session("never-configured").await;
    assert!(manager.active_sessions().is_empty());
}

#[tokio::test]
async fn test_close_removes_session() {
    let (manager, factory) = manager(&["alpha"]);
    let session = manager.create_session("alpha").await.unwrap();

    manager.close_session("alpha").await;
    manager.close_session("alpha").await;

    assert_eq!(session.state(), SessionState::Closed);
    assert!(manager.get_session("alpha").is_none());
    assert_eq!(factory.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_server_is_config_error() {
    let (manager, _) = manager(&[]);
    let err = manager.create_session("ghost").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.report().starts_with("ConfigError:"));
}

// ============================================================================
// Aggregate operations
// ============================================================================

#[tokio::test]
async fn test_create_all_isolates_failures() {
    let factory = Arc::new(MockFactory::default());
    let servers = vec![
        mock("alpha"),
        mock("bravo"),
        ServerConfig::stdio("broken", "/definitely/not/a/real/binary", vec![]),
        mock("charlie"),
    ];
    let manager = manager_with(servers, factory);

    let report = manager.create_all_sessions().await;

    assert_eq!(report.succeeded, vec!["alpha", "bravo", "charlie"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failure("broken").unwrap().kind(), ErrorKind::Connection);
    assert!(!report.is_complete());
    assert_eq!(manager.active_sessions(), vec!["alpha", "bravo", "charlie"]);
}

#[tokio::test]
async fn test_create_all_runs_concurrently() {
    let factory = Arc::new(MockFactory { delay: Duration::from_millis(200), ..MockFactory::default() });
    let names = ["a", "b", "c", "d", "e"];
    let manager = manager_with(names.iter().map(|n| mock(n)).collect(), factory);

    let started = std::time::Instant::now();
    let report = manager.create_all_sessions().await;

    assert!(report.is_complete());
    assert!(started.elapsed() < Duration::from_millis(900));
}

#[tokio::test]
async fn test_close_all_sessions() {
    let (manager, factory) = manager(&["alpha", "bravo", "charlie"]);
    manager.create_all_sessions().await;

    let report = manager.close_all_sessions().await;

    assert_eq!(report.succeeded.len(), 3);
    assert!(manager.active_sessions().is_empty());
    assert_eq!(factory.disconnects.load(Ordering::SeqCst), 3);
}

// ============================================================================
// Registry mutation
// ============================================================================

#[tokio::test]
async fn test_remove_server_closes_session() {
    let (manager, factory) = manager(&["alpha", "bravo"]);
    manager.create_all_sessions().await;

    assert!(manager.remove_server("alpha").await);

    assert!(!manager.server_names().contains(&"alpha".to_string()));
    assert!(!manager.active_sessions().contains(&"alpha".to_string()));
    assert_eq!(manager.active_sessions(), vec!["bravo"]);
    assert_eq!(factory.disconnects.load(Ordering::SeqCst), 1);
    assert!(!manager.remove_server("alpha").await);
}

#[tokio::test]
async fn test_add_server_then_create() {
    let (manager, _) = manager(&[]);
    manager.add_server(mock("late"));
    assert_eq!(manager.server_names(), vec!["late"]);
    manager.create_session("late").await.unwrap();
    assert_eq!(manager.active_sessions(), vec!["late"]);
}

// ============================================================================
// Tools
// ============================================================================

#[tokio::test]
async fn test_call_tool_routes_to_server() {
    let (manager, _) = manager(&["alpha", "bravo"]);
    manager.create_all_sessions().await;

    let mut args = HashMap::new();
    args.insert("q".to_string(), json!("rust"));
    let result = manager.call_tool("bravo", "bravo_search", Some(args)).await.unwrap();
    assert_eq!(result.text_content(), r#"{"q":"rust"}"#);

    let (server, tool) = manager.find_tool("alpha_search").unwrap();
    assert_eq!(server, "alpha");
    assert_eq!(tool.name, "alpha_search");
}

#[tokio::test]
async fn test_search_tools_detail_levels() {
    let (manager, _) = manager(&["alpha", "bravo"]);
    manager.create_all_sessions().await;

    let names = manager.search_tools("", DetailLevel::Names);
    assert_eq!(names.len(), 4);
    for hit in &names {
        assert!(hit.get("description").is_none());
        assert!(hit.get("inputSchema").is_none());
        assert!(hit.get("server").is_some());
    }

    let descriptions = manager.search_tools("", DetailLevel::Descriptions);
    assert!(descriptions.iter().all(|h| h.get("description").is_some() && h.get("inputSchema").is_none()));

    let full = manager.search_tools("", DetailLevel::Full);
    assert!(full.iter().all(|h| h.get("inputSchema").is_some()));
}

#[tokio::test]
async fn test_search_tools_ranks_matches() {
    let (manager, _) = manager(&["alpha", "bravo"]);
    manager.create_all_sessions().await;

    let hits = manager.search_tools("bravo_search", DetailLevel::Names);
    assert!(!hits.is_empty());
    assert_eq!(hits[0]["name"], "bravo_search");
    assert_eq!(hits[0]["server"], "bravo");
}

#[tokio::test]
async fn test_closed_sessions_leave_search() {
    let (manager, _) = manager(&["alpha", "bravo"]);
    manager.create_all_sessions().await;
    manager.close_session("alpha").await;

    let hits = manager.search_tools("", DetailLevel::Names);
    assert!(hits.iter().all(|h| h["server"] == "bravo"));
}
