//! Virtual connector that exposes the code executor as an MCP server.
//!
//! Registering code mode as an ordinary session lets callers list and call
//! `execute_code` and `search_tools` the same way they use any other server.
//! Nothing goes over a wire; requests are answered in-process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{encode, not_connected, Connector};
use crate::error::{McpError, McpResult, TransportKind};
use crate::executor::{CodeExecutor, DetailLevel, ToolBridge};
use crate::protocol::{
    CallToolParams, CallToolResult, JsonRpcError, ToolContent, INVALID_PARAMS, METHOD_NOT_FOUND,
    PROTOCOL_VERSION,
};

/// Session name under which code mode is registered.
pub const CODE_MODE_SERVER: &str = "code_mode";

#[derive(Deserialize)]
struct ExecuteArgs {
    code: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Deserialize)]
struct SearchArgs {
    #[serde(default)]
    query: String,
    #[serde(default)]
    detail: Option<String>,
}

pub struct CodeModeConnector {
    executor: Arc<dyn CodeExecutor>,
    bridge: ToolBridge,
    default_timeout_ms: u64,
    connected: AtomicBool,
}

impl CodeModeConnector {
    pub fn new(executor: Arc<dyn CodeExecutor>, bridge: ToolBridge, default_timeout_ms: u64) -> Self {
        Self { executor, bridge, default_timeout_ms, connected: AtomicBool::new(false) }
    }

    fn tool_list() -> Value {
        json!({
            "tools": [
                {
                    "name": "execute_code",
                    "description": "Run code with search_tools() and call_tool() available for every connected server",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "code": { "type": "string" },
                            "timeout_ms": { "type": "integer", "minimum": 1 }
                        },
                        "required": ["code"]
                    }
                },
                {
                    "name": "search_tools",
                    "description": "Fuzzy-search tools across connected servers",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "query": { "type": "string" },
                            "detail": { "type": "string", "enum": ["names", "descriptions", "full"] }
                        }
                    }
                }
            ]
        })
    }

    async fn call(&self, params: CallToolParams) -> McpResult<CallToolResult> {
        let args = Value::Object(params.arguments.unwrap_or_default().into_iter().collect());
        match params.name.as_str() {
            "execute_code" => {
                let args: ExecuteArgs = serde_json::from_value(args).map_err(invalid_params)?;
                let timeout_ms = args.timeout_ms.unwrap_or(self.default_timeout_ms);
                let outcome = self.executor.execute(&args.code, timeout_ms).await;
                let is_error = !outcome.is_success();
                let structured = encode(TransportKind::CodeMode, "execute_code result", &outcome)?;
                Ok(CallToolResult {
                    content: vec![ToolContent::Text { text: structured.to_string() }],
                    structured_content: Some(structured),
                    is_error: Some(is_error),
                })
            }
            "search_tools" => {
                let args: SearchArgs = serde_json::from_value(args).map_err(invalid_params)?;
                let detail = match args.detail.as_deref() {
                    Some(detail) => detail.parse()?,
                    None => DetailLevel::default(),
                };
                let hits = Value::Array(self.bridge.search(&args.query, detail));
                Ok(CallToolResult {
                    content: vec![ToolContent::Text { text: hits.to_string() }],
                    structured_content: Some(json!({ "tools": hits })),
                    is_error: None,
                })
            }
            other => Err(McpError::Protocol(JsonRpcError::new(
                METHOD_NOT_FOUND,
                format!("unknown tool '{}'", other),
            ))),
        }
    }
}

fn invalid_params(e: serde_json::Error) -> McpError {
    McpError::Protocol(JsonRpcError::new(INVALID_PARAMS, e.to_string()))
}

#[async_trait]
impl Connector for CodeModeConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::CodeMode
    }

    async fn connect(&self) -> McpResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> McpResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.executor.cleanup().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        if !self.is_connected() {
            return Err(not_connected(self.kind()));
        }
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": CODE_MODE_SERVER, "version": env!("CARGO_PKG_VERSION") },
                "instructions": format!("Code runs in the {} executor.", self.executor.name())
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(Self::tool_list()),
            "tools/call" => {
                let params: CallToolParams =
                    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(invalid_params)?;
                encode(TransportKind::CodeMode, "tools/call", &self.call(params).await?)
            }
            other => Err(McpError::Protocol(JsonRpcError::new(
                METHOD_NOT_FOUND,
                format!("code mode does not support '{}'", other),
            ))),
        }
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> McpResult<()> {
        if !self.is_connected() {
            return Err(not_connected(self.kind()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmLimits;
    use crate::error::ErrorKind;
    use crate::executor::VmExecutor;
    use crate::session::SessionMap;
    use std::collections::HashMap;

    fn connector() -> CodeModeConnector {
        let bridge = ToolBridge::new(SessionMap::default());
        let executor = Arc::new(VmExecutor::new(bridge.clone(), VmLimits::default()));
        CodeModeConnector::new(executor, bridge, 1_000)
    }

    #[tokio::test]
    async fn test_requires_connect() {
        let connector = connector();
        let err = connector.list_tools().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_handshake_and_tools() {
        let connector = connector();
        connector.connect().await.unwrap();
        let info = connector.initialize().await.unwrap();
        assert_eq!(info.server_info.name, CODE_MODE_SERVER);

        let names: Vec<_> = connector.list_tools().await.unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["execute_code", "search_tools"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_execute_code_tool() {
        let connector = connector();
        connector.connect().await.unwrap();

        let mut args = HashMap::new();
        args.insert("code".to_string(), json!("40 + 2"));
        let result = connector.call_tool("execute_code", Some(args)).await.unwrap();
        assert!(!result.is_error());
        assert_eq!(result.structured_content.unwrap()["result"], 42);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_protocol_error() {
        let connector = connector();
        connector.connect().await.unwrap();
        let err = connector.call_tool("rm_rf", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
