//! Transport connectors.
//!
//! A [`Connector`] owns one transport to one server. Transports implement the
//! raw JSON-RPC surface (`request`, `notify`); the MCP operations are provided
//! methods built on top, so every transport gets identical semantics for
//! handshake, pagination and result decoding.
//!
//! Calling anything other than `connect` before a successful `connect`
//! returns [`McpError::InvalidState`].

mod code_mode;
mod http;
mod pending;
mod shutdown;
mod stdio;
mod websocket;

pub use code_mode::{CodeModeConnector, CODE_MODE_SERVER};
pub use http::HttpConnector;
pub use pending::PendingRequests;
pub use shutdown::{terminate_child, TERMINATE_GRACE};
pub use stdio::StdioConnector;
pub use websocket::WebSocketConnector;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::auth::{self, OAuthProvider};
use crate::config::{ServerConfig, TransportConfig};
use crate::error::{McpError, McpResult, TransportKind};
use crate::protocol::{
    CallToolParams, CallToolResult, GetPromptResult, InitializeParams, InitializeResult,
    ListPromptsResult, ListResourcesResult, ListToolsResult, Prompt, ReadResourceResult, Resource,
    Tool,
};

/// Upper bound on pages fetched by one list operation.
const MAX_PAGES: usize = 1_000;

/// Uniform capability surface over one transport.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Transport discriminant.
    fn kind(&self) -> TransportKind;

    /// Open the transport.
    async fn connect(&self) -> McpResult<()>;

    /// Close the transport. Safe to call more than once.
    async fn disconnect(&self) -> McpResult<()>;

    /// Whether `connect` succeeded and the transport is still open.
    fn is_connected(&self) -> bool;

    /// Send a request and wait for its result.
    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value>;

    /// Send a notification.
    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()>;

    /// Run the MCP handshake.
    async fn initialize(&self) -> McpResult<InitializeResult> {
        let params = encode(self.kind(), "initialize", &InitializeParams::default())?;
        let value = self.request("initialize", Some(params)).await?;
        let result: InitializeResult = decode(self.kind(), "initialize", value)?;
        self.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    /// List every tool, following pagination.
    async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor = None;
        for _ in 0..MAX_PAGES {
            let value = self.request("tools/list", cursor_params(cursor.take())).await?;
            let page: ListToolsResult = decode(self.kind(), "tools/list", value)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    /// Invoke a tool.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<HashMap<String, Value>>,
    ) -> McpResult<CallToolResult> {
        let params = CallToolParams { name: name.to_string(), arguments };
        let value = self.request("tools/call", Some(encode(self.kind(), "tools/call", &params)?)).await?;
        decode(self.kind(), "tools/call", value)
    }

    /// List every resource, following pagination.
    async fn list_resources(&self) -> McpResult<Vec<Resource>> {
        let mut resources = Vec::new();
        let mut cursor = None;
        for _ in 0..MAX_PAGES {
            let value = self.request("resources/list", cursor_params(cursor.take())).await?;
            let page: ListResourcesResult = decode(self.kind(), "resources/list", value)?;
            resources.extend(page.resources);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(resources)
    }

    /// Read one resource.
    async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        let value = self.request("resources/read", Some(json!({ "uri": uri }))).await?;
        decode(self.kind(), "resources/read", value)
    }

    /// List every prompt, following pagination.
    async fn list_prompts(&self) -> McpResult<Vec<Prompt>> {
        let mut prompts = Vec::new();
        let mut cursor = None;
        for _ in 0..MAX_PAGES {
            let value = self.request("prompts/list", cursor_params(cursor.take())).await?;
            let page: ListPromptsResult = decode(self.kind(), "prompts/list", value)?;
            prompts.extend(page.prompts);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(prompts)
    }

    /// Render a prompt.
    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> McpResult<GetPromptResult> {
        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = encode(self.kind(), "prompts/get", &arguments)?;
        }
        let value = self.request("prompts/get", Some(params)).await?;
        decode(self.kind(), "prompts/get", value)
    }
}

fn cursor_params(cursor: Option<String>) -> Option<Value> {
    cursor.map(|c| json!({ "cursor": c }))
}

/// Encode an outgoing payload. Failure is reported against the transport.
pub(crate) fn encode<T: Serialize + ?Sized>(kind: TransportKind, what: &str, value: &T) -> McpResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| McpError::connection(kind, format!("could not encode {}: {}", what, e)))
}

/// Serialize a JSON-RPC message for the wire.
pub(crate) fn encode_message<T: Serialize>(kind: TransportKind, method: &str, message: &T) -> McpResult<String> {
    serde_json::to_string(message)
        .map_err(|e| McpError::connection(kind, format!("could not encode {} message: {}", method, e)))
}

/// Decode a result payload; a malformed payload is a handshake-level failure.
pub(crate) fn decode<T: DeserializeOwned>(
    kind: TransportKind,
    method: &str,
    value: Value,
) -> McpResult<T> {
    serde_json::from_value(value)
        .map_err(|e| McpError::connection(kind, format!("malformed {} result: {}", method, e)))
}

/// Bound a transport future by the per-request timeout.
pub(crate) async fn with_timeout<T, F>(timeout_ms: u64, method: &str, future: F) -> McpResult<T>
where
    F: Future<Output = McpResult<T>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), future).await {
        Ok(result) => result,
        Err(_) => Err(McpError::Timeout(format!("{} timed out after {}ms", method, timeout_ms))),
    }
}

pub(crate) fn not_connected(kind: TransportKind) -> McpError {
    McpError::InvalidState(format!("{} connector is not connected", kind))
}

/// Builds connectors from server configs.
///
/// The session manager goes through this seam so tests can substitute
/// in-memory connectors.
pub trait ConnectorFactory: Send + Sync {
    fn create(&self, config: &ServerConfig) -> McpResult<Arc<dyn Connector>>;
}

/// Builds the real transport connectors.
#[derive(Debug, Clone)]
pub struct DefaultConnectorFactory {
    auth_dir: PathBuf,
}

impl DefaultConnectorFactory {
    /// Use `auth_dir` for durable OAuth state.
    pub fn new(auth_dir: impl Into<PathBuf>) -> Self {
        Self { auth_dir: auth_dir.into() }
    }

    fn auth_provider(&self, config: &ServerConfig) -> McpResult<Option<Arc<dyn OAuthProvider>>> {
        if let Some(handle) = &config.auth_provider {
            return Ok(Some(handle.0.clone()));
        }
        match (&config.auth, config.transport.url()) {
            (Some(settings), Some(url)) => {
                auth::provider_from_settings(url, settings, &self.auth_dir).map(Some)
            }
            _ => Ok(None),
        }
    }
}

impl Default for DefaultConnectorFactory {
    fn default() -> Self {
        Self::new(crate::config::default_auth_dir())
    }
}

impl ConnectorFactory for DefaultConnectorFactory {
    fn create(&self, config: &ServerConfig) -> McpResult<Arc<dyn Connector>> {
        let connector: Arc<dyn Connector> = match &config.transport {
            TransportConfig::Stdio { .. } => Arc::new(StdioConnector::new(config.clone())?),
            TransportConfig::Http { .. } => {
                Arc::new(HttpConnector::new(config.clone(), self.auth_provider(config)?)?)
            }
            TransportConfig::WebSocket { .. } => {
                Arc::new(WebSocketConnector::new(config.clone(), self.auth_provider(config)?)?)
            }
        };
        Ok(connector)
    }
}
