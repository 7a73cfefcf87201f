//! One live connection to one named server.
//!
//! A [`Session`] pairs a connector with the server's cached capability lists
//! and walks a fixed lifecycle:
//!
//! ```text
//! uninitialized -> connecting -> initializing -> ready -> closing -> closed
//!        \______________\_______________\______> failed
//! ```
//!
//! `failed` and `closed` are terminal; recovering means creating a new session.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::connector::Connector;
use crate::error::{McpError, McpResult, TransportKind};
use crate::protocol::{CallToolResult, GetPromptResult, InitializeResult, Prompt, ReadResourceResult, Resource, Tool};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    Connecting,
    Initializing,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        use SessionState::*;
        match (self, next) {
            (Uninitialized, Connecting) | (Connecting, Initializing) | (Initializing, Ready) => true,
            (Closing, Closed) => true,
            // Closing is allowed from any live state so a half-open session can be torn down.
            (Uninitialized | Connecting | Initializing | Ready, Closing) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Name to session map shared by the manager and code mode.
///
/// Readers see the live set; code mode never works from a copy.
pub type SessionMap = Arc<RwLock<HashMap<String, Arc<Session>>>>;

/// A connection to one server plus its cached metadata.
pub struct Session {
    name: String,
    connector: Arc<dyn Connector>,
    state: RwLock<SessionState>,
    server_info: RwLock<Option<InitializeResult>>,
    tools: RwLock<Vec<Tool>>,
    resources: RwLock<Vec<Resource>>,
    prompts: RwLock<Vec<Prompt>>,
    created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("transport", &self.connector.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Wrap a connector. Nothing is opened yet.
    pub fn new(name: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            name: name.into(),
            connector,
            state: RwLock::new(SessionState::Uninitialized),
            server_info: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            resources: RwLock::new(Vec::new()),
            prompts: RwLock::new(Vec::new()),
            created_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Server name; doubles as the session id.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn transport(&self) -> TransportKind {
        self.connector.kind()
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Handshake result, once initialized.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.server_info.read().clone()
    }

    /// Cached tools (empty until ready).
    pub fn tools(&self) -> Vec<Tool> {
        self.tools.read().clone()
    }

    /// Look up a cached tool by name.
    pub fn tool(&self, name: &str) -> Option<Tool> {
        self.tools.read().iter().find(|t| t.name == name).cloned()
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.resources.read().clone()
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.read().clone()
    }

    /// Time since the last call through this session.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn transition(&self, next: SessionState) -> McpResult<()> {
        let mut state = self.state.write();
        if !state.can_transition_to(next) {
            return Err(McpError::InvalidState(format!(
                "session '{}' cannot go from {} to {}",
                self.name, *state, next
            )));
        }
        tracing::trace!(server = %self.name, from = %*state, to = %next, "session transition");
        *state = next;
        Ok(())
    }

    fn fail(&self) {
        let mut state = self.state.write();
        if !state.is_terminal() {
            *state = SessionState::Failed;
        }
    }

    fn require_ready(&self) -> McpResult<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            other => Err(McpError::InvalidState(format!(
                "session '{}' is {}, not ready",
                self.name, other
            ))),
        }
    }

    /// Open the transport.
    pub async fn connect(&self) -> McpResult<()> {
        self.transition(SessionState::Connecting)?;
        if let Err(e) = self.connector.connect().await {
            self.fail();
            return Err(e);
        }
        Ok(())
    }

    /// Run the handshake and cache tools, resources and prompts.
    pub async fn initialize(&self) -> McpResult<InitializeResult> {
        self.transition(SessionState::Initializing)?;
        match self.load_metadata().await {
            Ok(info) => {
                self.transition(SessionState::Ready)?;
                self.touch();
                Ok(info)
            }
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    async fn load_metadata(&self) -> McpResult<InitializeResult> {
        let info = self.connector.initialize().await?;
        *self.server_info.write() = Some(info.clone());

        *self.tools.write() = self.connector.list_tools().await?;

        // Optional capabilities: a server that fails to list them still works for tools.
        if info.capabilities.has_resources() {
            match self.connector.list_resources().await {
                Ok(resources) => *self.resources.write() = resources,
                Err(e) => tracing::debug!(server = %self.name, error = %e, "resources/list failed"),
            }
        }
        if info.capabilities.has_prompts() {
            match self.connector.list_prompts().await {
                Ok(prompts) => *self.prompts.write() = prompts,
                Err(e) => tracing::debug!(server = %self.name, error = %e, "prompts/list failed"),
            }
        }
        Ok(info)
    }

    /// Re-fetch the tool list.
    pub async fn refresh_tools(&self) -> McpResult<Vec<Tool>> {
        self.require_ready()?;
        let tools = self.connector.list_tools().await?;
        *self.tools.write() = tools.clone();
        self.touch();
        Ok(tools)
    }

    /// Invoke a tool on this server.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<HashMap<String, Value>>,
    ) -> McpResult<CallToolResult> {
        self.require_ready()?;
        self.touch();
        self.connector.call_tool(name, arguments).await
    }

    pub async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        self.require_ready()?;
        self.touch();
        self.connector.read_resource(uri).await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> McpResult<GetPromptResult> {
        self.require_ready()?;
        self.touch();
        self.connector.get_prompt(name, arguments).await
    }

    /// Disconnect. Never fails; transport errors are logged.
    pub async fn close(&self) {
        {
            let mut state = self.state.write();
            match *state {
                SessionState::Closed | SessionState::Closing => return,
                // A failed session stays failed but its transport is still released.
                SessionState::Failed => {}
                _ => *state = SessionState::Closing,
            }
        }

        if let Err(e) = self.connector.disconnect().await {
            tracing::warn!(server = %self.name, error = %e, "error while disconnecting");
        }

        let mut state = self.state.write();
        if *state == SessionState::Closing {
            *state = SessionState::Closed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeConnector {
        connected: AtomicBool,
        fail_initialize: bool,
        disconnects: AtomicUsize,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        fn kind(&self) -> TransportKind {
            TransportKind::Stdio
        }

        async fn connect(&self) -> McpResult<()> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> McpResult<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
            Err(McpError::connection(TransportKind::Stdio, "already gone"))
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn request(&self, method: &str, _params: Option<Value>) -> McpResult<Value> {
            match method {
                "initialize" if self.fail_initialize => {
                    Err(McpError::connection(TransportKind::Stdio, "handshake refused"))
                }
                "initialize" => Ok(json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {}, "prompts": {} },
                    "serverInfo": { "name": "fake" }
                })),
                "tools/list" => Ok(json!({ "tools": [{ "name": "echo", "description": "Echo" }] })),
                "prompts/list" => Ok(json!({ "prompts": [{ "name": "greet" }] })),
                "tools/call" => Ok(json!({ "content": [{ "type": "text", "text": "hi" }] })),
                _ => Ok(Value::Null),
            }
        }

        async fn notify(&self, _method: &str, _params: Option<Value>) -> McpResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_transition_table() {
        use SessionState::*;
        assert!(Uninitialized.can_transition_to(Connecting));
        assert!(Ready.can_transition_to(Closing));
        assert!(Connecting.can_transition_to(Failed));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Failed.can_transition_to(Failed));
        assert!(!Uninitialized.can_transition_to(Ready));
    }

    #[tokio::test]
    async fn test_lifecycle_to_ready_and_closed() {
        let connector = Arc::new(FakeConnector::default());
        let session = Session::new("fake", connector.clone());

        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connecting);
        session.initialize().await.unwrap();
        assert!(session.is_ready());
        assert_eq!(session.tools().len(), 1);
        assert_eq!(session.prompts().len(), 1);
        assert!(session.resources().is_empty());

        let result = session.call_tool("echo", None).await.unwrap();
        assert_eq!(result.text_content(), "hi");

        // Disconnect errors are swallowed.
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        session.close().await;
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_handshake_is_terminal() {
        let connector = Arc::new(FakeConnector { fail_initialize: true, ..Default::default() });
        let session = Session::new("fake", connector);

        session.connect().await.unwrap();
        assert!(session.initialize().await.is_err());
        assert_eq!(session.state(), SessionState::Failed);

        let err = session.connect().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_calls_before_ready_are_rejected() {
        let session = Session::new("fake", Arc::new(FakeConnector::default()));
        let err = session.call_tool("echo", None).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);
    }
}
