//! Executor that runs code inside a remote sandbox.
//!
//! The sandbox is created on first use and reused for later executions until
//! [`CodeExecutor::cleanup`] or a timeout discards it. Tool calls made by the
//! code arrive as `tool_call` events and are answered on the run's stdin.
//! Every event, streamed tokens included, is also handed to the optional
//! [`EventCallback`] as it arrives.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::bridge::ToolBridge;
use super::{CodeExecutionResult, CodeExecutor, DetailLevel};
use crate::error::ErrorKind;
use crate::sandbox::{EventStream, QueryPayload, SandboxEvent, SandboxManager, SandboxSession};
use crate::telemetry::{NoopTelemetry, Telemetry};

/// Called with the URL of a server the executed code brought up.
pub type ServerReadyCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Observes each event of a run as it arrives.
pub type EventCallback = Arc<dyn Fn(&SandboxEvent) + Send + Sync>;

pub struct RemoteExecutor {
    manager: Arc<SandboxManager>,
    bridge: ToolBridge,
    session: Mutex<Option<Arc<SandboxSession>>>,
    on_server_ready: Option<ServerReadyCallback>,
    on_event: Option<EventCallback>,
    telemetry: Arc<dyn Telemetry>,
}

impl RemoteExecutor {
    pub fn new(manager: Arc<SandboxManager>, bridge: ToolBridge) -> Self {
        Self {
            manager,
            bridge,
            session: Mutex::new(None),
            on_server_ready: None,
            on_event: None,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn on_server_ready(mut self, callback: ServerReadyCallback) -> Self {
        self.on_server_ready = Some(callback);
        self
    }

    pub fn on_event(mut self, callback: EventCallback) -> Self {
        self.on_event = Some(callback);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.manager
    }

    async fn answer_tool_call(&self, session: &SandboxSession, id: String, server: Option<String>, tool: String, args: Value) {
        let outcome = match server {
            Some(server) => self.bridge.call_tool(&server, &tool, args).await,
            None => match self.bridge.resolve_server(&tool) {
                Ok(server) => self.bridge.call_tool(&server, &tool, args).await,
                Err(e) => Err(e),
            },
        };
        let reply = match outcome {
            Ok(result) => json!({ "id": id, "result": result }),
            Err(e) => json!({ "id": id, "error": e.to_string() }),
        };
        if let Err(e) = self.manager.send_input(session.id(), &reply.to_string()).await {
            tracing::warn!(session = %session.id(), %tool, error = %e, "could not deliver tool result");
        }
    }

    /// Drain one run, answering tool calls as they arrive.
    ///
    /// Output lines accumulate in `logs`, which outlives the run so a timeout
    /// can still report them.
    async fn drive(&self, session: &SandboxSession, mut events: EventStream, logs: &mut Vec<String>) -> CodeExecutionResult {
        while let Some(event) = events.next().await {
            if let Some(callback) = &self.on_event {
                callback(&event);
            }
            match event {
                SandboxEvent::Log { line } => logs.push(line),
                SandboxEvent::Assistant { text } => logs.push(text),
                SandboxEvent::Token { .. } => {}
                SandboxEvent::ToolStart { server, tool } => {
                    tracing::debug!(server = server.as_deref().unwrap_or("?"), %tool, "sandbox tool start");
                }
                SandboxEvent::ToolEnd { tool, error, .. } => {
                    if let Some(error) = error {
                        tracing::debug!(%tool, %error, "sandbox tool failed");
                    }
                }
                SandboxEvent::ToolCall { id, server, tool, args } => {
                    self.answer_tool_call(session, id, server, tool, args).await;
                }
                SandboxEvent::McpServerReady { url } => {
                    tracing::info!(%url, "code started a server");
                    if let Some(callback) = &self.on_server_ready {
                        callback(url);
                    }
                }
                SandboxEvent::Result { error: Some(error), .. } => {
                    return CodeExecutionResult::failure(ErrorKind::Execution, error, std::mem::take(logs));
                }
                SandboxEvent::Result { value, error: None } => {
                    let value = value.filter(|v| !v.is_null());
                    return CodeExecutionResult::success(value, std::mem::take(logs));
                }
            }
        }

        let message = if events.ended_idle() {
            "sandbox produced no events before the idle timeout"
        } else {
            "sandbox run ended without a result"
        };
        CodeExecutionResult::failure(ErrorKind::Execution, message, std::mem::take(logs))
    }

    async fn ensure_session(&self, slot: &mut Option<Arc<SandboxSession>>) -> Result<Arc<SandboxSession>, CodeExecutionResult> {
        if let Some(session) = slot.as_ref().filter(|s| s.agent_ready()) {
            return Ok(session.clone());
        }
        match self.manager.create_session().await {
            Ok(session) => {
                *slot = Some(session.clone());
                Ok(session)
            }
            Err(e) => Err(CodeExecutionResult::failure(e.kind(), e.to_string(), Vec::new())),
        }
    }
}

#[async_trait]
impl CodeExecutor for RemoteExecutor {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn execute(&self, code: &str, timeout_ms: u64) -> CodeExecutionResult {
        let mut slot = self.session.lock().await;
        let started = Instant::now();

        let result = match self.ensure_session(&mut slot).await {
            Err(failure) => failure,
            Ok(session) => {
                let payload = QueryPayload {
                    code: code.to_string(),
                    tools: self.bridge.search("", DetailLevel::Full),
                    servers: self.bridge.servers(),
                    timeout_ms,
                };
                let mut logs = Vec::new();
                let run = async {
                    match self.manager.run_query(session.id(), &payload).await {
                        Ok(events) => self.drive(&session, events, &mut logs).await,
                        Err(e) => CodeExecutionResult::failure(e.kind(), e.to_string(), Vec::new()),
                    }
                };
                let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), run).await;
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(session = %session.id(), timeout_ms, "sandbox run timed out, discarding sandbox");
                        self.manager.kill_session(session.id()).await;
                        *slot = None;
                        CodeExecutionResult::timed_out(timeout_ms, logs)
                    }
                }
            }
        };

        let elapsed = started.elapsed().as_millis() as u64;
        self.telemetry.track_code_execution(elapsed, result.error_kind);
        result.with_duration(elapsed)
    }

    async fn cleanup(&self) {
        if let Some(session) = self.session.lock().await.take() {
            self.manager.kill_session(session.id()).await;
        }
        self.manager.cleanup_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxOptions;
    use crate::sandbox::ScriptedProvider;
    use crate::session::SessionMap;
    use parking_lot::Mutex as SyncMutex;

    fn options() -> SandboxOptions {
        SandboxOptions { poll_interval_ms: 10, max_poll_attempts: 2, event_timeout_ms: 2_000, ..SandboxOptions::default() }
    }

    fn executor(provider: Arc<ScriptedProvider>) -> RemoteExecutor {
        let manager = Arc::new(SandboxManager::new(provider, options()));
        RemoteExecutor::new(manager, ToolBridge::new(SessionMap::default()))
    }

    #[tokio::test]
    async fn test_result_and_logs() {
        let provider = Arc::new(ScriptedProvider::default());
        *provider.stdout.lock() = vec![
            r#"{"type":"log","line":"computing"}"#.into(),
            r#"{"type":"result","value":4,"error":null}"#.into(),
        ];
        let result = executor(provider).execute("result = 2 + 2", 5_000).await;
        assert_eq!(result.result, Some(json!(4)));
        assert_eq!(result.logs, vec!["computing".to_string()]);
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_code_error_is_verbatim() {
        let provider = Arc::new(ScriptedProvider::default());
        *provider.stdout.lock() = vec![r#"{"type":"result","value":null,"error":"division by zero"}"#.into()];
        let result = executor(provider).execute("1/0", 5_000).await;
        assert_eq!(result.error.as_deref(), Some("division by zero"));
        assert_eq!(result.error_kind, Some(ErrorKind::Execution));
    }

    #[tokio::test]
    async fn test_tool_call_gets_error_reply() {
        let provider = Arc::new(ScriptedProvider::default());
        *provider.stdout.lock() = vec![
            r#"{"type":"tool_call","id":"7","server":"ghost","tool":"x","args":{}}"#.into(),
            r#"{"type":"result","value":"done"}"#.into(),
        ];
        let result = executor(provider.clone()).execute("call_tool('ghost','x',{})", 5_000).await;
        assert_eq!(result.result, Some(json!("done")));

        let replies = provider.stdin.lock();
        let reply: Value = serde_json::from_str(&replies[0]).unwrap();
        assert_eq!(reply["id"], "7");
        assert!(reply["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_timeout_discards_sandbox() {
        let provider = Arc::new(ScriptedProvider::default());
        let executor = executor(provider.clone());
        let result = executor.execute("while True: pass", 100).await;
        assert!(result.error.unwrap().contains("timed out"));
        assert_eq!(provider.killed.lock().len(), 1);
        assert!(executor.manager().session_ids().is_empty());
    }

    #[tokio::test]
    async fn test_server_ready_callback() {
        let provider = Arc::new(ScriptedProvider::default());
        *provider.stdout.lock() = vec![
            r#"{"type":"mcp_server_ready","url":"http://sb:3000"}"#.into(),
            r#"{"type":"result","value":null}"#.into(),
        ];
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = seen.clone();
        let executor = executor(provider).on_server_ready(Arc::new(move |url| sink.lock().push(url)));

        let result = executor.execute("serve()", 5_000).await;
        assert!(result.result.is_none());
        assert_eq!(*seen.lock(), vec!["http://sb:3000".to_string()]);
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_resource_error() {
        let result = executor(Arc::new(ScriptedProvider::failing())).execute("1", 1_000).await;
        assert_eq!(result.error_kind, Some(ErrorKind::Resource));
    }

    #[tokio::test]
    async fn test_timeout_keeps_logs() {
        let provider = Arc::new(ScriptedProvider::default());
        *provider.stdout.lock() = vec![r#"{"type":"log","line":"started"}"#.into()];
        let result = executor(provider).execute("import time; time.sleep(60)", 300).await;

        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(result.logs, vec!["started".to_string()]);
    }

    #[tokio::test]
    async fn test_event_callback_sees_tokens() {
        let provider = Arc::new(ScriptedProvider::default());
        *provider.stdout.lock() = vec![
            r#"{"type":"token","text":"Hel"}"#.into(),
            r#"{"type":"token","text":"lo"}"#.into(),
            r#"{"type":"result","value":"Hello"}"#.into(),
        ];
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = seen.clone();
        let executor = executor(provider).on_event(Arc::new(move |event: &SandboxEvent| sink.lock().push(event.clone())));

        let result = executor.execute("ask()", 5_000).await;
        assert_eq!(result.result, Some(json!("Hello")));
        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], SandboxEvent::Token { text: "Hel".into() });
        assert_eq!(seen[1], SandboxEvent::Token { text: "lo".into() });
        assert!(seen[2].is_terminal());
    }
}
