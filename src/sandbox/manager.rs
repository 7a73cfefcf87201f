//! Sandbox lifecycle and event multiplexing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::events::{EventStream, SandboxEvent};
use super::provider::{HttpSandboxProvider, SandboxHandle, SandboxProvider};
use super::runtime::{QueryPayload, RUNNER_COMMAND, RUNNER_PATH, RUNNER_SCRIPT, SYSTEM_PROMPT, SYSTEM_PROMPT_PATH};
use crate::config::SandboxOptions;
use crate::error::{McpError, McpResult};

/// One provisioned sandbox.
pub struct SandboxSession {
    id: String,
    handle: SandboxHandle,
    agent_ready: AtomicBool,
    mcp_server_running: AtomicBool,
    mcp_server_url: RwLock<Option<String>>,
    current_pid: Mutex<Option<String>>,
    queries: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxSession {
    fn new(handle: SandboxHandle) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            handle,
            agent_ready: AtomicBool::new(false),
            mcp_server_running: AtomicBool::new(false),
            mcp_server_url: RwLock::new(None),
            current_pid: Mutex::new(None),
            queries: AtomicU64::new(0),
            pump: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    /// Runtime files are uploaded and queries can run.
    pub fn agent_ready(&self) -> bool {
        self.agent_ready.load(Ordering::SeqCst)
    }

    pub fn mcp_server_running(&self) -> bool {
        self.mcp_server_running.load(Ordering::SeqCst)
    }

    pub fn mcp_server_url(&self) -> Option<String> {
        self.mcp_server_url.read().clone()
    }

    fn mark_server_ready(&self, url: &str) {
        self.mcp_server_running.store(true, Ordering::SeqCst);
        *self.mcp_server_url.write() = Some(url.to_string());
    }

    fn stop_pump(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

/// Creates sandboxes, runs queries in them, and tears them down.
pub struct SandboxManager {
    provider: Arc<dyn SandboxProvider>,
    options: SandboxOptions,
    sessions: RwLock<HashMap<String, Arc<SandboxSession>>>,
}

impl SandboxManager {
    pub fn new(provider: Arc<dyn SandboxProvider>, options: SandboxOptions) -> Self {
        Self { provider, options, sessions: RwLock::new(HashMap::new()) }
    }

    /// Manager for the HTTP sandbox API described by `options`.
    pub fn from_options(options: SandboxOptions) -> Self {
        let provider = Arc::new(HttpSandboxProvider::new(&options));
        Self::new(provider, options)
    }

    pub fn session(&self, id: &str) -> Option<Arc<SandboxSession>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    fn require(&self, id: &str) -> McpResult<Arc<SandboxSession>> {
        self.session(id)
            .ok_or_else(|| McpError::Resource(format!("sandbox session '{}' does not exist", id)))
    }

    /// Provision a sandbox and upload the runtime.
    pub async fn create_session(&self) -> McpResult<Arc<SandboxSession>> {
        let handle = self.provider.create().await.map_err(as_resource)?;
        let session = Arc::new(SandboxSession::new(handle));

        let uploads = [(RUNNER_PATH, RUNNER_SCRIPT), (SYSTEM_PROMPT_PATH, SYSTEM_PROMPT)];
        for (path, contents) in uploads {
            if let Err(e) = self.provider.upload(&session.handle, path, contents.as_bytes()).await {
                if let Err(kill_err) = self.provider.kill(&session.handle).await {
                    tracing::warn!(sandbox = %session.handle.id, error = %kill_err, "failed to remove half-created sandbox");
                }
                return Err(as_resource(e));
            }
        }

        session.agent_ready.store(true, Ordering::SeqCst);
        self.sessions.write().insert(session.id.clone(), session.clone());
        tracing::info!(session = %session.id, sandbox = %session.handle.id, "sandbox ready");
        Ok(session)
    }

    /// Start a fresh run of `payload` and stream its events.
    pub async fn run_query(&self, session_id: &str, payload: &QueryPayload) -> McpResult<EventStream> {
        let session = self.require(session_id)?;
        if !session.agent_ready() {
            return Err(McpError::InvalidState(format!("sandbox session '{}' is not ready", session_id)));
        }

        let n = session.queries.fetch_add(1, Ordering::SeqCst) + 1;
        let path = QueryPayload::path(n);
        let body = serde_json::to_vec(payload)
            .map_err(|e| McpError::Resource(format!("could not encode query: {}", e)))?;
        self.provider.upload(&session.handle, &path, &body).await?;

        let process = self
            .provider
            .start(&session.handle, RUNNER_COMMAND, &[RUNNER_PATH.to_string(), path])
            .await?;
        *session.current_pid.lock() = Some(process.pid.clone());

        let (tx, rx) = mpsc::channel(self.options.channel_capacity.max(1));
        let watcher = self.spawn_port_watcher(session.clone(), tx.clone());
        let pump = tokio::spawn(pump_events(process.stdout, tx, watcher, session.clone()));

        session.stop_pump();
        *session.pump.lock() = Some(pump);

        Ok(EventStream::new(rx, Duration::from_millis(self.options.event_timeout_ms)))
    }

    fn spawn_port_watcher(&self, session: Arc<SandboxSession>, tx: mpsc::Sender<SandboxEvent>) -> JoinHandle<()> {
        let provider = self.provider.clone();
        let ports = self.options.ports.clone();
        let interval = Duration::from_millis(self.options.poll_interval_ms);
        let attempts = self.options.max_poll_attempts;

        tokio::spawn(async move {
            if session.mcp_server_running() {
                return;
            }
            for _ in 0..attempts {
                tokio::time::sleep(interval).await;
                for &port in &ports {
                    if provider.probe_port(&session.handle, port).await {
                        let url = provider.host_url(&session.handle, port);
                        session.mark_server_ready(&url);
                        tracing::info!(session = %session.id, %url, "server detected in sandbox");
                        let _ = tx.send(SandboxEvent::McpServerReady { url }).await;
                        return;
                    }
                }
            }
        })
    }

    /// Write a line to the current run's stdin.
    pub async fn send_input(&self, session_id: &str, line: &str) -> McpResult<()> {
        let session = self.require(session_id)?;
        let pid = session
            .current_pid
            .lock()
            .clone()
            .ok_or_else(|| McpError::InvalidState(format!("sandbox session '{}' has no running query", session_id)))?;
        self.provider.write_stdin(&session.handle, &pid, line).await
    }

    /// Tear down one sandbox. Failures are logged.
    pub async fn kill_session(&self, session_id: &str) {
        let Some(session) = self.sessions.write().remove(session_id) else {
            return;
        };
        self.kill(&session).await;
    }

    async fn kill(&self, session: &SandboxSession) {
        session.stop_pump();
        session.agent_ready.store(false, Ordering::SeqCst);
        match self.provider.kill(&session.handle).await {
            Ok(()) => tracing::debug!(session = %session.id, "sandbox removed"),
            Err(e) => tracing::warn!(session = %session.id, error = %e, "failed to remove sandbox"),
        }
    }

    /// Tear down every sandbox, tolerating individual failures.
    pub async fn cleanup_all(&self) -> usize {
        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        let count = sessions.len();
        futures::future::join_all(sessions.iter().map(|s| self.kill(s))).await;
        count
    }
}

fn as_resource(error: McpError) -> McpError {
    match error {
        McpError::Resource(_) => error,
        other => McpError::Resource(other.to_string()),
    }
}

async fn pump_events(
    mut stdout: mpsc::Receiver<String>,
    tx: mpsc::Sender<SandboxEvent>,
    watcher: JoinHandle<()>,
    session: Arc<SandboxSession>,
) {
    while let Some(line) = stdout.recv().await {
        let event = SandboxEvent::parse_line(&line);
        if let SandboxEvent::McpServerReady { url } = &event {
            session.mark_server_ready(url);
        }
        let terminal = event.is_terminal();
        if tx.send(event).await.is_err() || terminal {
            break;
        }
    }
    watcher.abort();
}
