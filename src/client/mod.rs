//! Multi-server session manager.
//!
//! [`SessionManager`] owns the server registry and the live sessions keyed by
//! server name. Operations on different names run concurrently; operations on
//! the same name are serialized by a per-name lock so a replaced or removed
//! session never leaks its connector.
//!
//! The manager is a cheap handle (`Clone`) around shared state. Build one at
//! startup and pass it where it is needed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::{ClientOptions, ExecutorKind, McpConfig, ServerConfig};
use crate::connector::{CodeModeConnector, Connector, ConnectorFactory, DefaultConnectorFactory, CODE_MODE_SERVER};
use crate::error::{McpError, McpResult, TransportKind};
use crate::executor::{
    CodeExecutionResult, CodeExecutor, DetailLevel, EventCallback, RemoteExecutor, ToolBridge, VmExecutor,
};
use crate::protocol::{CallToolResult, Tool};
use crate::sandbox::SandboxManager;
use crate::session::{Session, SessionMap};
use crate::telemetry::{telemetry_from_env, Telemetry};

/// Outcome of a fan-out over many servers.
#[derive(Debug, Default)]
pub struct AggregateReport {
    /// Servers the operation succeeded for, sorted
    pub succeeded: Vec<String>,
    /// Servers it failed for, sorted by name
    pub failures: Vec<(String, McpError)>,
}

impl AggregateReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure(&self, name: &str) -> Option<&McpError> {
        self.failures.iter().find(|(n, _)| n == name).map(|(_, e)| e)
    }

    fn sort(&mut self) {
        self.succeeded.sort();
        self.failures.sort_by(|a, b| a.0.cmp(&b.0));
    }
}

struct Inner {
    registry: RwLock<BTreeMap<String, ServerConfig>>,
    sessions: SessionMap,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    factory: Arc<dyn ConnectorFactory>,
    telemetry: Arc<dyn Telemetry>,
    options: ClientOptions,
    executor: Mutex<Option<Arc<dyn CodeExecutor>>>,
    sandbox_events: Option<EventCallback>,
}

/// Owns the registry and every active session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

/// Builder for [`SessionManager`].
pub struct SessionManagerBuilder {
    config: McpConfig,
    options: ClientOptions,
    factory: Option<Arc<dyn ConnectorFactory>>,
    telemetry: Option<Arc<dyn Telemetry>>,
    executor: Option<Arc<dyn CodeExecutor>>,
    sandbox_events: Option<EventCallback>,
}

impl SessionManagerBuilder {
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the connector factory (tests use in-memory connectors).
    pub fn factory(mut self, factory: Arc<dyn ConnectorFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Use `executor` for code mode instead of building one from the options.
    pub fn executor(mut self, executor: Arc<dyn CodeExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Receive every event of remote sandbox runs, streamed tokens included.
    pub fn sandbox_events(mut self, callback: EventCallback) -> Self {
        self.sandbox_events = Some(callback);
        self
    }

    pub fn build(self) -> SessionManager {
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(DefaultConnectorFactory::new(self.options.auth_dir())));
        SessionManager {
            inner: Arc::new(Inner {
                registry: RwLock::new(self.config.servers),
                sessions: SessionMap::default(),
                locks: Mutex::new(HashMap::new()),
                factory,
                telemetry: self.telemetry.unwrap_or_else(telemetry_from_env),
                options: self.options,
                executor: Mutex::new(self.executor),
                sandbox_events: self.sandbox_events,
            }),
        }
    }
}

impl SessionManager {
    /// Manager with default options, real connectors and environment-driven telemetry.
    pub fn new(config: McpConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: McpConfig) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            options: ClientOptions::default(),
            factory: None,
            telemetry: None,
            executor: None,
            sandbox_events: None,
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    // --- registry ---

    /// Add or replace a server definition. Does not touch a running session.
    pub fn add_server(&self, config: ServerConfig) {
        tracing::debug!(server = %config.name, transport = %config.transport_kind(), "server registered");
        self.inner.registry.write().insert(config.name.clone(), config);
    }

    /// Remove a server, closing its session first. Returns whether it was registered.
    pub async fn remove_server(&self, name: &str) -> bool {
        let removed = {
            let lock = self.lock_for(name);
            let _guard = lock.lock().await;

            self.close_locked(name).await;
            self.inner.registry.write().remove(name).is_some()
        };
        self.prune_lock(name);
        removed
    }

    pub fn server_names(&self) -> Vec<String> {
        self.inner.registry.read().keys().cloned().collect()
    }

    pub fn server_config(&self, name: &str) -> Option<ServerConfig> {
        self.inner.registry.read().get(name).cloned()
    }

    // --- sessions ---

    pub fn get_session(&self, name: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().get(name).cloned()
    }

    /// Names with a live session, sorted.
    pub fn active_sessions(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.sessions.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner.locks.lock().entry(name.to_string()).or_default().clone()
    }

    /// Registered, or the built-in code-mode server while code mode is on.
    fn is_known(&self, name: &str) -> bool {
        self.inner.registry.read().contains_key(name)
            || (name == CODE_MODE_SERVER && self.inner.options.code_mode.enabled)
    }

    /// Forget the lock of a name that is gone, unless another operation holds it.
    fn prune_lock(&self, name: &str) {
        if self.is_known(name) || self.get_session(name).is_some() {
            return;
        }
        let mut locks = self.inner.locks.lock();
        if locks.get(name).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(name);
        }
    }

    fn connector_for(&self, name: &str) -> McpResult<Arc<dyn Connector>> {
        let config = self.server_config(name);
        match config {
            Some(config) => self.inner.factory.create(&config),
            None if name == CODE_MODE_SERVER && self.inner.options.code_mode.enabled => {
                Ok(Arc::new(CodeModeConnector::new(
                    self.executor(),
                    self.bridge(),
                    self.inner.options.code_mode.default_timeout_ms,
                )))
            }
            None => Err(McpError::server_not_found(name)),
        }
    }

    /// Connect and initialize a session for `name`, replacing any existing one.
    pub async fn create_session(&self, name: &str) -> McpResult<Arc<Session>> {
        if !self.is_known(name) {
            return Err(McpError::server_not_found(name));
        }
        let result = {
            let lock = self.lock_for(name);
            let _guard = lock.lock().await;
            self.start_locked(name).await
        };
        if result.is_err() {
            self.prune_lock(name);
        }
        result
    }

    async fn start_locked(&self, name: &str) -> McpResult<Arc<Session>> {
        let connector = self.connector_for(name)?;
        self.close_locked(name).await;

        let session = Arc::new(Session::new(name, connector));
        let outcome = async {
            session.connect().await?;
            session.initialize().await
        }
        .await;

        match outcome {
            Ok(info) => {
                tracing::info!(
                    server = %name,
                    transport = %session.transport(),
                    server_name = %info.server_info.name,
                    tools = session.tools().len(),
                    "session ready"
                );
                self.inner.sessions.write().insert(name.to_string(), session.clone());
                self.inner.telemetry.track_session_created(name, session.transport());
                Ok(session)
            }
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "session failed to start");
                session.close().await;
                Err(e)
            }
        }
    }

    /// Create a session for every registered server (and code mode when enabled).
    ///
    /// Every server is attempted; one failure never stops the others.
    pub async fn create_all_sessions(&self) -> AggregateReport {
        let mut names = self.server_names();
        if self.inner.options.code_mode.enabled && !names.iter().any(|n| n == CODE_MODE_SERVER) {
            names.push(CODE_MODE_SERVER.to_string());
        }

        let mut set = JoinSet::new();
        for name in names {
            let manager = self.clone();
            set.spawn(async move {
                let result = manager.create_session(&name).await.map(|_| ());
                (name, result)
            });
        }

        let mut report = AggregateReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => report.succeeded.push(name),
                Ok((name, Err(e))) => report.failures.push((name, e)),
                Err(e) => tracing::error!(error = %e, "session task panicked"),
            }
        }
        report.sort();
        report
    }

    async fn close_locked(&self, name: &str) {
        let existing = self.inner.sessions.write().remove(name);
        if let Some(session) = existing {
            session.close().await;
            self.inner.telemetry.track_session_closed(name);
            tracing::debug!(server = %name, "session closed");
        }
    }

    /// Close the session for `name`. A missing session is not an error.
    pub async fn close_session(&self, name: &str) {
        {
            let lock = self.lock_for(name);
            let _guard = lock.lock().await;
            self.close_locked(name).await;
        }
        self.prune_lock(name);
    }

    /// Close every session independently.
    pub async fn close_all_sessions(&self) -> AggregateReport {
        let mut set = JoinSet::new();
        for name in self.active_sessions() {
            let manager = self.clone();
            set.spawn(async move {
                manager.close_session(&name).await;
                name
            });
        }

        let mut report = AggregateReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(name) => report.succeeded.push(name),
                Err(e) => tracing::warn!(error = %e, "close task panicked"),
            }
        }
        report.sort();
        report
    }

    /// Close every session and release the code executor.
    pub async fn shutdown(&self) {
        let report = self.close_all_sessions().await;
        let executor = self.inner.executor.lock().take();
        if let Some(executor) = executor {
            executor.cleanup().await;
        }
        tracing::debug!(closed = report.succeeded.len(), "manager shut down");
    }

    // --- tools ---

    fn ready_session(&self, name: &str) -> McpResult<Arc<Session>> {
        match self.get_session(name) {
            Some(session) => Ok(session),
            None if self.inner.registry.read().contains_key(name) => Err(McpError::InvalidState(
                format!("server '{}' has no active session", name),
            )),
            None => Err(McpError::server_not_found(name)),
        }
    }

    /// Call `tool` on `server`.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<HashMap<String, Value>>,
    ) -> McpResult<CallToolResult> {
        let session = self.ready_session(server)?;
        let result = session.call_tool(tool, arguments).await;
        let success = matches!(&result, Ok(r) if !r.is_error());
        self.inner.telemetry.track_tool_call(server, tool, success);
        result
    }

    /// First active session (by name) offering `tool`.
    pub fn find_tool(&self, tool: &str) -> Option<(String, Tool)> {
        let sessions = self.inner.sessions.read();
        let mut names: Vec<&String> = sessions.keys().collect();
        names.sort();
        names.into_iter().find_map(|name| {
            let session = &sessions[name];
            if !session.is_ready() {
                return None;
            }
            session.tool(tool).map(|t| (name.clone(), t))
        })
    }

    /// Every tool of every active session, keyed by server.
    pub fn list_tools(&self) -> BTreeMap<String, Vec<Tool>> {
        self.inner
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| s.is_ready())
            .map(|(name, s)| (name.clone(), s.tools()))
            .collect()
    }

    /// Bridge over the live session map, as seen by executed code.
    pub fn bridge(&self) -> ToolBridge {
        ToolBridge::new(self.inner.sessions.clone()).with_telemetry(self.inner.telemetry.clone())
    }

    /// Fuzzy tool search across active sessions.
    pub fn search_tools(&self, query: &str, detail: DetailLevel) -> Vec<Value> {
        self.bridge().search(query, detail)
    }

    // --- code mode ---

    /// The code executor, created on first use.
    pub fn executor(&self) -> Arc<dyn CodeExecutor> {
        let mut slot = self.inner.executor.lock();
        if let Some(executor) = slot.as_ref() {
            return executor.clone();
        }

        let code_mode = &self.inner.options.code_mode;
        let bridge = self.bridge();
        let executor: Arc<dyn CodeExecutor> = match code_mode.executor {
            ExecutorKind::Vm => Arc::new(
                VmExecutor::new(bridge, code_mode.vm.clone()).with_telemetry(self.inner.telemetry.clone()),
            ),
            ExecutorKind::Remote => {
                let sandboxes = Arc::new(SandboxManager::from_options(code_mode.sandbox.clone()));
                let weak = Arc::downgrade(&self.inner);
                let mut remote = RemoteExecutor::new(sandboxes, bridge)
                    .with_telemetry(self.inner.telemetry.clone())
                    .on_server_ready(Arc::new(move |url| register_discovered(&weak, url)));
                if let Some(callback) = &self.inner.sandbox_events {
                    remote = remote.on_event(callback.clone());
                }
                Arc::new(remote)
            }
        };
        tracing::debug!(executor = executor.name(), "code executor created");
        *slot = Some(executor.clone());
        executor
    }

    /// Run `code` with the tool bridge. Fails only when code mode is disabled.
    pub async fn execute_code(&self, code: &str, timeout_ms: Option<u64>) -> McpResult<CodeExecutionResult> {
        let code_mode = &self.inner.options.code_mode;
        if !code_mode.enabled {
            return Err(McpError::Config("code mode is not enabled".to_string()));
        }
        let timeout_ms = timeout_ms.unwrap_or(code_mode.default_timeout_ms);
        Ok(self.executor().execute(code, timeout_ms).await)
    }

    // --- idle cleanup ---

    /// Periodically close sessions idle for longer than `idle_threshold`.
    ///
    /// The task holds only a weak reference to the manager and stops when the
    /// returned handle is stopped or dropped.
    pub fn spawn_idle_sweeper(&self, interval: Duration, idle_threshold: Duration) -> IdleSweeper {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = SessionManager { inner };
                let idle: Vec<String> = manager
                    .inner
                    .sessions
                    .read()
                    .iter()
                    .filter(|(_, s)| s.transport() != TransportKind::CodeMode && s.idle_for() >= idle_threshold)
                    .map(|(name, _)| name.clone())
                    .collect();
                for name in idle {
                    tracing::info!(server = %name, "closing idle session");
                    manager.close_session(&name).await;
                }
            }
        });
        IdleSweeper { handle }
    }
}

fn register_discovered(inner: &Weak<Inner>, url: String) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut registry = inner.registry.write();
    if registry.values().any(|c| c.transport.url() == Some(url.as_str())) {
        return;
    }
    let name = (1..)
        .map(|n| format!("sandbox-server-{}", n))
        .find(|n| !registry.contains_key(n))
        .unwrap_or_else(|| format!("sandbox-server-{}", uuid::Uuid::new_v4()));
    tracing::info!(server = %name, %url, "registered server started in sandbox");
    registry.insert(name.clone(), ServerConfig::http(name, url));
}

/// Handle to a running idle sweeper.
pub struct IdleSweeper {
    handle: JoinHandle<()>,
}

impl IdleSweeper {
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for IdleSweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
