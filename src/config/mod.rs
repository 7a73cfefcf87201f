//! Configuration for the client runtime.
//!
//! Two layers live here:
//! - [`McpConfig`], the `{ "mcpServers": { ... } }` registry document, parsed
//!   from JSON or TOML and normalized into one [`ServerConfig`] per name.
//! - [`ClientOptions`], runtime knobs (code mode, VM limits, remote sandbox,
//!   token storage) loaded from a TOML file with defaults for every field.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::auth::OAuthProvider;
use crate::error::{McpError, McpResult, TransportKind};

/// Default per-request timeout for network transports.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Transport-specific connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    /// Spawn a child process and speak JSON-RPC over its stdio.
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<String>,
    },
    /// Streamable HTTP endpoint.
    Http { url: String, headers: HashMap<String, String> },
    /// WebSocket endpoint (`ws://` or `wss://`).
    WebSocket { url: String, headers: HashMap<String, String> },
}

impl TransportConfig {
    /// The transport discriminant.
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio { .. } => TransportKind::Stdio,
            Self::Http { .. } => TransportKind::Http,
            Self::WebSocket { .. } => TransportKind::WebSocket,
        }
    }

    /// URL for network transports.
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Http { url, .. } | Self::WebSocket { url, .. } => Some(url),
            Self::Stdio { .. } => None,
        }
    }
}

/// How a server's OAuth flow is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Open the authorization URL for a human and wait for the callback.
    #[default]
    Interactive,
    /// Follow the authorization redirect programmatically.
    Headless,
}

/// Where OAuth state is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStorage {
    /// JSON files under the auth directory; survives restarts.
    #[default]
    File,
    /// Process memory only.
    Memory,
}

/// Declarative OAuth settings for one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSettings {
    /// Flow variant
    #[serde(default)]
    pub mode: AuthMode,
    /// Token persistence
    #[serde(default)]
    pub storage: TokenStorage,
    /// Redirect URI registered with the authorization server
    #[serde(default = "default_redirect_url")]
    pub redirect_url: String,
    /// Client name used for dynamic registration
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Requested scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Open the authorization URL in a browser popup instead of recording a redirect
    #[serde(default = "default_true")]
    pub popup: bool,
}

fn default_redirect_url() -> String {
    "http://localhost:8765/oauth/callback".to_string()
}

fn default_client_name() -> String {
    crate::protocol::CLIENT_NAME.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            mode: AuthMode::default(),
            storage: TokenStorage::default(),
            redirect_url: default_redirect_url(),
            client_name: default_client_name(),
            scope: None,
            popup: true,
        }
    }
}

/// Handle to a programmatically supplied OAuth provider.
#[derive(Clone)]
pub struct AuthProviderHandle(pub Arc<dyn OAuthProvider>);

impl fmt::Debug for AuthProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthProviderHandle(..)")
    }
}

/// Connection spec for one named server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server name (unique key)
    pub name: String,
    /// Transport settings
    pub transport: TransportConfig,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
    /// Declarative OAuth settings
    pub auth: Option<AuthSettings>,
    /// Explicit provider; takes precedence over `auth`
    pub auth_provider: Option<AuthProviderHandle>,
}

impl ServerConfig {
    /// Create a stdio server config.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self::with_transport(
            name,
            TransportConfig::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
                cwd: None,
            },
        )
    }

    /// Create an HTTP server config.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_transport(name, TransportConfig::Http { url: url.into(), headers: HashMap::new() })
    }

    /// Create a WebSocket server config.
    pub fn websocket(name: impl Into<String>, url: impl Into<String>) -> McpResult<Self> {
        let url = url.into();
        validate_ws_url(&url)?;
        Ok(Self::with_transport(name, TransportConfig::WebSocket { url, headers: HashMap::new() }))
    }

    fn with_transport(name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            transport,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            auth: None,
            auth_provider: None,
        }
    }

    /// Add an environment variable (stdio only; ignored otherwise).
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::Stdio { env, .. } = &mut self.transport {
            env.insert(key.into(), value.into());
        }
        self
    }

    /// Add an HTTP header (network transports only; ignored otherwise).
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match &mut self.transport {
            TransportConfig::Http { headers, .. } | TransportConfig::WebSocket { headers, .. } => {
                headers.insert(key.into(), value.into());
            }
            TransportConfig::Stdio { .. } => {}
        }
        self
    }

    /// Set the per-request timeout.
    pub fn timeout(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    /// Attach declarative OAuth settings.
    pub fn auth(mut self, settings: AuthSettings) -> Self {
        self.auth = Some(settings);
        self
    }

    /// Attach an explicit OAuth provider.
    pub fn auth_provider(mut self, provider: Arc<dyn OAuthProvider>) -> Self {
        self.auth_provider = Some(AuthProviderHandle(provider));
        self
    }

    /// Transport discriminant.
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }
}

/// One entry of `mcpServers` as written in a config file.
///
/// Shapes are distinguished by which fields are present; an explicit
/// `transport` wins over inference.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerEntry {
    #[serde(default, alias = "type")]
    transport: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default, alias = "timeout_ms")]
    timeout_ms: Option<u64>,
    #[serde(default)]
    auth: Option<AuthSettings>,
}

impl RawServerEntry {
    fn normalize(self, name: &str) -> McpResult<ServerConfig> {
        let explicit = self.transport.as_deref().map(str::to_ascii_lowercase);

        let transport = match (explicit.as_deref(), self.command, self.url) {
            (Some("stdio") | None, Some(command), _) => {
                TransportConfig::Stdio { command, args: self.args, env: self.env, cwd: self.cwd }
            }
            (Some("websocket" | "ws"), _, Some(url)) => {
                validate_ws_url(&url)?;
                TransportConfig::WebSocket { url, headers: self.headers }
            }
            (Some("http" | "streamable-http" | "sse"), _, Some(url)) => {
                TransportConfig::Http { url, headers: self.headers }
            }
            (None, None, Some(url)) => {
                if url.starts_with("ws://") || url.starts_with("wss://") {
                    TransportConfig::WebSocket { url, headers: self.headers }
                } else {
                    TransportConfig::Http { url, headers: self.headers }
                }
            }
            (Some(other), _, _) => {
                return Err(McpError::Config(format!(
                    "server '{}': transport '{}' is missing its required fields or is unknown",
                    name, other
                )))
            }
            (None, None, None) => {
                return Err(McpError::Config(format!(
                    "server '{}' needs either a 'command' or a 'url'",
                    name
                )))
            }
        };

        Ok(ServerConfig {
            name: name.to_string(),
            transport,
            timeout_ms: self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            auth: self.auth,
            auth_provider: None,
        })
    }
}

fn validate_ws_url(url: &str) -> McpResult<()> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(())
    } else {
        Err(McpError::Config(format!("websocket URL must start with ws:// or wss://: {}", url)))
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawMcpConfig {
    #[serde(default, rename = "mcpServers", alias = "mcp_servers")]
    servers: Option<BTreeMap<String, RawServerEntry>>,
}

/// The server registry document.
#[derive(Debug, Clone, Default)]
pub struct McpConfig {
    /// Normalized servers by name
    pub servers: BTreeMap<String, ServerConfig>,
}

impl McpConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document. A missing `mcpServers` key yields an empty registry.
    pub fn from_json(json: &str) -> McpResult<Self> {
        let raw: RawMcpConfig = serde_json::from_str(json)
            .map_err(|e| McpError::Config(format!("invalid config: {}", e)))?;
        Self::from_raw(raw)
    }

    /// Parse a TOML document with an `[mcpServers.<name>]` table per server.
    pub fn from_toml(text: &str) -> McpResult<Self> {
        let raw: RawMcpConfig =
            toml::from_str(text).map_err(|e| McpError::Config(format!("invalid config: {}", e)))?;
        Self::from_raw(raw)
    }

    /// Load from a file; `.toml` files are parsed as TOML, everything else as JSON.
    pub fn from_file(path: impl AsRef<Path>) -> McpResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            McpError::Config(format!("failed to read config {}: {}", path.display(), e))
        })?;

        if path.extension().is_some_and(|ext| ext == "toml") {
            Self::from_toml(&content)
        } else {
            Self::from_json(&content)
        }
    }

    fn from_raw(raw: RawMcpConfig) -> McpResult<Self> {
        let mut servers = BTreeMap::new();
        for (name, entry) in raw.servers.unwrap_or_default() {
            let config = entry.normalize(&name)?;
            servers.insert(name, config);
        }
        Ok(Self { servers })
    }

    /// Add a server configuration.
    pub fn add_server(mut self, config: ServerConfig) -> Self {
        self.servers.insert(config.name.clone(), config);
        self
    }

    /// Get server configuration by name.
    pub fn get(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }

    /// List all server names.
    pub fn server_names(&self) -> Vec<&str> {
        self.servers.keys().map(|s| s.as_str()).collect()
    }
}

/// Expand `${VAR}` references in a config value, keeping the literal on failure.
pub fn expand_value(value: &str) -> String {
    shellexpand::env(value).map(|v| v.into_owned()).unwrap_or_else(|_| value.to_string())
}

/// Expand every value of a string map.
pub fn expand_map(map: &HashMap<String, String>) -> HashMap<String, String> {
    map.iter().map(|(k, v)| (k.clone(), expand_value(v))).collect()
}

// ============================================================================
// Runtime options
// ============================================================================

/// Which executor backs code mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// In-process sandboxed VM
    #[default]
    Vm,
    /// Remote ephemeral sandbox
    Remote,
}

/// Resource limits for the local VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmLimits {
    /// Maximum interpreter operations per run (0 = unlimited)
    pub max_operations: u64,
    /// Maximum function call nesting
    pub max_call_levels: usize,
    /// Maximum string length in bytes
    pub max_string_size: usize,
    /// Maximum array length
    pub max_array_size: usize,
    /// Maximum object map size
    pub max_map_size: usize,
}

impl Default for VmLimits {
    fn default() -> Self {
        Self {
            max_operations: 0,
            max_call_levels: 64,
            max_string_size: 4 * 1024 * 1024,
            max_array_size: 100_000,
            max_map_size: 10_000,
        }
    }
}

/// Remote sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxOptions {
    /// Base URL of the sandbox API
    pub api_url: String,
    /// API key sent as `X-API-Key`
    pub api_key: Option<String>,
    /// Template or image identifier for new sandboxes
    pub template: Option<String>,
    /// Ports probed for a server started by generated code
    pub ports: Vec<u16>,
    /// Delay between port probes
    pub poll_interval_ms: u64,
    /// Probes per run before giving up
    pub max_poll_attempts: u32,
    /// Pull timeout treated as stream completion
    pub event_timeout_ms: u64,
    /// Bounded event channel capacity per sandbox session
    pub channel_capacity: usize,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080".to_string(),
            api_key: None,
            template: None,
            ports: vec![3000, 3001, 8000, 8080],
            poll_interval_ms: 1_000,
            max_poll_attempts: 30,
            event_timeout_ms: 60_000,
            channel_capacity: 256,
        }
    }
}

/// Code mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeModeOptions {
    /// Whether code mode is enabled
    pub enabled: bool,
    /// Executor variant
    pub executor: ExecutorKind,
    /// Timeout applied when the caller passes none
    pub default_timeout_ms: u64,
    /// Local VM limits
    pub vm: VmLimits,
    /// Remote sandbox settings
    pub sandbox: SandboxOptions,
}

impl Default for CodeModeOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            executor: ExecutorKind::default(),
            default_timeout_ms: 30_000,
            vm: VmLimits::default(),
            sandbox: SandboxOptions::default(),
        }
    }
}

/// Runtime options for a session manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Code mode settings
    pub code_mode: CodeModeOptions,
    /// Directory for durable OAuth state (defaults to the user config dir)
    pub auth_dir: Option<PathBuf>,
}

impl ClientOptions {
    /// Load options from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> McpResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            McpError::Config(format!("failed to read options {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| McpError::Config(format!("invalid options: {}", e)))
    }

    /// Enable code mode.
    pub fn with_code_mode(mut self) -> Self {
        self.code_mode.enabled = true;
        self
    }

    /// Resolved directory for durable OAuth state.
    pub fn auth_dir(&self) -> PathBuf {
        self.auth_dir.clone().unwrap_or_else(default_auth_dir)
    }
}

/// `<config dir>/mcpfleet/auth`.
pub fn default_auth_dir() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("mcpfleet").join("auth")
}
