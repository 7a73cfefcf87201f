//! Error types shared by every layer of the client runtime.
//!
//! Every fallible operation returns [`McpError`]. Callers that only need to
//! distinguish "server unreachable" from "authorization required" from "your
//! code failed" should branch on [`McpError::kind`].

use std::fmt;

use thiserror::Error;

use crate::protocol::JsonRpcError;

/// Result type for client runtime operations.
pub type McpResult<T> = Result<T, McpError>;

/// Transport kind, carried by connection errors and reported by connectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Child process speaking JSON-RPC over stdin/stdout
    Stdio,
    /// Streamable HTTP
    Http,
    /// WebSocket
    WebSocket,
    /// Virtual connector backed by the code executor
    CodeMode,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::WebSocket => "websocket",
            Self::CodeMode => "code-mode",
        };
        f.write_str(name)
    }
}

/// Coarse error classification for user-facing reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Connection,
    Auth,
    Timeout,
    Execution,
    Resource,
    InvalidState,
    Protocol,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Config => "ConfigError",
            Self::Connection => "ConnectionError",
            Self::Auth => "AuthError",
            Self::Timeout => "TimeoutError",
            Self::Execution => "ExecutionError",
            Self::Resource => "ResourceError",
            Self::InvalidState => "InvalidStateError",
            Self::Protocol => "ProtocolError",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while configuring, connecting to, or using MCP servers.
#[derive(Debug, Error)]
pub enum McpError {
    /// Unknown server name or malformed configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level connect or handshake failure.
    #[error("{transport} connection failed: {message}")]
    Connection { transport: TransportKind, message: String },

    /// OAuth state, verifier, or authorization code problem.
    #[error("authorization error: {0}")]
    Auth(String),

    /// Execution or network deadline exceeded.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// User code raised an error.
    #[error("execution error: {0}")]
    Execution(String),

    /// Sandbox provisioning or teardown failure.
    #[error("resource error: {0}")]
    Resource(String),

    /// Method called in a lifecycle state that does not permit it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The server answered with a JSON-RPC error object.
    #[error("server returned error {}: {}", .0.code, .0.message)]
    Protocol(JsonRpcError),
}

impl McpError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Execution(_) => ErrorKind::Execution,
            Self::Resource(_) => ErrorKind::Resource,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// Build a connection error for the given transport.
    pub fn connection(transport: TransportKind, message: impl Into<String>) -> Self {
        Self::Connection { transport, message: message.into() }
    }

    /// Build a "server not found" configuration error.
    pub fn server_not_found(name: &str) -> Self {
        Self::Config(format!("server '{}' not found", name))
    }

    /// One-line report in the form `Kind: message`, suitable for CLI output.
    pub fn report(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

impl From<JsonRpcError> for McpError {
    fn from(error: JsonRpcError) -> Self {
        Self::Protocol(error)
    }
}
