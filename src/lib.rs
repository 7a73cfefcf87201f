//! # mcpfleet
//!
//! Client runtime for the Model Context Protocol that keeps many servers
//! connected at once, over different transports, from a single process.
//!
//! ## Features
//!
//! - **Transports**: stdio child processes, streamable HTTP and WebSocket
//! - **Sessions**: validated lifecycle per server, concurrent fan-out over all of them
//! - **OAuth**: PKCE authorization code flow, interactive or headless, durable token storage
//! - **Code mode**: run generated code that can search and call tools on every connected
//!   server, in an embedded VM or a remote sandbox
//!
//! ## Quick Start
//!
//! ```no_run
//! use mcpfleet::{McpConfig, SessionManager};
//!
//! # async fn demo() -> mcpfleet::McpResult<()> {
//! let config = McpConfig::from_file("mcp.json")?;
//! let manager = SessionManager::new(config);
//!
//! let report = manager.create_all_sessions().await;
//! for (server, error) in &report.failures {
//!     eprintln!("{}: {}", server, error.report());
//! }
//!
//! let result = manager.call_tool("github", "list_issues", None).await?;
//! println!("{}", result.text_content());
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::significant_drop_in_scrutinee)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::large_enum_variant)]
#![allow(clippy::result_large_err)]
#![allow(clippy::future_not_send)]

pub mod auth;
pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod executor;
pub mod protocol;
pub mod sandbox;
pub mod session;
pub mod telemetry;

pub use auth::{
    FileTokenStore, HeadlessOAuthProvider, InteractiveOAuthProvider, MemoryTokenStore, OAuthFlow,
    OAuthProvider, OAuthTokens, TokenStore,
};
pub use client::{AggregateReport, IdleSweeper, SessionManager, SessionManagerBuilder};
pub use config::{ClientOptions, CodeModeOptions, ExecutorKind, McpConfig, ServerConfig, TransportConfig};
pub use connector::{Connector, ConnectorFactory, DefaultConnectorFactory, CODE_MODE_SERVER};
pub use error::{ErrorKind, McpError, McpResult, TransportKind};
pub use executor::{CodeExecutionResult, CodeExecutor, DetailLevel, RemoteExecutor, ToolBridge, VmExecutor};
pub use sandbox::{EventStream, SandboxEvent, SandboxManager, SandboxSession};
pub use session::{Session, SessionState};
pub use telemetry::{NoopTelemetry, Telemetry, TracingTelemetry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "mcpfleet";
