//! Code mode: run generated code with a tool search-and-invoke bridge.
//!
//! Two executors implement [`CodeExecutor`]:
//! - [`VmExecutor`] runs scripts in an embedded, resource-limited interpreter
//! - [`RemoteExecutor`] runs them inside an ephemeral remote sandbox
//!
//! Both see the session manager's live sessions through a [`ToolBridge`].
//! Failures inside the code are reported in [`CodeExecutionResult::error`],
//! never as an `Err`, so partial logs survive.

mod bridge;
mod remote;
mod vm;

pub use bridge::{ToolBridge, ToolMatch};
pub use remote::{EventCallback, RemoteExecutor, ServerReadyCallback};
pub use vm::VmExecutor;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, McpError};

/// How much of each tool `search_tools` serializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetailLevel {
    /// Name and owning server only
    Names,
    /// Adds the description
    Descriptions,
    /// Adds the input schema
    #[default]
    Full,
}

impl FromStr for DetailLevel {
    type Err = McpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "names" | "name" => Ok(Self::Names),
            "descriptions" | "description" => Ok(Self::Descriptions),
            "full" => Ok(Self::Full),
            other => Err(McpError::Execution(format!(
                "unknown detail level '{}' (expected names, descriptions or full)",
                other
            ))),
        }
    }
}

impl fmt::Display for DetailLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Names => "names",
            Self::Descriptions => "descriptions",
            Self::Full => "full",
        })
    }
}

/// Outcome of one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeExecutionResult {
    /// Value of the script, `None` when it produced nothing or failed
    pub result: Option<Value>,
    /// Captured output lines, in order
    pub logs: Vec<String>,
    /// Failure message, `None` on success
    pub error: Option<String>,
    /// Classification of `error`
    #[serde(skip)]
    pub error_kind: Option<ErrorKind>,
    /// Wall-clock duration
    pub execution_time_ms: u64,
}

impl CodeExecutionResult {
    pub fn success(result: Option<Value>, logs: Vec<String>) -> Self {
        Self { result, logs, ..Self::default() }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>, logs: Vec<String>) -> Self {
        Self { error: Some(message.into()), error_kind: Some(kind), logs, ..Self::default() }
    }

    /// Failure for an expired deadline. The message always contains "timed out".
    pub fn timed_out(timeout_ms: u64, logs: Vec<String>) -> Self {
        Self::failure(ErrorKind::Timeout, timeout_message(timeout_ms), logs)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Set the measured duration.
    pub fn with_duration(mut self, ms: u64) -> Self {
        self.execution_time_ms = ms;
        self
    }
}

pub(crate) fn timeout_message(timeout_ms: u64) -> String {
    format!("Execution timed out after {}ms", timeout_ms)
}

/// Runs caller-supplied code against the tool bridge.
///
/// One executor runs one execution at a time; separate executors are
/// independent.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    /// Short name for logs ("vm", "remote").
    fn name(&self) -> &'static str;

    /// Run `code`, forcibly stopping it after `timeout_ms`.
    async fn execute(&self, code: &str, timeout_ms: u64) -> CodeExecutionResult;

    /// Release held resources.
    async fn cleanup(&self) {}
}
