//! Fire-and-forget usage reporting.
//!
//! The runtime calls into a [`Telemetry`] implementation at a few lifecycle
//! points. Implementations must never block or fail the caller; every method
//! has a no-op default body.

use std::sync::Arc;

use crate::error::{ErrorKind, TransportKind};

/// Environment variable that disables reporting when set to `false`.
pub const TELEMETRY_ENV_VAR: &str = "MCP_USE_ANONYMIZED_TELEMETRY";

/// Lifecycle event sink.
pub trait Telemetry: Send + Sync {
    /// A session reached `ready`.
    fn track_session_created(&self, _server: &str, _transport: TransportKind) {}

    /// A session was closed.
    fn track_session_closed(&self, _server: &str) {}

    /// A tool call finished.
    fn track_tool_call(&self, _server: &str, _tool: &str, _success: bool) {}

    /// A code execution finished.
    fn track_code_execution(&self, _duration_ms: u64, _error: Option<ErrorKind>) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {}

/// Emits events as `tracing` records under the `mcpfleet::telemetry` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn track_session_created(&self, server: &str, transport: TransportKind) {
        tracing::info!(target: "mcpfleet::telemetry", server, %transport, "session_created");
    }

    fn track_session_closed(&self, server: &str) {
        tracing::info!(target: "mcpfleet::telemetry", server, "session_closed");
    }

    fn track_tool_call(&self, server: &str, tool: &str, success: bool) {
        tracing::info!(target: "mcpfleet::telemetry", server, tool, success, "tool_call");
    }

    fn track_code_execution(&self, duration_ms: u64, error: Option<ErrorKind>) {
        let error = error.map(|k| k.to_string());
        tracing::info!(
            target: "mcpfleet::telemetry",
            duration_ms,
            error = error.as_deref().unwrap_or("none"),
            "code_execution"
        );
    }
}

/// Whether the environment allows reporting.
pub fn telemetry_enabled() -> bool {
    std::env::var(TELEMETRY_ENV_VAR)
        .map(|v| !v.trim().eq_ignore_ascii_case("false"))
        .unwrap_or(true)
}

/// Pick an implementation from the environment.
pub fn telemetry_from_env() -> Arc<dyn Telemetry> {
    if telemetry_enabled() {
        Arc::new(TracingTelemetry)
    } else {
        Arc::new(NoopTelemetry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_disabled_by_env() {
        std::env::set_var(TELEMETRY_ENV_VAR, "FALSE");
        assert!(!telemetry_enabled());
        std::env::remove_var(TELEMETRY_ENV_VAR);
    }

    #[test]
    #[serial]
    fn test_enabled_by_default() {
        std::env::remove_var(TELEMETRY_ENV_VAR);
        assert!(telemetry_enabled());
        std::env::set_var(TELEMETRY_ENV_VAR, "true");
        assert!(telemetry_enabled());
        std::env::remove_var(TELEMETRY_ENV_VAR);
    }

    #[test]
    fn test_noop_accepts_everything() {
        let t = NoopTelemetry;
        t.track_session_created("a", TransportKind::Stdio);
        t.track_tool_call("a", "b", false);
        t.track_code_execution(5, Some(ErrorKind::Timeout));
        t.track_session_closed("a");
    }
}
