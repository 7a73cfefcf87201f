//! Files uploaded into every sandbox, and the per-run query payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Python runner that executes one query and speaks the event protocol on stdout.
pub const RUNNER_SCRIPT: &str = include_str!("runner.py");

pub const RUNNER_PATH: &str = "runner.py";
pub const SYSTEM_PROMPT_PATH: &str = "system_prompt.md";

/// Interpreter command used to start a run.
pub const RUNNER_COMMAND: &str = "python3";

pub const SYSTEM_PROMPT: &str = "\
You are running inside an isolated sandbox with access to MCP tools.

Two functions are available to your code:
- search_tools(query, detail=\"full\") returns matching tools; detail is names, descriptions or full
- call_tool(server, tool, args) invokes a tool and returns its result

Assign the final answer to `result` or return it from the last expression.
If you start an HTTP server, listen on port 3000, 3001, 8000 or 8080.
";

/// Input of one run, written to the sandbox as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPayload {
    pub code: String,
    /// Tool catalog at full detail
    pub tools: Vec<Value>,
    pub servers: Vec<String>,
    pub timeout_ms: u64,
}

impl QueryPayload {
    /// Sandbox path for the `n`th query of a session.
    pub fn path(n: u64) -> String {
        format!("query-{}.json", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_speaks_event_protocol() {
        assert!(RUNNER_SCRIPT.contains("tool_call"));
        assert!(RUNNER_SCRIPT.contains("\"result\""));
        assert_eq!(QueryPayload::path(3), "query-3.json");
    }

    /// Run the bundled runner on `code` and return its terminal event.
    /// `None` when no Python interpreter is installed.
    fn run_locally(code: &str) -> Option<Value> {
        let dir = tempfile::tempdir().unwrap();
        let runner = dir.path().join(RUNNER_PATH);
        std::fs::write(&runner, RUNNER_SCRIPT).unwrap();
        let query = dir.path().join(QueryPayload::path(1));
        let payload = QueryPayload { code: code.into(), tools: vec![], servers: vec![], timeout_ms: 1_000 };
        std::fs::write(&query, serde_json::to_vec(&payload).unwrap()).unwrap();

        let output = std::process::Command::new(RUNNER_COMMAND).arg(&runner).arg(&query).output().ok()?;
        let stdout = String::from_utf8(output.stdout).unwrap();
        let last = stdout.lines().last()?;
        Some(serde_json::from_str(last).unwrap())
    }

    #[test]
    fn test_runner_returns_top_level_return() {
        let Some(event) = run_locally("return 2 + 2") else { return };
        assert_eq!(event["type"], "result");
        assert_eq!(event["value"], 4);
        assert!(event["error"].is_null());
    }

    #[test]
    fn test_runner_returns_trailing_expression() {
        let Some(event) = run_locally("x = 3\nprint('working')\nx * 2") else { return };
        assert_eq!(event["value"], 6);
    }

    #[test]
    fn test_runner_falls_back_to_result_variable() {
        let Some(event) = run_locally("result = {'ok': True}") else { return };
        assert_eq!(event["value"]["ok"], true);
    }
}
