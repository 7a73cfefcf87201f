//! The two functions executed code can reach: tool search and tool invocation.

use std::collections::HashMap;
use std::sync::Arc;

use nucleo::pattern::{CaseMatching, Normalization, Pattern};
use nucleo::{Config as NucleoConfig, Matcher, Utf32Str};
use serde_json::{json, Value};

use super::DetailLevel;
use crate::error::{McpError, McpResult, TransportKind};
use crate::protocol::{CallToolResult, Tool};
use crate::session::{Session, SessionMap};
use crate::telemetry::{NoopTelemetry, Telemetry};

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolMatch {
    /// Owning server (the tool's namespace)
    pub server: String,
    pub tool: Tool,
    /// Fuzzy score; 0 for an empty query
    pub score: u32,
}

impl ToolMatch {
    /// Serialize at the requested detail level.
    pub fn to_value(&self, detail: DetailLevel) -> Value {
        let mut value = json!({ "name": self.tool.name, "server": self.server });
        if matches!(detail, DetailLevel::Descriptions | DetailLevel::Full) {
            value["description"] = json!(self.tool.description.clone().unwrap_or_default());
        }
        if detail == DetailLevel::Full {
            value["inputSchema"] = self.tool.input_schema.clone();
        }
        value
    }
}

/// Search and invoke tools across the live sessions.
#[derive(Clone)]
pub struct ToolBridge {
    sessions: SessionMap,
    telemetry: Arc<dyn Telemetry>,
}

impl ToolBridge {
    pub fn new(sessions: SessionMap) -> Self {
        Self { sessions, telemetry: Arc::new(NoopTelemetry) }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Ready sessions that expose tools to code, sorted by name.
    fn tool_sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.is_ready() && s.transport() != TransportKind::CodeMode)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.name().cmp(b.name()));
        sessions
    }

    /// Names of servers whose tools are visible.
    pub fn servers(&self) -> Vec<String> {
        self.tool_sessions().iter().map(|s| s.name().to_string()).collect()
    }

    /// Rank every visible tool against `query`. An empty query matches all.
    pub fn search_matches(&self, query: &str) -> Vec<ToolMatch> {
        let candidates: Vec<ToolMatch> = self
            .tool_sessions()
            .iter()
            .flat_map(|session| {
                let server = session.name().to_string();
                session
                    .tools()
                    .into_iter()
                    .map(move |tool| ToolMatch { server: server.clone(), tool, score: 0 })
            })
            .collect();

        let query = query.trim();
        if query.is_empty() {
            return candidates;
        }

        let mut matcher = Matcher::new(NucleoConfig::DEFAULT);
        let pattern = Pattern::parse(query, CaseMatching::Smart, Normalization::Smart);
        let mut buf = Vec::new();

        let mut scored: Vec<ToolMatch> = candidates
            .into_iter()
            .filter_map(|mut candidate| {
                let haystack = format!(
                    "{}.{} {}",
                    candidate.server,
                    candidate.tool.name,
                    candidate.tool.description.as_deref().unwrap_or_default()
                );
                let score = pattern.score(Utf32Str::new(&haystack, &mut buf), &mut matcher)?;
                candidate.score = score;
                Some(candidate)
            })
            .collect();

        // Stable sort keeps server/tool order among equal scores.
        scored.sort_by(|a, b| b.score.cmp(&a.score));
        scored
    }

    /// Search and serialize at `detail`.
    pub fn search(&self, query: &str, detail: DetailLevel) -> Vec<Value> {
        self.search_matches(query).iter().map(|m| m.to_value(detail)).collect()
    }

    /// The single server offering `tool`.
    pub fn resolve_server(&self, tool: &str) -> McpResult<String> {
        let owners: Vec<String> = self
            .tool_sessions()
            .iter()
            .filter(|s| s.tool(tool).is_some())
            .map(|s| s.name().to_string())
            .collect();

        match owners.as_slice() {
            [only] => Ok(only.clone()),
            [] => Err(McpError::Execution(format!("no connected server provides tool '{}'", tool))),
            many => Err(McpError::Execution(format!(
                "tool '{}' is provided by several servers ({}); pass the server name",
                tool,
                many.join(", ")
            ))),
        }
    }

    fn session(&self, server: &str) -> McpResult<Arc<Session>> {
        self.sessions
            .read()
            .get(server)
            .filter(|s| s.transport() != TransportKind::CodeMode)
            .cloned()
            .ok_or_else(|| McpError::server_not_found(server))
    }

    /// Invoke `server`'s `tool`. A tool-reported error becomes an execution error.
    pub async fn call_tool(&self, server: &str, tool: &str, args: Value) -> McpResult<Value> {
        let session = self.session(server)?;
        let arguments: Option<HashMap<String, Value>> = match args {
            Value::Null => None,
            Value::Object(map) => Some(map.into_iter().collect()),
            other => {
                return Err(McpError::Execution(format!(
                    "arguments for '{}' must be an object, got {}",
                    tool, other
                )))
            }
        };

        let outcome = session.call_tool(tool, arguments).await;
        let success = matches!(&outcome, Ok(result) if !result.is_error());
        self.telemetry.track_tool_call(server, tool, success);

        let result = outcome?;
        if result.is_error() {
            return Err(McpError::Execution(format!(
                "{}.{} failed: {}",
                server,
                tool,
                result.text_content()
            )));
        }
        Ok(tool_result_value(result))
    }
}

/// Reduce a tool result to the value scripts see.
///
/// Structured content wins; a single text part is parsed as JSON when possible.
pub fn tool_result_value(result: CallToolResult) -> Value {
    if let Some(structured) = result.structured_content {
        return structured;
    }
    let texts: Vec<&str> = result.content.iter().filter_map(|c| c.as_text()).collect();
    match texts.as_slice() {
        [single] => serde_json::from_str(single).unwrap_or_else(|_| Value::String((*single).to_string())),
        [] => serde_json::to_value(&result.content).unwrap_or(Value::Null),
        many => Value::String(many.join("\n")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToolContent;

    #[test]
    fn test_detail_levels_shape() {
        let hit = ToolMatch {
            server: "github".into(),
            tool: Tool {
                name: "create_issue".into(),
                description: Some("Open an issue".into()),
                input_schema: json!({ "type": "object" }),
            },
            score: 0,
        };

        let names = hit.to_value(DetailLevel::Names);
        assert!(names.get("description").is_none());
        assert!(names.get("inputSchema").is_none());
        assert_eq!(names["server"], "github");

        let descriptions = hit.to_value(DetailLevel::Descriptions);
        assert_eq!(descriptions["description"], "Open an issue");
        assert!(descriptions.get("inputSchema").is_none());

        let full = hit.to_value(DetailLevel::Full);
        assert_eq!(full["inputSchema"]["type"], "object");
    }

    #[test]
    fn test_tool_result_value() {
        let json_text = CallToolResult::text(r#"{"count": 3}"#, false);
        assert_eq!(tool_result_value(json_text), json!({ "count": 3 }));

        let plain = CallToolResult::text("hello", false);
        assert_eq!(tool_result_value(plain), json!("hello"));

        let structured = CallToolResult {
            content: vec![ToolContent::Text { text: "ignored".into() }],
            structured_content: Some(json!({ "ok": true })),
            is_error: None,
        };
        assert_eq!(tool_result_value(structured), json!({ "ok": true }));
    }

    #[test]
    fn test_empty_bridge() {
        let bridge = ToolBridge::new(SessionMap::default());
        assert!(bridge.servers().is_empty());
        assert!(bridge.search("", DetailLevel::Full).is_empty());
        assert!(bridge.resolve_server("anything").is_err());
    }
}
