//! Structured events streamed out of a sandbox run.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// One line of runner output, decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxEvent {
    /// A complete assistant turn
    Assistant { text: String },
    /// A partial token of an assistant turn
    Token { text: String },
    ToolStart {
        #[serde(default)]
        server: Option<String>,
        tool: String,
    },
    ToolEnd {
        #[serde(default)]
        server: Option<String>,
        tool: String,
        #[serde(default)]
        error: Option<String>,
    },
    /// The runner asks the host to invoke a tool and reply on stdin
    ToolCall {
        id: String,
        #[serde(default)]
        server: Option<String>,
        tool: String,
        #[serde(default)]
        args: Value,
    },
    /// Free-form output, including any line that is not an event
    Log { line: String },
    /// A server started by the running code is reachable at `url`
    McpServerReady { url: String },
    /// Terminal event of a run
    Result {
        #[serde(default)]
        value: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
}

impl SandboxEvent {
    /// Decode a stdout line. Anything that is not a known event becomes a log line.
    pub fn parse_line(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.starts_with('{') {
            if let Ok(event) = serde_json::from_str(trimmed) {
                return event;
            }
        }
        Self::Log { line: line.trim_end().to_string() }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result { .. })
    }
}

/// Pull side of a run's event channel.
///
/// Ends after the terminal `result` event, when the producer goes away, or
/// when no event arrives within the pull timeout. A pull timeout is treated as
/// completion, not as an error.
pub struct EventStream {
    rx: mpsc::Receiver<SandboxEvent>,
    pull_timeout: Duration,
    finished: bool,
    timed_out: bool,
}

impl EventStream {
    pub fn new(rx: mpsc::Receiver<SandboxEvent>, pull_timeout: Duration) -> Self {
        Self { rx, pull_timeout, finished: false, timed_out: false }
    }

    /// Next event, or `None` once the stream is complete.
    pub async fn next(&mut self) -> Option<SandboxEvent> {
        if self.finished {
            return None;
        }
        match tokio::time::timeout(self.pull_timeout, self.rx.recv()).await {
            Ok(Some(event)) => {
                if event.is_terminal() {
                    self.finished = true;
                }
                Some(event)
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(_) => {
                tracing::debug!(timeout_ms = self.pull_timeout.as_millis() as u64, "event stream idle, ending");
                self.finished = true;
                self.timed_out = true;
                None
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether the stream ended because it went quiet.
    pub fn ended_idle(&self) -> bool {
        self.timed_out
    }

    /// Drain every remaining event.
    pub async fn collect(mut self) -> Vec<SandboxEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_known_events() {
        let event = SandboxEvent::parse_line(r#"{"type":"tool_call","id":"1","tool":"search","args":{"q":"x"}}"#);
        assert_eq!(
            event,
            SandboxEvent::ToolCall { id: "1".into(), server: None, tool: "search".into(), args: json!({ "q": "x" }) }
        );

        let event = SandboxEvent::parse_line(r#"{"type":"mcp_server_ready","url":"http://h:3000"}"#);
        assert_eq!(event, SandboxEvent::McpServerReady { url: "http://h:3000".into() });

        let event = SandboxEvent::parse_line(r#"{"type":"result","value":4}"#);
        assert!(event.is_terminal());
    }

    #[test]
    fn test_non_event_lines_are_logs() {
        assert_eq!(SandboxEvent::parse_line("hello\n"), SandboxEvent::Log { line: "hello".into() });
        assert_eq!(
            SandboxEvent::parse_line(r#"{"type":"unknown"}"#),
            SandboxEvent::Log { line: r#"{"type":"unknown"}"#.into() }
        );
    }

    #[tokio::test]
    async fn test_stream_stops_at_result() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(SandboxEvent::Log { line: "a".into() }).await.unwrap();
        tx.send(SandboxEvent::Result { value: Some(json!(1)), error: None }).await.unwrap();
        tx.send(SandboxEvent::Log { line: "late".into() }).await.unwrap();

        let events = EventStream::new(rx, Duration::from_secs(5)).collect().await;
        assert_eq!(events.len(), 2);
        assert!(events[1].is_terminal());
    }

    #[tokio::test]
    async fn test_idle_timeout_is_completion() {
        let (_tx, rx) = mpsc::channel::<SandboxEvent>(1);
        let mut stream = EventStream::new(rx, Duration::from_millis(20));
        assert!(stream.next().await.is_none());
        assert!(stream.is_finished());
        assert!(stream.ended_idle());
    }
}
