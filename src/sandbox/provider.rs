//! Sandbox backends.
//!
//! [`SandboxProvider`] is the seam between the manager and whatever hosts the
//! sandboxes. [`HttpSandboxProvider`] talks to a sandbox API over HTTP:
//!
//! | Operation    | Request                                               |
//! |--------------|-------------------------------------------------------|
//! | create       | `POST /v1/sandboxes`                                  |
//! | upload       | `PUT /v1/sandboxes/{id}/files?path=..`                |
//! | start        | `POST /v1/sandboxes/{id}/processes`                   |
//! | stdout       | `GET /v1/sandboxes/{id}/processes/{pid}/logs?follow`  |
//! | stdin        | `POST /v1/sandboxes/{id}/processes/{pid}/stdin`       |
//! | probe port   | `GET /v1/sandboxes/{id}/ports/{port}`                 |
//! | kill         | `DELETE /v1/sandboxes/{id}`                           |

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::SandboxOptions;
use crate::error::{McpError, McpResult};

/// Identifies one provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub id: String,
}

/// A process started inside a sandbox, with its stdout split into lines.
#[derive(Debug)]
pub struct StartedProcess {
    pub pid: String,
    pub stdout: mpsc::Receiver<String>,
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self) -> McpResult<SandboxHandle>;

    async fn upload(&self, sandbox: &SandboxHandle, path: &str, contents: &[u8]) -> McpResult<()>;

    async fn start(&self, sandbox: &SandboxHandle, command: &str, args: &[String]) -> McpResult<StartedProcess>;

    /// Write one line to a process's stdin. The newline is appended.
    async fn write_stdin(&self, sandbox: &SandboxHandle, pid: &str, line: &str) -> McpResult<()>;

    /// Whether something is listening on `port` inside the sandbox.
    async fn probe_port(&self, sandbox: &SandboxHandle, port: u16) -> bool;

    /// URL under which `port` is reachable from the host.
    fn host_url(&self, sandbox: &SandboxHandle, port: u16) -> String;

    async fn kill(&self, sandbox: &SandboxHandle) -> McpResult<()>;
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Deserialize)]
struct PortResponse {
    #[serde(default)]
    open: bool,
}

/// Sandbox provider backed by a remote HTTP API.
pub struct HttpSandboxProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    template: Option<String>,
}

impl HttpSandboxProvider {
    pub fn new(options: &SandboxOptions) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: options.api_url.trim_end_matches('/').to_string(),
            api_key: options.api_key.clone(),
            template: options.template.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/sandboxes{}", self.api_url, path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("X-API-Key", key),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> McpResult<reqwest::Response> {
        let response = self
            .authed(builder)
            .send()
            .await
            .map_err(|e| McpError::Resource(format!("{} failed: {}", what, e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Resource(format!("{} failed with {}: {}", what, status, body.trim())));
        }
        Ok(response)
    }
}

/// Byte buffer that yields complete lines.
///
/// Bytes are decoded only once a whole line is present, so a multi-byte
/// character split across chunks survives intact.
#[derive(Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.bytes.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.bytes.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn rest(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Line payload with SSE framing removed, or `None` for framing-only lines.
fn event_payload(line: &str) -> Option<&str> {
    let line = line.trim_end_matches(['\r', '\n']);
    let line = line.strip_prefix("data:").map(str::trim_start).unwrap_or(line);
    if line.is_empty() || line.starts_with(':') || line.starts_with("event:") {
        return None;
    }
    Some(line)
}

/// Split a streamed body into lines, dropping SSE framing when present.
fn forward_lines<S, B, E>(body: S, tx: mpsc::Sender<String>)
where
    S: futures::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    tokio::spawn(async move {
        let mut body = std::pin::pin!(body);
        let mut buffer = LineBuffer::default();

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => buffer.extend(chunk.as_ref()),
                Err(e) => {
                    tracing::debug!(error = %e, "sandbox stdout stream failed");
                    break;
                }
            }

            while let Some(line) = buffer.next_line() {
                let Some(payload) = event_payload(&line) else {
                    continue;
                };
                if tx.send(payload.to_string()).await.is_err() {
                    return;
                }
            }
        }

        let rest = buffer.rest();
        if let Some(payload) = event_payload(rest.trim()) {
            let _ = tx.send(payload.to_string()).await;
        }
    });
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn create(&self) -> McpResult<SandboxHandle> {
        let body = json!({ "template": self.template });
        let response = self.send(self.client.post(self.url("")).json(&body), "sandbox creation").await?;
        let created: IdResponse = response
            .json()
            .await
            .map_err(|e| McpError::Resource(format!("malformed sandbox creation response: {}", e)))?;
        Ok(SandboxHandle { id: created.id })
    }

    async fn upload(&self, sandbox: &SandboxHandle, path: &str, contents: &[u8]) -> McpResult<()> {
        let url = format!("{}?path={}", self.url(&format!("/{}/files", sandbox.id)), urlencoding::encode(path));
        self.send(self.client.put(url).body(contents.to_vec()), "upload").await?;
        Ok(())
    }

    async fn start(&self, sandbox: &SandboxHandle, command: &str, args: &[String]) -> McpResult<StartedProcess> {
        let body = json!({ "command": command, "args": args });
        let response = self
            .send(self.client.post(self.url(&format!("/{}/processes", sandbox.id))).json(&body), "process start")
            .await?;
        let started: IdResponse = response
            .json()
            .await
            .map_err(|e| McpError::Resource(format!("malformed process start response: {}", e)))?;

        let logs_url = self.url(&format!("/{}/processes/{}/logs?follow=true&stream=stdout", sandbox.id, started.id));
        let logs = self.send(self.client.get(logs_url), "stdout subscription").await?;

        let (tx, rx) = mpsc::channel(256);
        forward_lines(logs.bytes_stream(), tx);
        Ok(StartedProcess { pid: started.id, stdout: rx })
    }

    async fn write_stdin(&self, sandbox: &SandboxHandle, pid: &str, line: &str) -> McpResult<()> {
        let url = self.url(&format!("/{}/processes/{}/stdin", sandbox.id, pid));
        let body = json!({ "data": format!("{}\n", line) });
        self.send(self.client.post(url).json(&body), "stdin write").await?;
        Ok(())
    }

    async fn probe_port(&self, sandbox: &SandboxHandle, port: u16) -> bool {
        let url = self.url(&format!("/{}/ports/{}", sandbox.id, port));
        match self.authed(self.client.get(url)).send().await {
            Ok(response) if response.status().is_success() => {
                response.json::<PortResponse>().await.map(|p| p.open).unwrap_or(false)
            }
            _ => false,
        }
    }

    fn host_url(&self, sandbox: &SandboxHandle, port: u16) -> String {
        self.url(&format!("/{}/proxy/{}", sandbox.id, port))
    }

    async fn kill(&self, sandbox: &SandboxHandle) -> McpResult<()> {
        self.send(self.client.delete(self.url(&format!("/{}", sandbox.id))), "sandbox teardown")
            .await?;
        Ok(())
    }
}
