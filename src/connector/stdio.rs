//! Child-process transport: newline-delimited JSON-RPC over stdin/stdout.

use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::pending::{dispatch_frame, PendingRequests};
use super::shutdown::{terminate_child, TERMINATE_GRACE};
use super::{encode_message, not_connected, with_timeout, Connector};
use crate::config::{expand_map, expand_value, ServerConfig, TransportConfig};
use crate::error::{McpError, McpResult, TransportKind};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest};

type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;

struct RunningProcess {
    child: Child,
    reader: JoinHandle<()>,
    stderr: Option<JoinHandle<()>>,
}

/// Connector for servers launched as child processes.
pub struct StdioConnector {
    name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<String>,
    timeout_ms: u64,
    pending: Arc<PendingRequests>,
    stdin: SharedStdin,
    process: Mutex<Option<RunningProcess>>,
    connected: Arc<AtomicBool>,
}

impl StdioConnector {
    /// Create a connector for a stdio server config.
    pub fn new(config: ServerConfig) -> McpResult<Self> {
        let TransportConfig::Stdio { command, args, env, cwd } = config.transport else {
            return Err(McpError::Config(format!("server '{}' is not a stdio server", config.name)));
        };
        Ok(Self {
            name: config.name,
            command,
            args,
            env,
            cwd,
            timeout_ms: config.timeout_ms,
            pending: Arc::new(PendingRequests::new()),
            stdin: Arc::new(Mutex::new(None)),
            process: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Process id of the running child, if any.
    pub async fn pid(&self) -> Option<u32> {
        self.process.lock().await.as_ref().and_then(|p| p.child.id())
    }

    fn spawn_reader(&self, stdout: tokio::process::ChildStdout) -> JoinHandle<()> {
        let name = self.name.clone();
        let pending = self.pending.clone();
        let stdin = self.stdin.clone();
        let connected = self.connected.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        tracing::trace!(server = %name, "-> {}", line);
                        if let Some(reply) = dispatch_frame(&name, line, &pending) {
                            match serde_json::to_string(&reply) {
                                Ok(text) => {
                                    if let Err(e) = write_line(&stdin, &text).await {
                                        tracing::debug!(server = %name, error = %e, "failed to answer server request");
                                    }
                                }
                                Err(e) => tracing::debug!(server = %name, error = %e, "unencodable reply"),
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(server = %name, error = %e, "stdout read failed");
                        break;
                    }
                }
            }

            connected.store(false, Ordering::SeqCst);
            let dropped = pending.fail_all();
            tracing::debug!(server = %name, dropped, "stdout closed");
        })
    }

    fn spawn_stderr_drain(&self, stderr: tokio::process::ChildStderr) -> JoinHandle<()> {
        let name = self.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(server = %name, "stderr: {}", line);
            }
        })
    }

    async fn send(&self, text: &str) -> McpResult<()> {
        tracing::trace!(server = %self.name, "<- {}", text);
        write_line(&self.stdin, text)
            .await
            .map_err(|e| McpError::connection(TransportKind::Stdio, format!("write failed: {}", e)))
    }
}

async fn write_line(stdin: &SharedStdin, text: &str) -> io::Result<()> {
    let mut guard = stdin.lock().await;
    let pipe = guard
        .as_mut()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed"))?;
    pipe.write_all(text.as_bytes()).await?;
    pipe.write_all(b"\n").await?;
    pipe.flush().await
}

#[async_trait]
impl Connector for StdioConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn connect(&self) -> McpResult<()> {
        let mut process = self.process.lock().await;
        if process.is_some() && self.is_connected() {
            return Ok(());
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(expand_map(&self.env))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(expand_value(cwd));
        }

        let mut child = cmd.spawn().map_err(|e| {
            McpError::connection(
                TransportKind::Stdio,
                format!("failed to spawn '{}': {}", self.command, e),
            )
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            return Err(McpError::connection(TransportKind::Stdio, "failed to capture child stdio"));
        };
        let stderr = child.stderr.take().map(|s| self.spawn_stderr_drain(s));

        *self.stdin.lock().await = Some(stdin);
        self.connected.store(true, Ordering::SeqCst);
        let reader = self.spawn_reader(stdout);

        tracing::debug!(server = %self.name, pid = child.id(), "spawned stdio server");
        *process = Some(RunningProcess { child, reader, stderr });
        Ok(())
    }

    async fn disconnect(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        // Closing stdin is the polite shutdown request for stdio servers.
        self.stdin.lock().await.take();

        if let Some(mut running) = self.process.lock().await.take() {
            if let Err(e) = terminate_child(&mut running.child, TERMINATE_GRACE).await {
                tracing::warn!(server = %self.name, error = %e, "failed to stop child process");
            }
            running.reader.abort();
            if let Some(stderr) = running.stderr {
                stderr.abort();
            }
        }

        self.pending.fail_all();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        if !self.is_connected() {
            return Err(not_connected(self.kind()));
        }

        let (id, rx) = self.pending.register();
        let text = encode_message(TransportKind::Stdio, method, &JsonRpcRequest::new(id, method, params))?;
        if let Err(e) = self.send(&text).await {
            self.pending.cancel(id);
            return Err(e);
        }

        let response = with_timeout(self.timeout_ms, method, async {
            rx.await.map_err(|_| {
                McpError::connection(TransportKind::Stdio, "server exited before responding")
            })
        })
        .await;
        if response.is_err() {
            self.pending.cancel(id);
        }

        Ok(response?.into_value()?)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        if !self.is_connected() {
            return Err(not_connected(self.kind()));
        }
        let text = encode_message(TransportKind::Stdio, method, &JsonRpcNotification::new(method, params))?;
        self.send(&text).await
    }
}
