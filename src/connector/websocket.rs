//! WebSocket transport: one JSON-RPC message per text frame.
//!
//! There is no automatic reconnect. When the socket closes, pending requests
//! fail and the connector reports disconnected; the caller decides what next.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::pending::{dispatch_frame, PendingRequests};
use super::{encode_message, not_connected, with_timeout, Connector};
use crate::auth::{OAuthFlow, OAuthProvider};
use crate::config::{expand_map, ServerConfig, TransportConfig};
use crate::error::{McpError, McpResult, TransportKind};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<Mutex<Option<SplitSink<WsStream, Message>>>>;

/// Connector for WebSocket servers.
pub struct WebSocketConnector {
    name: String,
    url: String,
    headers: HashMap<String, String>,
    timeout_ms: u64,
    auth: Option<OAuthFlow>,
    pending: Arc<PendingRequests>,
    sink: WsSink,
    reader: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
}

impl WebSocketConnector {
    pub fn new(config: ServerConfig, auth: Option<Arc<dyn OAuthProvider>>) -> McpResult<Self> {
        let TransportConfig::WebSocket { url, headers } = config.transport else {
            return Err(McpError::Config(format!("server '{}' is not a websocket server", config.name)));
        };
        Ok(Self {
            name: config.name,
            url,
            headers,
            timeout_ms: config.timeout_ms,
            auth: auth.map(OAuthFlow::new),
            pending: Arc::new(PendingRequests::new()),
            sink: Arc::new(Mutex::new(None)),
            reader: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn handshake(&self) -> Result<WsStream, tungstenite::Error> {
        let mut request = self.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        for (key, value) in expand_map(&self.headers) {
            match (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(&value)) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!(server = %self.name, header = %key, "skipping invalid header"),
            }
        }
        if let Some(flow) = &self.auth {
            match flow.access_token().await {
                Ok(Some(token)) => {
                    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                        headers.insert(tungstenite::http::header::AUTHORIZATION, value);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::debug!(server = %self.name, error = %e, "no usable token"),
            }
        }

        let (stream, _) = tokio_tungstenite::connect_async(request).await?;
        Ok(stream)
    }

    /// Handshake bounded by the connector timeout. The inner error is kept so
    /// a 401 can be told apart from other failures.
    async fn timed_handshake(&self) -> McpResult<Result<WsStream, tungstenite::Error>> {
        with_timeout(self.timeout_ms, "connect", async { Ok(self.handshake().await) }).await
    }

    fn spawn_reader(&self, mut stream: futures::stream::SplitStream<WsStream>) -> JoinHandle<()> {
        let name = self.name.clone();
        let pending = self.pending.clone();
        let sink = self.sink.clone();
        let connected = self.connected.clone();

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!(server = %name, error = %e, "websocket read failed");
                        break;
                    }
                };

                if let Some(reply) = dispatch_frame(&name, &text, &pending) {
                    if let Ok(body) = serde_json::to_string(&reply) {
                        if let Some(sink) = sink.lock().await.as_mut() {
                            let _ = sink.send(Message::Text(body)).await;
                        }
                    }
                }
            }

            connected.store(false, Ordering::SeqCst);
            let dropped = pending.fail_all();
            tracing::debug!(server = %name, dropped, "websocket closed");
        })
    }

    async fn send(&self, text: String) -> McpResult<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or_else(|| not_connected(TransportKind::WebSocket))?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| McpError::connection(TransportKind::WebSocket, format!("send failed: {}", e)))
    }
}

fn is_unauthorized(error: &tungstenite::Error) -> bool {
    matches!(error, tungstenite::Error::Http(response) if response.status() == StatusCode::UNAUTHORIZED)
}

#[async_trait]
impl Connector for WebSocketConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn connect(&self) -> McpResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let stream = match self.timed_handshake().await? {
            Ok(stream) => stream,
            Err(e) if is_unauthorized(&e) => {
                let flow = self.auth.as_ref().ok_or_else(|| {
                    McpError::Auth(format!(
                        "server '{}' requires authorization but no auth provider is configured",
                        self.name
                    ))
                })?;
                flow.authorize_or_fail().await?;
                self.timed_handshake().await?.map_err(|e| {
                    if is_unauthorized(&e) {
                        McpError::Auth(format!("server '{}' rejected the new credentials", self.name))
                    } else {
                        McpError::connection(TransportKind::WebSocket, e.to_string())
                    }
                })?
            }
            Err(e) => {
                return Err(McpError::connection(
                    TransportKind::WebSocket,
                    format!("{}: {}", self.url, e),
                ))
            }
        };

        let (sink, stream) = stream.split();
        *self.sink.lock().await = Some(sink);
        self.connected.store(true, Ordering::SeqCst);
        *self.reader.lock().await = Some(self.spawn_reader(stream));
        tracing::debug!(server = %self.name, url = %self.url, "websocket connected");
        Ok(())
    }

    async fn disconnect(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.send(Message::Close(None)).await {
                tracing::debug!(server = %self.name, error = %e, "close frame not sent");
            }
            let _ = sink.close().await;
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
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
        let text = encode_message(TransportKind::WebSocket, method, &JsonRpcRequest::new(id, method, params))?;
        if let Err(e) = self.send(text).await {
            self.pending.cancel(id);
            return Err(e);
        }

        let response = with_timeout(self.timeout_ms, method, async {
            rx.await.map_err(|_| {
                McpError::connection(TransportKind::WebSocket, "socket closed before responding")
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
        let text = encode_message(TransportKind::WebSocket, method, &JsonRpcNotification::new(method, params))?;
        self.send(text).await
    }
}
