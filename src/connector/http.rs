//! Streamable HTTP transport.
//!
//! Each JSON-RPC message is POSTed to the server URL. Responses come back
//! either as a JSON body or as a short SSE stream whose `data:` frames carry
//! the response. The server may assign a session id via `Mcp-Session-Id`,
//! which is echoed on every later request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde_json::Value;

use super::{encode_message, not_connected, with_timeout, Connector};
use crate::auth::{OAuthFlow, OAuthProvider};
use crate::config::{expand_map, ServerConfig, TransportConfig};
use crate::error::{McpError, McpResult, TransportKind};
use crate::protocol::{IncomingMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};

/// Header carrying the server-assigned session id.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Connector for streamable HTTP servers.
pub struct HttpConnector {
    name: String,
    url: String,
    headers: HashMap<String, String>,
    timeout_ms: u64,
    client: Client,
    auth: Option<OAuthFlow>,
    session_id: RwLock<Option<String>>,
    next_id: AtomicI64,
    connected: AtomicBool,
}

impl HttpConnector {
    pub fn new(config: ServerConfig, auth: Option<std::sync::Arc<dyn OAuthProvider>>) -> McpResult<Self> {
        let TransportConfig::Http { url, headers } = config.transport else {
            return Err(McpError::Config(format!("server '{}' is not an HTTP server", config.name)));
        };
        reqwest::Url::parse(&url)
            .map_err(|e| McpError::Config(format!("server '{}': invalid URL: {}", config.name, e)))?;

        let client = Client::builder()
            .build()
            .map_err(|e| McpError::connection(TransportKind::Http, e.to_string()))?;

        Ok(Self {
            name: config.name,
            url,
            headers,
            timeout_ms: config.timeout_ms,
            client,
            auth: auth.map(OAuthFlow::new),
            session_id: RwLock::new(None),
            next_id: AtomicI64::new(1),
            connected: AtomicBool::new(false),
        })
    }

    /// Session id assigned by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    async fn build_headers(&self) -> McpResult<HeaderMap> {
        let mut map = HeaderMap::new();
        map.insert(ACCEPT, HeaderValue::from_static("application/json, text/event-stream"));
        map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        for (key, value) in expand_map(&self.headers) {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| McpError::Config(format!("invalid header name '{}': {}", key, e)))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| McpError::Config(format!("invalid value for header '{}': {}", key, e)))?;
            map.insert(name, value);
        }

        if let Some(session_id) = self.session_id() {
            if let Ok(value) = HeaderValue::from_str(&session_id) {
                map.insert(SESSION_HEADER, value);
            }
        }

        if let Some(flow) = &self.auth {
            if let Some(token) = flow.access_token().await? {
                let value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|_| McpError::Auth("access token is not a valid header value".to_string()))?;
                map.insert(AUTHORIZATION, value);
            }
        }
        Ok(map)
    }

    async fn post_once(&self, body: &str) -> McpResult<reqwest::Response> {
        let headers = self.build_headers().await?;
        self.client
            .post(&self.url)
            .headers(headers)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| McpError::connection(TransportKind::Http, format!("{}: {}", self.url, e)))
    }

    /// Send `body` and read the reply, authorizing and retrying once on 401.
    ///
    /// Each attempt gets its own timeout. Authorization runs between them,
    /// unbounded, since it may wait on a user.
    async fn round_trip(&self, method: &str, id: Option<i64>, body: &str) -> McpResult<Value> {
        if let Some(value) = self.attempt(method, id, body).await? {
            return Ok(value);
        }

        let Some(flow) = &self.auth else {
            return Err(McpError::Auth(format!(
                "server '{}' requires authorization but no auth provider is configured",
                self.name
            )));
        };
        tracing::info!(server = %self.name, "server requires authorization");
        flow.authorize_or_fail().await?;

        self.attempt(method, id, body).await?.ok_or_else(|| {
            McpError::Auth(format!("server '{}' rejected the new credentials", self.name))
        })
    }

    /// One timed POST. `None` when the server answers 401.
    async fn attempt(&self, method: &str, id: Option<i64>, body: &str) -> McpResult<Option<Value>> {
        with_timeout(self.timeout_ms, method, async {
            let response = self.post_once(body).await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                return Ok(None);
            }
            let response = self.check(response)?;
            match id {
                Some(id) => self.read_response(method, id, response).await.map(Some),
                None => Ok(Some(Value::Null)),
            }
        })
        .await
    }

    fn check(&self, response: reqwest::Response) -> McpResult<reqwest::Response> {
        if let Some(value) = response.headers().get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            let mut session_id = self.session_id.write();
            if session_id.as_deref() != Some(value) {
                *session_id = Some(value.to_string());
            }
        }

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else if status == StatusCode::NOT_FOUND && self.session_id().is_some() {
            // The server forgot our session.
            self.session_id.write().take();
            Err(McpError::connection(TransportKind::Http, "session expired on server"))
        } else {
            Err(McpError::connection(TransportKind::Http, format!("HTTP {} from {}", status, self.url)))
        }
    }

    async fn read_response(&self, method: &str, id: i64, response: reqwest::Response) -> McpResult<Value> {
        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let text = response
            .text()
            .await
            .map_err(|e| McpError::connection(TransportKind::Http, format!("reading {} response: {}", method, e)))?;

        let parsed = if is_sse {
            find_sse_response(&text, id)
        } else {
            serde_json::from_str::<JsonRpcResponse>(&text).ok()
        };
        let response = parsed.ok_or_else(|| {
            McpError::connection(TransportKind::Http, format!("no JSON-RPC response to {}", method))
        })?;

        Ok(response.into_value()?)
    }
}

/// Pick the response for `id` out of an SSE body.
pub(crate) fn find_sse_response(body: &str, id: i64) -> Option<JsonRpcResponse> {
    let wanted = RequestId::Number(id);
    let mut data = String::new();
    let mut events = Vec::new();

    for line in body.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        } else if line.is_empty() && !data.is_empty() {
            events.push(std::mem::take(&mut data));
        }
    }
    if !data.is_empty() {
        events.push(data);
    }

    events.into_iter().find_map(|event| match IncomingMessage::parse(&event) {
        Ok(IncomingMessage::Response(response)) if response.id.as_ref() == Some(&wanted) => {
            Some(response)
        }
        _ => None,
    })
}

#[async_trait]
impl Connector for HttpConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn connect(&self) -> McpResult<()> {
        // Streamable HTTP has no connection to open; reachability shows up on initialize.
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> McpResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(session_id) = self.session_id.write().take() {
            let result = self
                .client
                .delete(&self.url)
                .header(SESSION_HEADER, session_id)
                .timeout(std::time::Duration::from_secs(2))
                .send()
                .await;
            if let Err(e) = result {
                tracing::debug!(server = %self.name, error = %e, "session DELETE failed");
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        if !self.is_connected() {
            return Err(not_connected(self.kind()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = encode_message(TransportKind::Http, method, &JsonRpcRequest::new(id, method, params))?;
        tracing::trace!(server = %self.name, "<- {}", body);
        self.round_trip(method, Some(id), &body).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        if !self.is_connected() {
            return Err(not_connected(self.kind()));
        }
        let body = encode_message(TransportKind::Http, method, &JsonRpcNotification::new(method, params))?;
        self.round_trip(method, None, &body).await.map(|_| ())
    }
}
