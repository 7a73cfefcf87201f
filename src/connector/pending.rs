//! In-flight request table shared by the stream-oriented transports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::protocol::{
    IncomingMessage, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, METHOD_NOT_FOUND,
};

/// Maps request ids to the waiter for their response.
#[derive(Debug, Default)]
pub struct PendingRequests {
    next_id: AtomicI64,
    slots: Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self { next_id: AtomicI64::new(1), slots: Mutex::new(HashMap::new()) }
    }

    /// Allocate an id and a receiver for its response.
    pub fn register(&self) -> (i64, oneshot::Receiver<JsonRpcResponse>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.slots.lock().insert(id, tx);
        (id, rx)
    }

    /// Hand a response to its waiter. Returns false for unknown ids.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id.as_ref().and_then(numeric_id) else {
            return false;
        };
        match self.slots.lock().remove(&id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop the waiter for `id` (timed out or write failed).
    pub fn cancel(&self, id: i64) {
        self.slots.lock().remove(&id);
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub fn fail_all(&self) -> usize {
        let mut slots = self.slots.lock();
        let count = slots.len();
        slots.clear();
        count
    }

    /// Number of requests awaiting a response.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn numeric_id(id: &RequestId) -> Option<i64> {
    match id {
        RequestId::Number(n) => Some(*n),
        RequestId::String(s) => s.parse().ok(),
    }
}

/// Route one inbound frame. Returns a reply when the server sent a request.
pub fn dispatch_frame(server: &str, text: &str, pending: &PendingRequests) -> Option<JsonRpcResponse> {
    let message = match IncomingMessage::parse(text) {
        Ok(message) => message,
        Err(_) => {
            tracing::debug!(server, line = text, "skipping non-JSON-RPC output");
            return None;
        }
    };

    match message {
        IncomingMessage::Response(response) => {
            if !pending.resolve(response) {
                tracing::debug!(server, "dropping response with no waiter");
            }
            None
        }
        IncomingMessage::Notification(notification) => {
            tracing::debug!(server, method = %notification.method, "server notification");
            None
        }
        IncomingMessage::Request(request) => Some(reply_to(&request)),
    }
}

/// Answer a server-initiated request. Only `ping` is supported.
pub fn reply_to(request: &JsonRpcRequest) -> JsonRpcResponse {
    if request.method == "ping" {
        JsonRpcResponse::success(request.id.clone(), serde_json::json!({}))
    } else {
        JsonRpcResponse::failure(
            request.id.clone(),
            JsonRpcError::new(METHOD_NOT_FOUND, format!("client does not handle {}", request.method)),
        )
    }
}
