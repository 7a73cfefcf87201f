//! In-process executor built on an embedded `rhai` engine.
//!
//! Scripts run on a blocking thread with operation, call-depth and size
//! limits. The wall-clock deadline is enforced from the engine's progress
//! hook, which aborts evaluation at the next operation whether or not the
//! script cooperates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rhai::{Array, Dynamic, Engine, EvalAltResult, Map, Position};
use serde_json::Value;
use tokio::runtime::Handle;

use super::bridge::ToolBridge;
use super::{timeout_message, CodeExecutionResult, CodeExecutor, DetailLevel};
use crate::config::VmLimits;
use crate::error::{ErrorKind, McpError};
use crate::telemetry::{NoopTelemetry, Telemetry};

/// Extra time the host waits for the engine to notice an expired deadline.
const TERMINATION_GRACE: Duration = Duration::from_millis(500);

type Logs = Arc<Mutex<Vec<String>>>;

/// Local sandboxed script executor.
pub struct VmExecutor {
    bridge: ToolBridge,
    limits: VmLimits,
    telemetry: Arc<dyn Telemetry>,
    gate: tokio::sync::Mutex<()>,
}

impl VmExecutor {
    pub fn new(bridge: ToolBridge, limits: VmLimits) -> Self {
        Self {
            bridge,
            limits,
            telemetry: Arc::new(NoopTelemetry),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }
}

fn script_error(message: impl Into<String>) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(message.into()), Position::NONE).into()
}

fn to_json(value: &Dynamic) -> Result<Value, Box<EvalAltResult>> {
    rhai::serde::from_dynamic::<Value>(value)
}

fn to_dynamic(value: &Value) -> Result<Dynamic, Box<EvalAltResult>> {
    rhai::serde::to_dynamic(value)
}

/// Bridge calls from the blocking script thread back into the runtime.
#[derive(Clone)]
struct ScriptHost {
    bridge: ToolBridge,
    handle: Handle,
    deadline: Instant,
    timeout_ms: u64,
    /// Set once a tool call ran into the deadline.
    expired: Arc<AtomicBool>,
}

impl ScriptHost {
    fn expire(&self) -> Box<EvalAltResult> {
        self.expired.store(true, Ordering::SeqCst);
        script_error(timeout_message(self.timeout_ms))
    }

    fn search(&self, query: &str, detail: &str) -> Result<Dynamic, Box<EvalAltResult>> {
        let detail: DetailLevel = detail.parse().map_err(|e: McpError| script_error(e.to_string()))?;
        let hits = self.bridge.search(query, detail);
        to_dynamic(&Value::Array(hits))
    }

    fn call(&self, server: Option<&str>, tool: &str, args: Value) -> Result<Dynamic, Box<EvalAltResult>> {
        let server = match server {
            Some(server) => server.to_string(),
            None => self.bridge.resolve_server(tool).map_err(|e| script_error(e.to_string()))?,
        };

        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(self.expire());
        }

        let bridge = self.bridge.clone();
        let tool = tool.to_string();
        let outcome = self.handle.block_on(async move {
            tokio::time::timeout(remaining, bridge.call_tool(&server, &tool, args)).await
        });

        match outcome {
            Ok(Ok(value)) => to_dynamic(&value),
            Ok(Err(e)) => Err(script_error(e.to_string())),
            Err(_) => Err(self.expire()),
        }
    }
}

fn build_engine(limits: &VmLimits, logs: &Logs, host: &ScriptHost) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(limits.max_operations);
    engine.set_max_call_levels(limits.max_call_levels);
    engine.set_max_string_size(limits.max_string_size);
    engine.set_max_array_size(limits.max_array_size);
    engine.set_max_map_size(limits.max_map_size);

    let deadline = host.deadline;
    engine.on_progress(move |_| {
        if Instant::now() >= deadline {
            Some(Dynamic::from("timeout"))
        } else {
            None
        }
    });

    let sink = logs.clone();
    engine.on_print(move |text| sink.lock().push(text.to_string()));
    let sink = logs.clone();
    engine.on_debug(move |text, _source, _pos| sink.lock().push(format!("[debug] {}", text)));

    let h = host.clone();
    engine.register_fn("search_tools", move |query: &str| h.search(query, "full"));
    let h = host.clone();
    engine.register_fn("search_tools", move |query: &str, detail: &str| h.search(query, detail));

    let h = host.clone();
    engine.register_fn("call_tool", move |server: &str, tool: &str, args: Map| {
        h.call(Some(server), tool, to_json(&Dynamic::from_map(args))?)
    });
    let h = host.clone();
    engine.register_fn("call_tool", move |server: &str, tool: &str| {
        h.call(Some(server), tool, Value::Null)
    });
    let h = host.clone();
    engine.register_fn("call_tool", move |tool: &str, args: Map| {
        h.call(None, tool, to_json(&Dynamic::from_map(args))?)
    });

    let h = host.clone();
    engine.register_fn("list_servers", move || -> Array {
        h.bridge.servers().into_iter().map(Dynamic::from).collect()
    });

    engine
}

/// Map an engine failure to a message and kind. Thrown values are reported verbatim.
///
/// `expired` says whether a tool call hit the deadline; only then is a
/// runtime error a timeout.
fn describe_failure(err: &EvalAltResult, timeout_ms: u64, expired: bool) -> (ErrorKind, String) {
    match err {
        EvalAltResult::ErrorTerminated(..) => (ErrorKind::Timeout, timeout_message(timeout_ms)),
        EvalAltResult::ErrorRuntime(value, _) => {
            let message = value.clone().into_string().unwrap_or_else(|_| value.to_string());
            let kind = if expired { ErrorKind::Timeout } else { ErrorKind::Execution };
            (kind, message)
        }
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => describe_failure(inner, timeout_ms, expired),
        EvalAltResult::ErrorTooManyOperations(_)
        | EvalAltResult::ErrorStackOverflow(_)
        | EvalAltResult::ErrorDataTooLarge(..) => {
            (ErrorKind::Execution, format!("resource limit exceeded: {}", err))
        }
        EvalAltResult::ErrorParsing(..) => (ErrorKind::Execution, format!("syntax error: {}", err)),
        other => (ErrorKind::Execution, other.to_string()),
    }
}

fn run_script(code: &str, limits: &VmLimits, host: &ScriptHost) -> CodeExecutionResult {
    let logs: Logs = Arc::new(Mutex::new(Vec::new()));
    let engine = build_engine(limits, &logs, host);

    let outcome = engine.eval::<Dynamic>(code);
    let captured = std::mem::take(&mut *logs.lock());

    match outcome {
        Ok(value) if value.is_unit() => CodeExecutionResult::success(None, captured),
        Ok(value) => match to_json(&value) {
            Ok(json) => CodeExecutionResult::success(Some(json), captured),
            Err(e) => CodeExecutionResult::failure(
                ErrorKind::Execution,
                format!("result is not serializable: {}", e),
                captured,
            ),
        },
        Err(err) => {
            let expired = host.expired.load(Ordering::SeqCst);
            let (kind, message) = describe_failure(&err, host.timeout_ms, expired);
            CodeExecutionResult::failure(kind, message, captured)
        }
    }
}

#[async_trait]
impl CodeExecutor for VmExecutor {
    fn name(&self) -> &'static str {
        "vm"
    }

    async fn execute(&self, code: &str, timeout_ms: u64) -> CodeExecutionResult {
        let _exclusive = self.gate.lock().await;
        let started = Instant::now();

        let host = ScriptHost {
            bridge: self.bridge.clone(),
            handle: Handle::current(),
            deadline: started + Duration::from_millis(timeout_ms),
            timeout_ms,
            expired: Arc::new(AtomicBool::new(false)),
        };
        let limits = self.limits.clone();
        let code = code.to_string();

        let task = tokio::task::spawn_blocking(move || run_script(&code, &limits, &host));
        let wait = Duration::from_millis(timeout_ms) + TERMINATION_GRACE;

        let result = match tokio::time::timeout(wait, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => CodeExecutionResult::failure(
                ErrorKind::Execution,
                format!("script thread failed: {}", join_error),
                Vec::new(),
            ),
            // The engine thread is stuck outside the progress hook; abandon it.
            Err(_) => CodeExecutionResult::timed_out(timeout_ms, Vec::new()),
        };

        let elapsed = started.elapsed().as_millis() as u64;
        self.telemetry.track_code_execution(elapsed, result.error_kind);
        tracing::debug!(executor = "vm", elapsed_ms = elapsed, ok = result.is_success(), "execution finished");
        result.with_duration(elapsed)
    }
}
