//! Remote sandboxes for code mode.
//!
//! A [`SandboxManager`] provisions one ephemeral sandbox per logical session,
//! uploads the runner, and starts a fresh process for every query. Runner
//! stdout is decoded into [`SandboxEvent`]s and delivered through an
//! [`EventStream`]. While a query runs, a watcher probes well-known ports and
//! reports a server started by the code as `mcp_server_ready`.

mod events;
mod manager;
mod provider;
mod runtime;

pub use events::{EventStream, SandboxEvent};
pub use manager::{SandboxManager, SandboxSession};
pub use provider::{HttpSandboxProvider, SandboxHandle, SandboxProvider, StartedProcess};
pub use runtime::{QueryPayload, RUNNER_SCRIPT, SYSTEM_PROMPT};

#[cfg(test)]
pub(crate) use manager::tests::ScriptedProvider;
