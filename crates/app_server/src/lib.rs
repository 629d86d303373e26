#![forbid(unsafe_code)]
//! Async client for the Codex `app-server` backend.
//!
//! The backend is an external binary that speaks line-delimited JSON-RPC 2.0
//! over stdio: one UTF-8 JSON object per line on stdin and stdout. This crate
//! owns the subprocess for its whole lifetime and multiplexes four kinds of
//! traffic over the single pipe pair:
//!
//! - **responses** to our requests, correlated by monotonic integer id;
//! - **server→client requests** (approval prompts) that expect a reply;
//! - **notifications** (assistant output, task lifecycle, `codex/event/*`);
//! - raw **stderr** lines from the child.
//!
//! Correlated responses resolve the caller's pending future; everything else
//! is fanned out through a bounded [`EventQueue`] that drops the oldest entry
//! on overflow so the reader never blocks on a slow consumer. Invalid JSON on
//! stdout is surfaced as [`ServerEvent::Unknown`], never a hard error.
//!
//! [`AppServerClient`] layers the `initialize`/`initialized` handshake, typed
//! conversation helpers, and per-method timeouts on top of the raw transport.
//! Consumers that want to script the backend in tests implement [`Backend`]
//! instead of spawning a real process.

mod client;
mod error;
mod probe;
mod protocol;
mod queue;
mod transport;

pub use client::{method_timeout, AppServerClient, Backend};
pub use error::AppServerError;
pub use probe::{probe_backend, BackendProbe};
pub use protocol::{
    ClientInfo, InputItem, NewConversationParams, RequestId, SandboxMode, ServerEvent,
    METHOD_ADD_CONVERSATION_LISTENER, METHOD_APPLY_PATCH_APPROVAL, METHOD_EXEC_COMMAND_APPROVAL,
    METHOD_INITIALIZE, METHOD_NEW_CONVERSATION, METHOD_SEND_USER_MESSAGE, NOTIFY_INITIALIZED,
};
pub use queue::EventQueue;
pub use transport::{AppServerTransport, TransportConfig};

#[cfg(test)]
mod test_support;
