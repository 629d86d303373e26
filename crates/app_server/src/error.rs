use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Errors surfaced while probing, spawning, or talking to the app-server.
#[derive(Debug, Error)]
pub enum AppServerError {
    #[error("backend `{binary}` does not support app-server: {reason}")]
    Probe { binary: PathBuf, reason: String },
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("app-server transport closed")]
    Closed,
    #[error("app-server returned JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("`{method}` timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("unexpected `{method}` result: {detail}")]
    UnexpectedResult { method: String, detail: String },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
