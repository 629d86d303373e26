use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC method used to initialize the backend.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Notification sent after a successful `initialize` round-trip.
pub const NOTIFY_INITIALIZED: &str = "initialized";
/// Creates a conversation and returns its `conversationId`.
pub const METHOD_NEW_CONVERSATION: &str = "newConversation";
/// Subscribes to events for an existing conversation. May be refused.
pub const METHOD_ADD_CONVERSATION_LISTENER: &str = "addConversationListener";
/// Sends user input items into a conversation.
pub const METHOD_SEND_USER_MESSAGE: &str = "sendUserMessage";
/// Server→client request asking whether a shell command may run.
pub const METHOD_EXEC_COMMAND_APPROVAL: &str = "execCommandApproval";
/// Server→client request asking whether a file patch may be applied.
pub const METHOD_APPLY_PATCH_APPROVAL: &str = "applyPatchApproval";

/// Identifier for outbound JSON-RPC calls.
pub type RequestId = u64;

/// Client metadata attached to the `initialize` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Sandbox policy passed to `newConversation`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SandboxMode {
    #[serde(rename = "workspace-write")]
    WorkspaceWrite,
    #[serde(rename = "danger-full-access")]
    DangerFullAccess,
}

/// Parameters for `newConversation`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConversationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub cwd: PathBuf,
    pub approval_policy: String,
    pub sandbox: SandboxMode,
}

impl NewConversationParams {
    /// Conversation request with the hub's fixed `on-request` approval policy.
    pub fn new(model: Option<String>, cwd: PathBuf, sandbox: SandboxMode) -> Self {
        Self {
            model,
            cwd,
            approval_policy: "on-request".to_string(),
            sandbox,
        }
    }
}

/// One input item for `sendUserMessage`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum InputItem {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image", rename_all = "camelCase")]
    Image { image_url: String },
    #[serde(rename = "localImage")]
    LocalImage { path: PathBuf },
}

impl InputItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Uncorrelated traffic surfaced by the transport.
#[derive(Clone, Debug)]
pub enum ServerEvent {
    /// Notification from the backend (`method` without `id`).
    Notification { method: String, params: Value },
    /// Server-initiated request (`id` and `method`); must be answered via
    /// `respond`/`respond_error`.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// One line of the child's stderr.
    Stderr { line: String },
    /// Stdout line that was not valid JSON, or JSON of no known shape.
    Unknown { raw: String },
    /// The subprocess exited or the transport was stopped. Terminal.
    Closed,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RpcErrorBody {
    pub(crate) code: i64,
    pub(crate) message: String,
}

pub(crate) enum Incoming {
    Response {
        id: Value,
        result: Option<Value>,
        error: Option<RpcErrorBody>,
    },
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Unknown(Value),
}

/// Classifies one parsed stdout object.
///
/// A response carries `id` plus `result` or `error`; a server→client request
/// carries `id` plus `method`; a notification carries `method` alone.
/// Anything else is unknown and non-fatal.
pub(crate) fn classify(value: Value) -> Incoming {
    let has_id = value.get("id").is_some();
    let has_result = value.get("result").is_some() || value.get("error").is_some();
    let method = value.get("method").and_then(Value::as_str).map(str::to_string);

    if has_id && has_result {
        let error = value
            .get("error")
            .cloned()
            .and_then(|err| serde_json::from_value(err).ok());
        return Incoming::Response {
            id: value.get("id").cloned().unwrap_or(Value::Null),
            result: value.get("result").cloned(),
            error,
        };
    }

    if let Some(method) = method {
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        let id = value.get("id").cloned();
        return match id {
            Some(id) => Incoming::Request { id, method, params },
            None => Incoming::Notification { method, params },
        };
    }

    Incoming::Unknown(value)
}
