use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    error::AppServerError,
    probe::probe_backend,
    protocol::{
        ClientInfo, InputItem, NewConversationParams, METHOD_ADD_CONVERSATION_LISTENER,
        METHOD_INITIALIZE, METHOD_NEW_CONVERSATION, METHOD_SEND_USER_MESSAGE, NOTIFY_INITIALIZED,
    },
    queue::EventQueue,
    transport::{AppServerTransport, TransportConfig},
};

/// Per-method call deadlines. `sendUserMessage` is long because the backend
/// only acknowledges once the turn has been accepted.
pub fn method_timeout(method: &str) -> Duration {
    match method {
        METHOD_INITIALIZE | METHOD_NEW_CONVERSATION => Duration::from_secs(30),
        METHOD_ADD_CONVERSATION_LISTENER => Duration::from_secs(10),
        METHOD_SEND_USER_MESSAGE => Duration::from_secs(600),
        _ => Duration::from_secs(60),
    }
}

/// The backend surface the hub consumes.
///
/// The real implementation is [`AppServerClient`]; tests swap in a scripted
/// mock so hub behavior is exercised without a subprocess. Typed conversation
/// helpers are provided as default methods on top of `call`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Sends a request with the standard per-method timeout.
    async fn call(&self, method: &str, params: Value) -> Result<Value, AppServerError>;

    /// Fire-and-forget notification.
    fn notify(&self, method: &str, params: Value) -> Result<(), AppServerError>;

    /// Replies to a server-initiated request.
    fn respond(&self, id: Value, result: Value) -> Result<(), AppServerError>;

    /// Replies to a server-initiated request with an error.
    fn respond_error(&self, id: Value, code: i64, message: &str) -> Result<(), AppServerError>;

    /// The queue of uncorrelated server traffic.
    fn events(&self) -> Arc<EventQueue>;

    /// Tears down the backend.
    async fn stop(&self);

    /// Creates a conversation and returns its id.
    async fn new_conversation(
        &self,
        params: NewConversationParams,
    ) -> Result<String, AppServerError> {
        let result = self
            .call(METHOD_NEW_CONVERSATION, serde_json::to_value(&params)?)
            .await?;
        extract_conversation_id(&result).ok_or_else(|| AppServerError::UnexpectedResult {
            method: METHOD_NEW_CONVERSATION.to_string(),
            detail: result.to_string(),
        })
    }

    /// Sends user input items into a conversation.
    async fn send_user_message(
        &self,
        conversation_id: &str,
        items: Vec<InputItem>,
    ) -> Result<Value, AppServerError> {
        self.call(
            METHOD_SEND_USER_MESSAGE,
            json!({
                "conversationId": conversation_id,
                "items": items,
            }),
        )
        .await
    }

    /// Convenience for a single text item.
    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<(), AppServerError> {
        self.send_user_message(conversation_id, vec![InputItem::text(text)])
            .await
            .map(|_| ())
    }

    /// Subscribes to conversation events. Refusal is surfaced, not fatal.
    async fn add_conversation_listener(
        &self,
        conversation_id: &str,
    ) -> Result<Value, AppServerError> {
        self.call(
            METHOD_ADD_CONVERSATION_LISTENER,
            json!({ "conversationId": conversation_id }),
        )
        .await
    }
}

/// Connected handle over a live `app-server` subprocess.
pub struct AppServerClient {
    transport: AppServerTransport,
}

impl AppServerClient {
    /// Probes the binary, spawns the subprocess, and runs the
    /// `initialize`/`initialized` handshake.
    pub async fn start(
        config: TransportConfig,
        client: ClientInfo,
    ) -> Result<Self, AppServerError> {
        probe_backend(&config.binary).await?;
        Self::start_unprobed(config, client).await
    }

    /// Spawns without the `--help` probe. Used by tests driving fake servers.
    pub async fn start_unprobed(
        config: TransportConfig,
        client: ClientInfo,
    ) -> Result<Self, AppServerError> {
        let transport = AppServerTransport::spawn(config).await?;
        let handle = Self { transport };
        handle.initialize(client).await?;
        Ok(handle)
    }

    async fn initialize(&self, client: ClientInfo) -> Result<(), AppServerError> {
        self.transport
            .call(
                METHOD_INITIALIZE,
                json!({ "clientInfo": client }),
                method_timeout(METHOD_INITIALIZE),
            )
            .await?;
        self.transport.notify(NOTIFY_INITIALIZED, Value::Null)
    }

    /// Raw call with an explicit timeout, bypassing the per-method table.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, AppServerError> {
        self.transport.call(method, params, timeout).await
    }
}

#[async_trait]
impl Backend for AppServerClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value, AppServerError> {
        self.transport
            .call(method, params, method_timeout(method))
            .await
    }

    fn notify(&self, method: &str, params: Value) -> Result<(), AppServerError> {
        self.transport.notify(method, params)
    }

    fn respond(&self, id: Value, result: Value) -> Result<(), AppServerError> {
        self.transport.respond(id, result)
    }

    fn respond_error(&self, id: Value, code: i64, message: &str) -> Result<(), AppServerError> {
        self.transport.respond_error(id, code, message)
    }

    fn events(&self) -> Arc<EventQueue> {
        self.transport.events()
    }

    async fn stop(&self) {
        self.transport.stop().await;
    }
}

/// The dialect has shipped several key spellings for the conversation id.
pub(crate) fn extract_conversation_id(result: &Value) -> Option<String> {
    ["conversationId", "conversation_id", "sessionId", "session_id", "id"]
        .iter()
        .find_map(|key| result.get(key))
        .and_then(|value| match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}
