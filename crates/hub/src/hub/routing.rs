use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use app_server::{ServerEvent, METHOD_APPLY_PATCH_APPROVAL, METHOD_EXEC_COMMAND_APPROVAL};

use crate::{
    agent::AgentState,
    control::{extract_control_blocks, strip_control_blocks, ControlBlock},
    error::HubError,
    local_exec::{default_allow_list, run_exec},
    text::extract_text,
};

use super::{Hub, APP_SERVER, ORCHESTRATOR};

/// Assistant-output notification methods, matched lowercased.
const ASSISTANT_METHODS: [&str; 4] = [
    "assistant_message",
    "agent_message",
    "response",
    "assistant_output",
];
const TASK_STARTED_METHODS: [&str; 3] = ["task_started", "status", "progress_started"];
const TASK_COMPLETE_METHODS: [&str; 2] = ["task_complete", "progress_complete"];
/// Benign exec lifecycle subtypes carried inside `codex/event/*`; they only
/// produce a status event.
const EXEC_STATUS_TYPES: [&str; 3] = [
    "exec_command_begin",
    "exec_command_end",
    "exec_command_output_delta",
];

/// Routing target derived from a notification's conversation id.
enum Target {
    Orchestrator,
    Sub(String),
    Unknown,
}

/// Drains the transport's event queue into the hub until it closes.
pub(crate) async fn event_pump(hub: Arc<Hub>) {
    let events = hub.backend.events();
    loop {
        match events.pop().await {
            ServerEvent::Notification { method, params } => {
                hub.handle_notification(&method, params).await;
            }
            ServerEvent::Request { id, method, params } => {
                hub.handle_request(id, &method, params).await;
            }
            ServerEvent::Stderr { line } => {
                hub.record_stderr(APP_SERVER, line).await;
            }
            ServerEvent::Unknown { raw } => {
                hub.bus.broadcast(APP_SERVER, "unknown", json!({ "raw": raw }));
            }
            ServerEvent::Closed => {
                hub.bus.broadcast(
                    APP_SERVER,
                    "error",
                    json!({ "message": "app-server transport closed" }),
                );
                hub.begin_shutdown();
                return;
            }
        }
    }
}

fn conversation_of(params: &Value) -> Option<String> {
    ["conversation_id", "session_id", "conversationId", "sessionId"]
        .iter()
        .find_map(|key| params.get(*key))
        .and_then(|value| match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

impl Hub {
    async fn resolve_target(&self, conversation: Option<&str>) -> Target {
        let Some(conversation) = conversation else {
            return Target::Unknown;
        };
        let state = self.state.lock().await;
        if state.orchestrator_conversation == conversation {
            return Target::Orchestrator;
        }
        match state.by_conversation.get(conversation) {
            Some(name) if name == ORCHESTRATOR => Target::Orchestrator,
            Some(name) => Target::Sub(name.clone()),
            None => Target::Unknown,
        }
    }

    pub(crate) async fn handle_notification(&self, method: &str, params: Value) {
        let method_lower = method.to_ascii_lowercase();

        // `codex/event/*` wraps the real payload one level down.
        if method_lower.starts_with("codex/event") {
            let msg = params.get("msg").cloned().unwrap_or(Value::Null);
            let inner_type = msg
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_ascii_lowercase();
            let conversation = conversation_of(&params).or_else(|| conversation_of(&msg));
            self.dispatch(&inner_type, &msg, conversation).await;
            return;
        }

        let conversation = conversation_of(&params);
        self.dispatch(&method_lower, &params, conversation).await;
    }

    async fn dispatch(&self, kind: &str, payload: &Value, conversation: Option<String>) {
        let target = self.resolve_target(conversation.as_deref()).await;

        if ASSISTANT_METHODS.contains(&kind) {
            let text = extract_text(payload);
            match target {
                Target::Orchestrator => self.handle_orchestrator_text(&text).await,
                Target::Sub(name) => self.handle_sub_text(&name, &text).await,
                Target::Unknown => {
                    self.bus.broadcast(
                        APP_SERVER,
                        "misc",
                        json!({ "method": kind, "params": payload }),
                    );
                }
            }
            return;
        }

        if TASK_STARTED_METHODS.contains(&kind) {
            if let Some(who) = target_name(&target) {
                self.set_agent_state(&who, AgentState::Working).await;
                self.touch_agent(&who).await;
                self.bus.broadcast(
                    &who,
                    "task_started",
                    json!({ "text": extract_text(payload) }),
                );
            }
            return;
        }

        if TASK_COMPLETE_METHODS.contains(&kind) {
            match target {
                Target::Orchestrator => {
                    self.set_agent_state(ORCHESTRATOR, AgentState::Idle).await;
                }
                Target::Sub(name) => {
                    self.set_agent_state(&name, AgentState::Idle).await;
                    let final_text = payload
                        .get("last_agent_message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| extract_text(payload));
                    self.handle_sub_complete(&name, &final_text).await;
                }
                Target::Unknown => {}
            }
            return;
        }

        if kind == "error" {
            let who = target_name(&target).unwrap_or_else(|| APP_SERVER.to_string());
            self.bus.broadcast(&who, "error", payload.clone());
            self.set_agent_state(&who, AgentState::Error).await;
            if let Target::Sub(name) = &target {
                let message = payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                self.tell_orchestrator(&format!("Sub-agent '{name}' error: {message}"))
                    .await;
                self.mark_dirty(name).await;
            }
            return;
        }

        if EXEC_STATUS_TYPES.contains(&kind) {
            let who = target_name(&target).unwrap_or_else(|| APP_SERVER.to_string());
            self.bus
                .broadcast(&who, "status", json!({ "subtype": kind }));
            return;
        }

        self.bus.broadcast(
            APP_SERVER,
            "misc",
            json!({ "method": kind, "params": payload }),
        );
    }

    /// Orchestrator text: strip and surface prose, then run control blocks
    /// in source order.
    async fn handle_orchestrator_text(&self, text: &str) {
        let blocks = extract_control_blocks(text);
        let display = strip_control_blocks(text);
        if !display.is_empty() {
            self.bus
                .broadcast(ORCHESTRATOR, "orch_to_user", json!({ "text": display }));
        }

        for raw in blocks {
            self.interpret_control(raw).await;
        }

        self.set_agent_state(ORCHESTRATOR, AgentState::Idle).await;
    }

    /// Sub-agent text: surface, archive, summarize, and mark for the digest.
    async fn handle_sub_text(&self, name: &str, text: &str) {
        self.bus
            .broadcast(name, "agent_to_orch", json!({ "text": text }));

        let artifact_id = match self
            .artifacts
            .store("agent_message", text, json!({ "agent": name }))
        {
            Ok(id) => Some(id),
            Err(error) => {
                warn!(%error, agent = name, "failed to store agent message artifact");
                None
            }
        };

        {
            let mut state = self.state.lock().await;
            let now = tokio::time::Instant::now();
            if let Some(agent) = state.subs.get_mut(name) {
                agent.last_checkin = now;
                agent.last_summary = crate::agent::summarize(text);
                if let Some(id) = &artifact_id {
                    agent.last_artifact_id = Some(id.clone());
                }
            }
            if let Some(meta) = state.meta.get_mut(name) {
                meta.last_event_at = now;
            }
            // A message from an errored agent revives it.
            if state.agent_state.get(name) == Some(&AgentState::Error) {
                state.agent_state.insert(name.to_string(), AgentState::Idle);
            }
        }

        self.mark_dirty(name).await;
    }

    /// Task completion: archive the final report and hand the decision back
    /// to the orchestrator.
    async fn handle_sub_complete(&self, name: &str, final_text: &str) {
        let artifact_id = match self
            .artifacts
            .store("agent_complete", final_text, json!({ "agent": name }))
        {
            Ok(id) => Some(id),
            Err(error) => {
                warn!(%error, agent = name, "failed to store completion artifact");
                None
            }
        };

        {
            let mut state = self.state.lock().await;
            let now = tokio::time::Instant::now();
            if let Some(agent) = state.subs.get_mut(name) {
                agent.last_checkin = now;
                if !final_text.is_empty() {
                    agent.last_summary = crate::agent::summarize(final_text);
                }
                if let Some(id) = &artifact_id {
                    agent.last_artifact_id = Some(id.clone());
                }
            }
            if let Some(meta) = state.meta.get_mut(name) {
                meta.last_event_at = now;
            }
        }

        self.tell_orchestrator(&format!(
            "Sub-agent '{name}' reports task complete.\n\
             Final update:\n{final_text}\n\
             To continue, emit CONTROL `send` or close with CONTROL `close`."
        ))
        .await;

        self.mark_dirty(name).await;
    }

    /// Runs one control block through the autopilot gate and policy checks.
    pub(crate) async fn interpret_control(&self, raw: Value) {
        let (autopilot, warned) = {
            let state = self.state.lock().await;
            (state.autopilot, state.autopilot_warned)
        };

        if !autopilot {
            let summary = ControlBlock::summary_key(&raw).to_string();
            self.bus.broadcast(
                ORCHESTRATOR,
                "autopilot_suppressed",
                json!({ "summary": summary, "control": raw }),
            );
            if !warned {
                self.state.lock().await.autopilot_warned = true;
                self.tell_orchestrator(
                    "HUB: autopilot is currently disabled; ignoring control blocks. \
                     Use :autopilot on to allow automated actions.",
                )
                .await;
            }
            return;
        }

        let block = match ControlBlock::parse(&raw) {
            Some(Ok(block)) => block,
            Some(Err(reason)) => {
                self.tell_orchestrator(&format!("HUB: {reason}.")).await;
                return;
            }
            None => {
                debug!(block = %raw, "control block with no recognized action");
                return;
            }
        };

        match block {
            ControlBlock::Spawn { name, task, cwd } => {
                self.bus.broadcast(
                    ORCHESTRATOR,
                    "orch_to_agent",
                    json!({ "action": "spawn", "agent": name, "text": task }),
                );
                let options = super::SpawnOptions {
                    cwd,
                    ..Default::default()
                };
                // Denials already message the orchestrator; nothing to add.
                if let Err(error) = self.spawn_sub(&name, &task, options).await {
                    debug!(%error, agent = %name, "spawn rejected");
                }
            }
            ControlBlock::Send { to, task } => {
                if let Err(error) = self.send_to_sub(&to, &task).await {
                    debug!(%error, agent = %to, "send rejected");
                }
            }
            ControlBlock::Close { agent, reason } => {
                self.bus.broadcast(
                    ORCHESTRATOR,
                    "orch_to_agent",
                    json!({
                        "action": "close",
                        "agent": agent,
                        "text": reason.unwrap_or_default(),
                    }),
                );
                if let Err(error) = self.close_sub(&agent).await {
                    debug!(%error, agent = %agent, "close rejected");
                }
            }
            ControlBlock::Exec { argv, cwd, env } => {
                if !self.config.dangerous {
                    self.bus.broadcast(
                        ORCHESTRATOR,
                        "exec",
                        json!({ "argv": argv, "denied": true }),
                    );
                    self.tell_orchestrator(&format!(
                        "HUB: exec denied ({}): {}.",
                        HubError::DangerousDisabled,
                        argv.join(" ")
                    ))
                    .await;
                    return;
                }
                let allow = default_allow_list();
                let result =
                    run_exec(&argv, cwd.as_deref(), &env, &allow, &self.config.cwd).await;
                self.bus.broadcast(
                    ORCHESTRATOR,
                    "exec",
                    json!({ "cmd": result.cmd, "ok": result.ok, "code": result.code }),
                );
                let report = serde_json::to_value(&result).unwrap_or(Value::Null);
                self.tell_orchestrator(&format!("```event\n{report}\n```"))
                    .await;
            }
            ControlBlock::Status { issue, text } => {
                self.bus.broadcast(
                    ORCHESTRATOR,
                    "status",
                    json!({ "issue": issue, "text": text }),
                );
                if let (Some(number), Some(github)) = (issue, self.github.as_ref()) {
                    if let Err(error) = github.comment_issue(number, &text).await {
                        warn!(%error, issue = number, "status comment failed");
                    }
                }
            }
            ControlBlock::Fetch {
                artifact,
                max_chars,
            } => match self.artifacts.load(&artifact, max_chars) {
                Ok((text, total)) => {
                    self.queue_extra_block(json!({
                        "type": "ARTIFACT",
                        "artifact": artifact,
                        "total_chars": total,
                        "text": text,
                    }))
                    .await;
                    self.maybe_send_digest("fetch").await;
                }
                Err(error) => {
                    self.tell_orchestrator(&format!(
                        "HUB: artifact '{artifact}' unavailable: {error}."
                    ))
                    .await;
                }
            },
        }
    }

    /// Approval requests: approve iff dangerous mode *and* autopilot are on.
    pub(crate) async fn handle_request(&self, id: Value, method: &str, params: Value) {
        if method != METHOD_EXEC_COMMAND_APPROVAL && method != METHOD_APPLY_PATCH_APPROVAL {
            if let Err(error) = self.backend.respond_error(id, -32601, "method not found") {
                warn!(%error, method, "failed to answer unknown server request");
            }
            return;
        }

        let autopilot = self.state.lock().await.autopilot;
        let approved = self.config.dangerous && autopilot;
        let decision = if approved { "approved" } else { "denied" };

        if let Err(error) = self.backend.respond(id, json!({ "decision": decision })) {
            warn!(%error, method, "failed to answer approval request");
        }

        self.bus.broadcast(
            APP_SERVER,
            "approval",
            json!({ "method": method, "decision": decision, "params": params }),
        );

        if !approved {
            let reason = if !autopilot {
                HubError::AutopilotDisabled.to_string()
            } else {
                HubError::DangerousDisabled.to_string()
            };
            self.tell_orchestrator(&format!("HUB: denied {method}: {reason}."))
                .await;
        }
    }

    /// Refreshes liveness bookkeeping without touching summaries.
    pub(crate) async fn touch_agent(&self, who: &str) {
        let mut state = self.state.lock().await;
        let now = tokio::time::Instant::now();
        if let Some(meta) = state.meta.get_mut(who) {
            meta.last_event_at = now;
        }
    }
}

fn target_name(target: &Target) -> Option<String> {
    match target {
        Target::Orchestrator => Some(ORCHESTRATOR.to_string()),
        Target::Sub(name) => Some(name.clone()),
        Target::Unknown => None,
    }
}
