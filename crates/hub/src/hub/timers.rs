use std::{sync::Arc, time::Duration};

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use hub_events::OtelHeartbeat;

use crate::github::STATUS_MARKER;

use super::{Hub, ORCHESTRATOR};

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);
const SCHEDULER_INTERVAL: Duration = Duration::from_secs(60);
/// Extra silence tolerated after the budget wrap-up request before closing.
const CLOSE_GRACE_SECS: u64 = 60;
/// Issue agents silent at least this long get their status comment refreshed.
const STATUS_REFRESH_SECS: u64 = 180;

/// Flags overdue check-ins into the digest stream.
pub(crate) async fn watchdog(hub: Arc<Hub>) {
    loop {
        tokio::time::sleep(WATCHDOG_INTERVAL).await;

        let overdue: Vec<(String, u64)> = {
            let state = hub.state.lock().await;
            let now = tokio::time::Instant::now();
            state
                .subs
                .values()
                .filter_map(|agent| {
                    let checkin = state
                        .meta
                        .get(&agent.name)
                        .map(|m| m.checkin_seconds)
                        .unwrap_or(hub.config.checkin_seconds);
                    let silence = now.duration_since(agent.last_checkin).as_secs();
                    (silence > checkin).then(|| (agent.name.clone(), silence))
                })
                .collect()
        };

        for (name, seconds) in overdue {
            hub.queue_extra_block(json!({
                "type": "TIMEOUT_CHECKIN",
                "agent": name,
                "seconds": seconds,
            }))
            .await;
            hub.mark_dirty(&name).await;
        }
    }
}

struct ScheduledAction {
    name: String,
    conversation: String,
    nudge: bool,
    wrap_up: bool,
    close: bool,
    status_refresh: Option<StatusRefresh>,
}

struct StatusRefresh {
    comment_id: u64,
    issue: u64,
    state: crate::agent::AgentState,
    silence: u64,
    nudges: u32,
    max_nudges: u32,
}

/// Enforces nudge, budget, and status-comment policy per sub-agent.
pub(crate) async fn agent_scheduler(hub: Arc<Hub>) {
    loop {
        tokio::time::sleep(SCHEDULER_INTERVAL).await;

        let actions: Vec<ScheduledAction> = {
            let mut state = hub.state.lock().await;
            let now = tokio::time::Instant::now();
            let names: Vec<String> = state.subs.keys().cloned().collect();
            let mut actions = Vec::new();

            for name in names {
                let Some(conversation) =
                    state.subs.get(&name).map(|a| a.conversation_id.clone())
                else {
                    continue;
                };
                let agent_state = state
                    .agent_state
                    .get(&name)
                    .copied()
                    .unwrap_or(crate::agent::AgentState::Idle);
                let Some(meta) = state.meta.get_mut(&name) else {
                    continue;
                };

                let silence = now.duration_since(meta.last_event_at).as_secs();
                let elapsed = now.duration_since(meta.started_at).as_secs();

                let mut action = ScheduledAction {
                    name: name.clone(),
                    conversation,
                    nudge: false,
                    wrap_up: false,
                    close: false,
                    status_refresh: None,
                };

                if meta.closing_after_budget && silence > CLOSE_GRACE_SECS {
                    action.close = true;
                } else {
                    if silence > meta.checkin_seconds && meta.nudges_sent < meta.max_nudges {
                        meta.nudges_sent += 1;
                        action.nudge = true;
                    }
                    if elapsed > meta.budget_seconds && !meta.closing_after_budget {
                        meta.closing_after_budget = true;
                        action.wrap_up = true;
                    }
                }

                if let (Some(issue), Some(comment_id)) =
                    (meta.issue_number, meta.status_comment_id)
                {
                    if silence >= STATUS_REFRESH_SECS {
                        action.status_refresh = Some(StatusRefresh {
                            comment_id,
                            issue,
                            state: agent_state,
                            silence,
                            nudges: meta.nudges_sent,
                            max_nudges: meta.max_nudges,
                        });
                    }
                }

                if action.nudge || action.wrap_up || action.close || action.status_refresh.is_some()
                {
                    actions.push(action);
                }
            }
            actions
        };

        for action in actions {
            if action.close {
                debug!(agent = %action.name, "closing sub-agent after exhausted budget");
                if let Err(error) = hub.close_sub(&action.name).await {
                    debug!(%error, agent = %action.name, "budget close failed");
                }
                continue;
            }

            if action.nudge {
                let note =
                    "HUB: status check. What is your next small step? Any blockers? ETA?";
                if let Err(error) = hub.backend.send_text(&action.conversation, note).await {
                    warn!(%error, agent = %action.name, "nudge delivery failed");
                }
                hub.bus.broadcast(
                    ORCHESTRATOR,
                    "orch_to_agent",
                    json!({ "action": "nudge", "agent": action.name, "text": note }),
                );
            }

            if action.wrap_up {
                let note = "HUB: time budget exhausted. Wrap up now: summarize completed \
                            work and remaining gaps, then stop.";
                if let Err(error) = hub.backend.send_text(&action.conversation, note).await {
                    warn!(%error, agent = %action.name, "wrap-up delivery failed");
                }
                hub.bus.broadcast(
                    ORCHESTRATOR,
                    "orch_to_agent",
                    json!({ "action": "wrap_up", "agent": action.name, "text": note }),
                );
            }

            if let (Some(refresh), Some(github)) = (action.status_refresh, hub.github.as_ref()) {
                let body = format!(
                    "{STATUS_MARKER}\nAgent `{}` on issue #{}: {}; silent for {}s; \
                     nudges {}/{}.",
                    action.name,
                    refresh.issue,
                    refresh.state,
                    refresh.silence,
                    refresh.nudges,
                    refresh.max_nudges,
                );
                if let Err(error) = github.update_comment(refresh.comment_id, &body).await {
                    warn!(%error, issue = refresh.issue, "status comment refresh failed");
                }
            }
        }
    }
}

/// Treats OTEL spans as liveness signals for the matching agent.
pub(crate) async fn otel_pump(hub: Arc<Hub>, mut heartbeats: mpsc::Receiver<OtelHeartbeat>) {
    while let Some(beat) = heartbeats.recv().await {
        let who = {
            let mut state = hub.state.lock().await;
            let name = state
                .by_conversation
                .get(&beat.conversation_id)
                .cloned();
            if let Some(name) = &name {
                let now = tokio::time::Instant::now();
                if let Some(meta) = state.meta.get_mut(name) {
                    meta.last_event_at = now;
                }
            }
            name
        };
        if let Some(who) = who {
            hub.bus.broadcast(
                &who,
                "otel_heartbeat",
                json!({ "event": beat.event_name }),
            );
        }
    }
}
