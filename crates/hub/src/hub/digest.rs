use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use serde_json::{json, Value};
use tokio::{sync::Notify, time::Instant};
use tracing::warn;

use crate::agent::AgentState;

use super::Hub;

/// Single reusable debounce timer for the decision digest.
///
/// Arming an idle timer sets the fire deadline; arming an armed timer is a
/// no-op, so the digest fires one debounce window after the *first* dirty
/// mark. No task is spawned per event.
pub(crate) struct DebounceTimer {
    deadline: StdMutex<Option<Instant>>,
    notify: Notify,
}

impl DebounceTimer {
    pub(crate) fn new() -> Self {
        Self {
            deadline: StdMutex::new(None),
            notify: Notify::new(),
        }
    }

    pub(crate) fn arm(&self, delay: Duration) {
        let mut deadline = self.deadline.lock().unwrap_or_else(|e| e.into_inner());
        if deadline.is_none() {
            *deadline = Some(Instant::now() + delay);
            self.notify.notify_one();
        }
    }

    fn current_deadline(&self) -> Option<Instant> {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn clear(&self) {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Waits out the debounce window and emits the digest when it elapses.
pub(crate) async fn digest_timer_task(hub: Arc<Hub>) {
    loop {
        let notified = hub.digest_timer.notify.notified();
        match hub.digest_timer.current_deadline() {
            None => notified.await,
            Some(at) => {
                let sleep = tokio::time::sleep_until(at);
                tokio::select! {
                    _ = notified => {}
                    _ = sleep => {
                        hub.digest_timer.clear();
                        hub.send_digest("debounce").await;
                    }
                }
            }
        }
    }
}

struct DigestLine {
    agent: String,
    state: AgentState,
    silence_seconds: u64,
    summary: String,
    issue: Option<u64>,
    last_artifact: Option<String>,
}

impl Hub {
    /// Sends a digest immediately if the debounce window has already passed,
    /// otherwise (re)arms the timer.
    pub(crate) async fn maybe_send_digest(&self, reason: &str) {
        let due = {
            let state = self.state.lock().await;
            match state.last_digest {
                Some(last) => last.elapsed() >= self.config.debounce(),
                None => true,
            }
        };
        if due {
            self.send_digest(reason).await;
        } else {
            self.digest_timer.arm(self.config.debounce());
        }
    }

    /// Builds and delivers the decision digest for all dirty agents plus any
    /// queued extra blocks, then clears both.
    pub(crate) async fn send_digest(&self, reason: &str) {
        let (text, agents, conversation) = {
            let mut state = self.state.lock().await;
            if state.dirty.is_empty() && state.extra_blocks.is_empty() {
                return;
            }

            let now = Instant::now();
            let mut lines: Vec<DigestLine> = Vec::new();
            for name in &state.dirty {
                let Some(agent) = state.subs.get(name) else {
                    continue;
                };
                lines.push(DigestLine {
                    agent: name.clone(),
                    state: state
                        .agent_state
                        .get(name)
                        .copied()
                        .unwrap_or(AgentState::Idle),
                    silence_seconds: now.duration_since(agent.last_checkin).as_secs(),
                    summary: agent.last_summary.clone(),
                    issue: state.meta.get(name).and_then(|m| m.issue_number),
                    last_artifact: agent.last_artifact_id.clone(),
                });
            }
            let extras = std::mem::take(&mut state.extra_blocks);
            state.dirty.clear();
            state.last_digest = Some(now);
            Hub::push_decision(&mut state, reason);

            let agents: Vec<String> = lines.iter().map(|l| l.agent.clone()).collect();
            (
                render_digest(reason, &lines, &extras),
                agents,
                state.orchestrator_conversation.clone(),
            )
        };

        self.bus.broadcast(
            "hub",
            "decision",
            json!({ "reason": reason, "agents": agents }),
        );

        if conversation.is_empty() {
            return;
        }
        if let Err(error) = self.backend.send_text(&conversation, &text).await {
            warn!(%error, "failed to deliver digest to orchestrator");
        }
    }
}

fn render_digest(reason: &str, lines: &[DigestLine], extras: &[Value]) -> String {
    let mut out = format!("HUB DIGEST (reason: {reason})\n");

    for line in lines {
        out.push_str(&format!(
            "- {} [{}, last check-in {}s]\n",
            line.agent, line.state, line.silence_seconds
        ));
        if !line.summary.is_empty() {
            out.push_str(&format!("  > {}\n", line.summary));
        }
    }

    for line in lines {
        let mut update = json!({
            "type": "AGENT_UPDATE",
            "agent": line.agent,
            "state": line.state.to_string(),
        });
        if let Some(issue) = line.issue {
            update["issue"] = json!(issue);
        }
        if let Some(artifact) = &line.last_artifact {
            update["artifacts"] = json!({ "last_message": artifact });
        }
        out.push_str(&format!("```event\n{update}\n```\n"));
    }

    for extra in extras {
        out.push_str(&format!("```event\n{extra}\n```\n"));
    }

    out
}
