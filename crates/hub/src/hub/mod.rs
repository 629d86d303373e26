mod digest;
mod routing;
mod timers;

pub(crate) use digest::DebounceTimer;

use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, Mutex},
    time::Instant,
};
use tracing::{debug, warn};

use app_server::{Backend, NewConversationParams, SandboxMode};
use hub_events::{Event, EventBus, OtelTailer, StateLog};

use crate::{
    agent::{normalize_agent_name, Agent, AgentMeta, AgentState},
    artifacts::ArtifactStore,
    config::HubConfig,
    error::HubError,
    github::GitHubOps,
};

/// Synthetic agent key for the backend process itself.
pub const APP_SERVER: &str = "app-server";
/// Name of the root planning agent.
pub const ORCHESTRATOR: &str = "orchestrator";

/// Per-agent stderr ring depth.
const STDERR_RING: usize = 500;
/// Decision log depth.
const DECISION_LOG_CAP: usize = 100;

const SUBAGENT_PREAMBLE: &str = "### SYSTEM MESSAGE (treat as system role) ###\n\
You are a SUB-AGENT named \"{name}\".\n\
Follow the task from the user. Provide succinct progress updates and, when finished,\n\
give a short summary and suggested next actions.";

fn orchestrator_preamble(autopilot: bool) -> String {
    let autopilot_line = if autopilot {
        "Autopilot is currently enabled: the hub will act on your control blocks."
    } else {
        "Autopilot is currently disabled: control blocks are logged but not executed."
    };
    format!(
        "You are the ORCHESTRATOR agent.\n\
Plan work, spin up named sub-agents, and iterate until goals are met.\n\
Emit control blocks in replies when you want the hub to act:\n\n\
```control\n{{\"spawn\":{{\"name\":\"<agent_name>\",\"task\":\"<task text>\",\"cwd\":null}}}}\n```\n\n\
```control\n{{\"send\":{{\"to\":\"<agent_name>\",\"task\":\"<follow-up instruction>\"}}}}\n```\n\n\
```control\n{{\"close\":{{\"agent\":\"<agent_name>\"}}}}\n```\n\n\
Also recognized: {{\"exec\":{{\"argv\":[...]}}}}, {{\"status\":{{\"issue\":N,\"text\":\"...\"}}}}, \
and {{\"fetch\":{{\"artifact\":\"<id>\"}}}}.\n\
Also write normal prose updates for the human.\n\
{autopilot_line}"
    )
}

/// Entry in the bounded decision log.
#[derive(Clone, Debug, serde::Serialize)]
pub struct DecisionEntry {
    pub ts: u64,
    pub who: String,
    pub action: String,
    pub reason: String,
}

/// Options for spawning a sub-agent outside the default SLA envelope.
#[derive(Clone, Debug, Default)]
pub struct SpawnOptions {
    pub cwd: Option<PathBuf>,
    pub issue_number: Option<u64>,
    pub checkin_seconds: Option<u64>,
    pub budget_seconds: Option<u64>,
}

/// Read-only view of one agent for observers.
#[derive(Clone, Debug)]
pub struct AgentSnapshot {
    pub name: String,
    pub conversation_id: String,
    pub state: AgentState,
    pub last_summary: String,
    pub last_artifact_id: Option<String>,
    pub issue_number: Option<u64>,
    pub silence_seconds: u64,
}

pub(crate) struct HubState {
    pub(crate) orchestrator_conversation: String,
    pub(crate) subs: HashMap<String, Agent>,
    pub(crate) by_conversation: HashMap<String, String>,
    pub(crate) agent_state: HashMap<String, AgentState>,
    pub(crate) meta: HashMap<String, AgentMeta>,
    pub(crate) issue_to_agent: HashMap<u64, String>,
    pub(crate) stderr_buf: HashMap<String, VecDeque<String>>,
    pub(crate) autopilot: bool,
    pub(crate) autopilot_warned: bool,
    pub(crate) dirty: BTreeSet<String>,
    pub(crate) extra_blocks: Vec<Value>,
    pub(crate) last_digest: Option<Instant>,
    pub(crate) decision_log: VecDeque<DecisionEntry>,
}

/// The supervisor: owns every agent map and is the only mutator of them.
///
/// All mutable state sits behind one mutex; each operation takes the lock,
/// mutates, and releases before invoking another operation, so hub state
/// transitions never interleave. Long-lived work (event pump, watchdog,
/// scheduler, digest timer) runs as tasks that are aborted on [`Hub::stop`].
pub struct Hub {
    pub(crate) config: HubConfig,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) bus: EventBus,
    pub(crate) artifacts: ArtifactStore,
    pub(crate) github: Option<Arc<dyn GitHubOps>>,
    pub(crate) state: Mutex<HubState>,
    pub(crate) digest_timer: DebounceTimer,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    stopping: AtomicBool,
}

impl Hub {
    pub fn new(
        config: HubConfig,
        backend: Arc<dyn Backend>,
        github: Option<Arc<dyn GitHubOps>>,
    ) -> Arc<Self> {
        let orch_root = config.orch_root();
        let bus = EventBus::new(Some(StateLog::new(orch_root.join("state.jsonl"))));
        let artifacts = ArtifactStore::new(&orch_root);
        let autopilot = config.autopilot;
        Arc::new(Self {
            config,
            backend,
            bus,
            artifacts,
            github,
            state: Mutex::new(HubState {
                orchestrator_conversation: String::new(),
                subs: HashMap::new(),
                by_conversation: HashMap::new(),
                agent_state: HashMap::new(),
                meta: HashMap::new(),
                issue_to_agent: HashMap::new(),
                stderr_buf: HashMap::new(),
                autopilot,
                autopilot_warned: false,
                dirty: BTreeSet::new(),
                extra_blocks: Vec::new(),
                last_digest: None,
                decision_log: VecDeque::new(),
            }),
            digest_timer: DebounceTimer::new(),
            tasks: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        self.bus.subscribe()
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Creates the orchestrator conversation, seeds it, and launches the
    /// hub's background tasks.
    pub async fn start(self: &Arc<Self>, seed: &str) -> Result<(), HubError> {
        let sandbox = if self.config.dangerous {
            SandboxMode::DangerFullAccess
        } else {
            SandboxMode::WorkspaceWrite
        };
        let conversation = self
            .backend
            .new_conversation(NewConversationParams::new(
                self.config.model.clone(),
                self.config.cwd.clone(),
                sandbox,
            ))
            .await?;

        let autopilot = {
            let mut state = self.state.lock().await;
            state.orchestrator_conversation = conversation.clone();
            state
                .by_conversation
                .insert(conversation.clone(), ORCHESTRATOR.to_string());
            state
                .agent_state
                .insert(APP_SERVER.to_string(), AgentState::Idle);
            state
                .agent_state
                .insert(ORCHESTRATOR.to_string(), AgentState::Idle);
            state.autopilot
        };

        self.backend
            .send_text(&conversation, &orchestrator_preamble(autopilot))
            .await?;
        self.backend
            .send_text(
                &conversation,
                &format!(
                    "HUB: Ready. You may emit CONTROL blocks to spawn or message sub-agents.\n\n\
                     Seed context:\n{seed}\n"
                ),
            )
            .await?;

        if let Err(error) = self.backend.add_conversation_listener(&conversation).await {
            debug!(%error, "addConversationListener refused; continuing");
        }

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(routing::event_pump(self.clone())));
        tasks.push(tokio::spawn(digest::digest_timer_task(self.clone())));
        tasks.push(tokio::spawn(timers::watchdog(self.clone())));
        tasks.push(tokio::spawn(timers::agent_scheduler(self.clone())));
        if let Some(otel_path) = &self.config.otel_log {
            let (heartbeats, tail_task) = OtelTailer::new(otel_path).spawn();
            tasks.push(tail_task);
            tasks.push(tokio::spawn(timers::otel_pump(self.clone(), heartbeats)));
        }
        drop(tasks);

        for who in [APP_SERVER, ORCHESTRATOR] {
            self.bus.broadcast(who, "agent_added", json!({ "agent": who }));
            self.bus
                .broadcast(who, "agent_state", json!({ "agent": who, "state": "idle" }));
        }
        self.bus
            .broadcast("hub", "autopilot_state", json!({ "enabled": autopilot }));

        Ok(())
    }

    /// Cancels all tasks and tears down the backend. Idempotent.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        drop(tasks);
        self.backend.stop().await;
    }

    pub(crate) fn begin_shutdown(self: &Arc<Self>) {
        if self.is_stopping() {
            return;
        }
        let hub = self.clone();
        tokio::spawn(async move { hub.stop().await });
    }

    pub async fn autopilot(&self) -> bool {
        self.state.lock().await.autopilot
    }

    /// Flips the autopilot gate and tells both the bus and the orchestrator.
    pub async fn set_autopilot(&self, enabled: bool) {
        let conversation = {
            let mut state = self.state.lock().await;
            if state.autopilot == enabled {
                return;
            }
            state.autopilot = enabled;
            state.autopilot_warned = false;
            state.orchestrator_conversation.clone()
        };
        self.bus
            .broadcast("hub", "autopilot_state", json!({ "enabled": enabled }));
        let state_text = if enabled { "enabled" } else { "disabled" };
        let note = format!("HUB: autopilot {state_text} by human controller.");
        if let Err(error) = self.backend.send_text(&conversation, &note).await {
            warn!(%error, "failed to notify orchestrator of autopilot change");
        }
    }

    /// Forwards human input to the orchestrator.
    pub async fn send_user_text(&self, text: &str) -> Result<(), HubError> {
        let conversation = self.orchestrator_conversation().await;
        self.bus
            .broadcast("user", "user_to_orch", json!({ "text": text }));
        self.backend.send_text(&conversation, text).await?;
        Ok(())
    }

    /// Creates a sub-agent conversation and registers it. Returns the
    /// canonical name.
    pub async fn spawn_sub(
        &self,
        raw_name: &str,
        task: &str,
        options: SpawnOptions,
    ) -> Result<String, HubError> {
        let name = normalize_agent_name(raw_name);
        if name == ORCHESTRATOR || name == "app_server" {
            self.tell_orchestrator(&format!("HUB: the name '{name}' is reserved."))
                .await;
            return Err(HubError::AgentExists(name));
        }

        {
            let state = self.state.lock().await;
            if state.subs.contains_key(&name) {
                drop(state);
                self.tell_orchestrator(&format!("HUB: sub-agent '{name}' already exists."))
                    .await;
                return Err(HubError::AgentExists(name));
            }
            let limit = self.config.wip_limit;
            if limit > 0 && state.subs.len() >= limit {
                drop(state);
                self.tell_orchestrator(&format!(
                    "HUB: WIP limit of {limit} reached; not spawning '{name}'."
                ))
                .await;
                return Err(HubError::WipLimitReached { limit });
            }
        }

        let sandbox = if self.config.dangerous {
            SandboxMode::DangerFullAccess
        } else {
            SandboxMode::WorkspaceWrite
        };
        let cwd = options.cwd.clone().unwrap_or_else(|| self.config.cwd.clone());
        let conversation = self
            .backend
            .new_conversation(NewConversationParams::new(
                self.config.model.clone(),
                cwd.clone(),
                sandbox,
            ))
            .await?;

        let preamble = SUBAGENT_PREAMBLE.replace("{name}", &name);
        self.backend
            .send_user_message(
                &conversation,
                vec![
                    app_server::InputItem::text(preamble),
                    app_server::InputItem::text(task),
                ],
            )
            .await?;

        if let Err(error) = self.backend.add_conversation_listener(&conversation).await {
            debug!(%error, agent = %name, "addConversationListener refused; continuing");
        }

        {
            let mut state = self.state.lock().await;
            let mut meta = AgentMeta::new(
                options
                    .checkin_seconds
                    .unwrap_or(self.config.checkin_seconds),
                options.budget_seconds.unwrap_or(self.config.budget_seconds),
                self.config.max_nudges,
                cwd,
            );
            meta.issue_number = options.issue_number;
            if let Some(issue) = options.issue_number {
                state.issue_to_agent.insert(issue, name.clone());
            }
            state
                .by_conversation
                .insert(conversation.clone(), name.clone());
            state
                .subs
                .insert(name.clone(), Agent::new(name.clone(), conversation.clone()));
            state.agent_state.insert(name.clone(), AgentState::Idle);
            state.meta.insert(name.clone(), meta);
            state
                .stderr_buf
                .insert(name.clone(), VecDeque::with_capacity(STDERR_RING.min(64)));
        }

        self.bus
            .broadcast(&name, "agent_added", json!({ "agent": name }));
        self.bus
            .broadcast(&name, "agent_state", json!({ "agent": name, "state": "idle" }));
        self.tell_orchestrator(&format!("HUB: spawned sub-agent '{name}'."))
            .await;

        Ok(name)
    }

    /// Sends follow-up text to an existing sub-agent.
    pub async fn send_to_sub(&self, raw_name: &str, task: &str) -> Result<String, HubError> {
        let name = normalize_agent_name(raw_name);
        let conversation = {
            let state = self.state.lock().await;
            state.subs.get(&name).map(|a| a.conversation_id.clone())
        };
        let Some(conversation) = conversation else {
            self.tell_orchestrator(&format!("HUB: no such sub-agent '{name}'."))
                .await;
            return Err(HubError::UnknownAgent(name));
        };

        self.bus.broadcast(
            ORCHESTRATOR,
            "orch_to_agent",
            json!({ "action": "send", "agent": name, "text": task }),
        );
        self.backend.send_text(&conversation, task).await?;
        self.tell_orchestrator(&format!("HUB: forwarded instruction to '{name}'."))
            .await;
        Ok(name)
    }

    /// Removes a sub-agent and purges every derived index.
    pub async fn close_sub(&self, raw_name: &str) -> Result<String, HubError> {
        let name = normalize_agent_name(raw_name);
        let removed = {
            let mut state = self.state.lock().await;
            match state.subs.remove(&name) {
                Some(agent) => {
                    state.by_conversation.remove(&agent.conversation_id);
                    state.agent_state.remove(&name);
                    state.stderr_buf.remove(&name);
                    state.dirty.remove(&name);
                    if let Some(meta) = state.meta.remove(&name) {
                        if let Some(issue) = meta.issue_number {
                            state.issue_to_agent.remove(&issue);
                        }
                    }
                    true
                }
                None => false,
            }
        };

        if !removed {
            self.tell_orchestrator(&format!("HUB: no such sub-agent '{name}'."))
                .await;
            return Err(HubError::UnknownAgent(name));
        }

        self.bus
            .broadcast(&name, "agent_removed", json!({ "agent": name }));
        self.tell_orchestrator(&format!("HUB: closed sub-agent '{name}'."))
            .await;
        Ok(name)
    }

    /// Records the pinned GitHub status comment for an issue agent.
    pub async fn set_status_comment(&self, name: &str, comment_id: u64) {
        let mut state = self.state.lock().await;
        if let Some(meta) = state.meta.get_mut(name) {
            meta.status_comment_id = Some(comment_id);
        }
    }

    pub async fn sub_count(&self) -> usize {
        self.state.lock().await.subs.len()
    }

    /// Issue numbers currently bound to an agent.
    pub async fn active_issues(&self) -> HashSet<u64> {
        self.state
            .lock()
            .await
            .issue_to_agent
            .keys()
            .copied()
            .collect()
    }

    pub async fn has_agent(&self, raw_name: &str) -> bool {
        let name = normalize_agent_name(raw_name);
        self.state.lock().await.subs.contains_key(&name)
    }

    pub async fn agents_snapshot(&self) -> Vec<AgentSnapshot> {
        let state = self.state.lock().await;
        let now = Instant::now();
        let mut snapshots: Vec<AgentSnapshot> = state
            .subs
            .values()
            .map(|agent| AgentSnapshot {
                name: agent.name.clone(),
                conversation_id: agent.conversation_id.clone(),
                state: state
                    .agent_state
                    .get(&agent.name)
                    .copied()
                    .unwrap_or(AgentState::Idle),
                last_summary: agent.last_summary.clone(),
                last_artifact_id: agent.last_artifact_id.clone(),
                issue_number: state.meta.get(&agent.name).and_then(|m| m.issue_number),
                silence_seconds: now.duration_since(agent.last_checkin).as_secs(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Last `n` stderr lines captured for an agent.
    pub async fn stderr_tail(&self, raw_name: &str, n: usize) -> Vec<String> {
        let name = normalize_agent_name(raw_name);
        let state = self.state.lock().await;
        state
            .stderr_buf
            .get(&name)
            .map(|ring| ring.iter().rev().take(n).rev().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn decision_log(&self) -> Vec<DecisionEntry> {
        self.state
            .lock()
            .await
            .decision_log
            .iter()
            .cloned()
            .collect()
    }

    pub(crate) async fn orchestrator_conversation(&self) -> String {
        self.state.lock().await.orchestrator_conversation.clone()
    }

    /// Best-effort prose to the orchestrator; failures are logged, not raised.
    pub(crate) async fn tell_orchestrator(&self, text: &str) {
        let conversation = self.orchestrator_conversation().await;
        if conversation.is_empty() {
            return;
        }
        if let Err(error) = self.backend.send_text(&conversation, text).await {
            warn!(%error, "failed to message orchestrator");
        }
    }

    /// Transitions an agent's state, broadcasting only on change.
    pub(crate) async fn set_agent_state(&self, who: &str, next: AgentState) {
        let changed = {
            let mut state = self.state.lock().await;
            let previous = state.agent_state.get(who).copied();
            if previous == Some(next) {
                false
            } else {
                state.agent_state.insert(who.to_string(), next);
                true
            }
        };
        if changed {
            self.bus.broadcast(
                who,
                "agent_state",
                json!({ "agent": who, "state": next.to_string() }),
            );
        }
    }

    pub(crate) async fn record_stderr(&self, who: &str, line: String) {
        let mut state = self.state.lock().await;
        let ring = state.stderr_buf.entry(who.to_string()).or_default();
        if ring.len() >= STDERR_RING {
            ring.pop_front();
        }
        ring.push_back(line.clone());
        drop(state);
        self.bus
            .broadcast(who, "agent_stderr", json!({ "line": line }));
    }

    /// Marks a sub-agent dirty and (re)arms the digest debounce window.
    pub(crate) async fn mark_dirty(&self, name: &str) {
        {
            let mut state = self.state.lock().await;
            state.dirty.insert(name.to_string());
        }
        self.digest_timer.arm(self.config.debounce());
    }

    /// Queues an extra fenced block for the next digest, deduplicating by
    /// `(type, agent)` so watchdog repeats do not pile up.
    pub(crate) async fn queue_extra_block(&self, block: Value) {
        {
            let mut state = self.state.lock().await;
            let key = |b: &Value| {
                (
                    b.get("type").and_then(Value::as_str).unwrap_or("").to_string(),
                    b.get("agent").and_then(Value::as_str).unwrap_or("").to_string(),
                )
            };
            let new_key = key(&block);
            if !new_key.0.is_empty() && state.extra_blocks.iter().any(|b| key(b) == new_key) {
                return;
            }
            state.extra_blocks.push(block);
        }
        self.digest_timer.arm(self.config.debounce());
    }

    pub(crate) fn push_decision(state: &mut HubState, reason: &str) {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if state.decision_log.len() >= DECISION_LOG_CAP {
            state.decision_log.pop_front();
        }
        state.decision_log.push_back(DecisionEntry {
            ts,
            who: "hub".to_string(),
            action: "digest_sent".to_string(),
            reason: reason.to_string(),
        });
    }
}
