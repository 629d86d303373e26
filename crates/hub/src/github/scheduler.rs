use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    config::GitHubConfig,
    github::{
        charter::{blockers_of, format_issue_prompt, parse_issue_body, parse_slas},
        worktree::worktree_paths,
        GitHubError, GitHubOps, IssueDetails, LABEL_DONE, LABEL_PR_ON_COMPLETE, LABEL_QUEUED,
        LABEL_REVIEW, LABEL_RUNNING, LABEL_STALLED, STATUS_MARKER,
    },
    hub::{Hub, SpawnOptions},
};

/// Upper bound on issues considered per poll.
const POLL_LIMIT: usize = 50;

fn issue_agent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^iss(\d+)$").expect("issue agent regex"))
}

/// The agent name carrying work for `issue_number`.
pub fn agent_name_for_issue(issue_number: u64) -> String {
    format!("iss{issue_number}")
}

/// `Some(n)` when an agent name is an issue agent.
pub fn issue_of_agent(name: &str) -> Option<u64> {
    issue_agent_re()
        .captures(name)
        .and_then(|cap| cap[1].parse().ok())
}

fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Durable per-issue agent state under `.orch/state/issue-<n>.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IssueState {
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub worktree: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub last_activity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stalled_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

pub fn issue_state_path(orch_root: &Path, issue_number: u64) -> PathBuf {
    orch_root
        .join("state")
        .join(format!("issue-{issue_number}.json"))
}

pub fn load_issue_state(orch_root: &Path, issue_number: u64) -> IssueState {
    let path = issue_state_path(orch_root, issue_number);
    std::fs::read_to_string(&path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

pub fn save_issue_state(orch_root: &Path, issue_number: u64, state: &IssueState) {
    let path = issue_state_path(orch_root, issue_number);
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(state)?;
        std::fs::write(&path, body)
    };
    if let Err(error) = write() {
        warn!(issue = issue_number, %error, "failed to persist issue state");
    }
}

/// Polls orchestrate-labeled issues and drives agents for the ready ones.
pub struct IssueScheduler {
    hub: Arc<Hub>,
    github: Arc<dyn GitHubOps>,
    config: GitHubConfig,
    repo_root: PathBuf,
    orch_root: PathBuf,
}

impl IssueScheduler {
    pub fn new(hub: Arc<Hub>, github: Arc<dyn GitHubOps>, repo_root: PathBuf) -> Self {
        let config = hub.config().github.clone();
        let orch_root = hub.config().orch_root();
        Self {
            hub,
            github,
            config,
            repo_root,
            orch_root,
        }
    }

    /// Poll loop; failures are logged and the next tick retried.
    pub async fn run(self) {
        let interval = Duration::from_secs(self.config.poll_secs.max(1));
        loop {
            if self.hub.is_stopping() {
                return;
            }
            if let Err(error) = self.poll_once().await {
                warn!(%error, "issue poll failed");
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// One scheduling pass: compute the ready set, spawn within capacity,
    /// and run stall detection for active issue agents.
    pub async fn poll_once(&self) -> Result<(), GitHubError> {
        let issues = self.github.list_orchestrate_issues(POLL_LIMIT).await?;

        let closed: HashSet<u64> = issues
            .iter()
            .filter(|i| !i.is_open())
            .map(|i| i.number)
            .collect();
        let open: HashSet<u64> = issues
            .iter()
            .filter(|i| i.is_open())
            .map(|i| i.number)
            .collect();
        let active = self.hub.active_issues().await;

        let ready: Vec<&IssueDetails> = issues
            .iter()
            .filter(|issue| issue.is_open())
            .filter(|issue| !active.contains(&issue.number) && !closed.contains(&issue.number))
            .filter(|issue| load_issue_state(&self.orch_root, issue.number).status != "complete")
            .filter(|issue| {
                blockers_of(issue)
                    .iter()
                    .all(|blocker| !open.contains(blocker))
            })
            .collect();

        let wip_limit = self.hub.config().wip_limit;
        let capacity = if wip_limit == 0 {
            ready.len()
        } else {
            wip_limit.saturating_sub(self.hub.sub_count().await)
        };

        for issue in ready.into_iter().take(capacity) {
            if let Err(error) = self.start_for_issue(issue).await {
                warn!(issue = issue.number, %error, "failed to start issue agent");
            }
        }

        self.detect_stalls(&active).await;
        Ok(())
    }

    async fn start_for_issue(&self, issue: &IssueDetails) -> Result<(), GitHubError> {
        let charter = parse_issue_body(&issue.body);
        let (branch, worktree) = worktree_paths(&self.repo_root, issue.number, &issue.title);
        self.github.ensure_worktree(&branch, &worktree).await?;

        let autopilot = self.hub.autopilot().await;
        let prompt = format!(
            "{}\n\nWork in this repo worktree only:\n- branch: {branch}\n- worktree: {}\n{}",
            format_issue_prompt(issue, &charter),
            worktree.display(),
            issue_tail(autopilot),
        );

        let slas = parse_slas(&issue.labels);
        let name = agent_name_for_issue(issue.number);
        let options = SpawnOptions {
            cwd: Some(worktree.clone()),
            issue_number: Some(issue.number),
            checkin_seconds: slas.checkin.map(|d| d.as_secs()),
            budget_seconds: slas.budget.map(|d| d.as_secs()),
        };
        if self.hub.spawn_sub(&name, &prompt, options).await.is_err() {
            // WIP races and duplicate names are retried on the next poll.
            return Ok(());
        }

        self.github
            .replace_labels(issue.number, &[LABEL_RUNNING], &[LABEL_QUEUED, LABEL_STALLED])
            .await
            .unwrap_or_else(|error| debug!(issue = issue.number, %error, "label update failed"));
        if let Err(error) = self
            .github
            .comment_issue(
                issue.number,
                &format!("Agent **{name}** started on worktree `{branch}` (`{}`).", worktree.display()),
            )
            .await
        {
            debug!(issue = issue.number, %error, "start comment failed");
        }

        match self.ensure_status_comment(issue.number, &name).await {
            Ok(comment_id) => self.hub.set_status_comment(&name, comment_id).await,
            Err(error) => debug!(issue = issue.number, %error, "status comment setup failed"),
        }

        save_issue_state(
            &self.orch_root,
            issue.number,
            &IssueState {
                agent: name,
                branch,
                worktree: worktree.display().to_string(),
                status: "running".to_string(),
                last_activity: now_ts(),
                ..IssueState::default()
            },
        );
        Ok(())
    }

    /// Finds the marker-anchored status comment, creating it if missing.
    async fn ensure_status_comment(
        &self,
        issue_number: u64,
        agent: &str,
    ) -> Result<u64, GitHubError> {
        let comments = self.github.list_comments(issue_number).await?;
        if let Some(existing) = comments.iter().find(|c| c.body.contains(STATUS_MARKER)) {
            return Ok(existing.id);
        }
        let body = format!("{STATUS_MARKER}\nAgent `{agent}` starting up.");
        self.github.create_comment(issue_number, &body).await
    }

    /// Marks issue agents silent past the stale window, once per stall.
    async fn detect_stalls(&self, active: &HashSet<u64>) {
        let stale_after = self.config.stale_minutes as f64 * 60.0;
        for &issue_number in active {
            let mut state = load_issue_state(&self.orch_root, issue_number);
            if state.status != "running" || state.stalled_at.is_some() {
                continue;
            }
            if state.last_activity <= 0.0 || now_ts() - state.last_activity <= stale_after {
                continue;
            }

            if let Err(error) = self
                .github
                .replace_labels(issue_number, &[LABEL_STALLED], &[])
                .await
            {
                debug!(issue = issue_number, %error, "stall label failed");
            }
            if let Err(error) = self
                .github
                .comment_issue(
                    issue_number,
                    "Agent appears stalled; orchestrator will triage.",
                )
                .await
            {
                debug!(issue = issue_number, %error, "stall comment failed");
            }
            state.stalled_at = Some(now_ts());
            save_issue_state(&self.orch_root, issue_number, &state);
        }
    }
}

fn issue_tail(autopilot: bool) -> String {
    let mut tail = String::from(
        "Deliver in small, testable increments and check in after each one. \
         When you finish a coherent step, write an end-of-step report.",
    );
    if autopilot {
        tail.push_str(
            " The hub is on autopilot: keep commits PR-sized so a pull request \
             can be opened from your branch when you complete.",
        );
    }
    tail
}

/// Mirrors hub events for issue agents back onto their GitHub issues.
pub async fn mirror_events(hub: Arc<Hub>, github: Arc<dyn GitHubOps>) {
    let orch_root = hub.config().orch_root();
    let mut events = hub.subscribe();

    while let Some(event) = events.recv().await {
        let Some(issue_number) = issue_of_agent(&event.who) else {
            continue;
        };

        match event.kind.as_str() {
            "agent_to_orch" => {
                let text = event
                    .payload
                    .get("text")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("")
                    .trim()
                    .to_string();
                if !text.is_empty() {
                    if let Err(error) = github.comment_issue(issue_number, &text).await {
                        debug!(issue = issue_number, %error, "mirror comment failed");
                    }
                }

                let mut state = load_issue_state(&orch_root, issue_number);
                let was_stalled = state.stalled_at.take().is_some();
                state.last_activity = now_ts();
                if state.status.is_empty() {
                    state.status = "running".to_string();
                }
                save_issue_state(&orch_root, issue_number, &state);

                if was_stalled {
                    if let Err(error) = github
                        .replace_labels(issue_number, &[], &[LABEL_STALLED])
                        .await
                    {
                        debug!(issue = issue_number, %error, "stall clear failed");
                    }
                }
            }
            "agent_removed" => {
                let mut state = load_issue_state(&orch_root, issue_number);
                state.status = "complete".to_string();
                state.completed_at = Some(now_ts());
                save_issue_state(&orch_root, issue_number, &state);

                let issue = match github.fetch_issue(issue_number).await {
                    Ok(issue) => Some(issue),
                    Err(error) => {
                        debug!(issue = issue_number, %error, "completion fetch failed");
                        None
                    }
                };

                let mut pr_url = None;
                if let Some(issue) = &issue {
                    if issue.has_label(LABEL_PR_ON_COMPLETE) && !state.branch.is_empty() {
                        let title = format!("Issue #{}: {}", issue.number, issue.title);
                        let body = format!("Closes #{}.", issue.number);
                        match github.ensure_pr(&state.branch, &title, &body).await {
                            Ok(url) => pr_url = url,
                            Err(error) => {
                                debug!(issue = issue_number, %error, "pr creation failed");
                            }
                        }
                    }
                }

                if let Some(url) = &pr_url {
                    state.pr_url = Some(url.clone());
                    save_issue_state(&orch_root, issue_number, &state);
                    if let Err(error) = github
                        .replace_labels(
                            issue_number,
                            &[LABEL_REVIEW],
                            &[LABEL_QUEUED, LABEL_RUNNING, LABEL_STALLED],
                        )
                        .await
                    {
                        debug!(issue = issue_number, %error, "review label failed");
                    }
                    if let Err(error) = github
                        .comment_issue(issue_number, &format!("Opened PR: {url}"))
                        .await
                    {
                        debug!(issue = issue_number, %error, "pr comment failed");
                    }
                } else {
                    if let Err(error) = github
                        .replace_labels(
                            issue_number,
                            &[LABEL_DONE],
                            &[LABEL_QUEUED, LABEL_RUNNING, LABEL_STALLED],
                        )
                        .await
                    {
                        debug!(issue = issue_number, %error, "done label failed");
                    }
                    if let Err(error) = github
                        .comment_issue(issue_number, "Agent finished; label set to agent:done.")
                        .await
                    {
                        debug!(issue = issue_number, %error, "done comment failed");
                    }
                }
            }
            _ => {}
        }
    }
}
