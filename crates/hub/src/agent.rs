use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Cap applied to `last_summary` (first line of the last message).
pub const SUMMARY_MAX_CHARS: usize = 300;

/// Lifecycle state of one agent conversation.
///
/// `created → idle → working → idle`; an error message parks the agent in
/// `Error` until the next message moves it back. `closed` is represented by
/// removal from the hub's maps.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Working,
    Error,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Idle => "idle",
            AgentState::Working => "working",
            AgentState::Error => "error",
        };
        f.write_str(name)
    }
}

/// One supervised sub-agent conversation.
#[derive(Clone, Debug)]
pub struct Agent {
    pub name: String,
    pub conversation_id: String,
    pub last_checkin: Instant,
    pub last_summary: String,
    pub last_artifact_id: Option<String>,
}

impl Agent {
    pub fn new(name: String, conversation_id: String) -> Self {
        Self {
            name,
            conversation_id,
            last_checkin: Instant::now(),
            last_summary: String::new(),
            last_artifact_id: None,
        }
    }
}

/// SLA and bookkeeping attached to each sub-agent.
#[derive(Clone, Debug)]
pub struct AgentMeta {
    pub issue_number: Option<u64>,
    pub started_at: Instant,
    pub last_event_at: Instant,
    pub checkin_seconds: u64,
    pub budget_seconds: u64,
    pub nudges_sent: u32,
    pub max_nudges: u32,
    pub status_comment_id: Option<u64>,
    pub workspace: PathBuf,
    pub closing_after_budget: bool,
}

impl AgentMeta {
    pub fn new(checkin_seconds: u64, budget_seconds: u64, max_nudges: u32, workspace: PathBuf) -> Self {
        let now = Instant::now();
        Self {
            issue_number: None,
            started_at: now,
            last_event_at: now,
            checkin_seconds,
            budget_seconds,
            nudges_sent: 0,
            max_nudges,
            status_comment_id: None,
            workspace,
            closing_after_budget: false,
        }
    }
}

/// Canonicalizes an agent name: lowercase, runs of non-`[a-z0-9]` become a
/// single `_`, leading/trailing `_` stripped, empty falls back to `"agent"`.
pub fn normalize_agent_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut gap = false;
    for ch in raw.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            if gap && !out.is_empty() {
                out.push('_');
            }
            gap = false;
            out.push(ch);
        } else {
            gap = true;
        }
    }
    if out.is_empty() {
        "agent".to_string()
    } else {
        out
    }
}

/// First non-empty line of `text`, truncated to [`SUMMARY_MAX_CHARS`].
pub fn summarize(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");
    line.chars().take(SUMMARY_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_examples() {
        assert_eq!(normalize_agent_name("Test-Agent"), "test_agent");
        assert_eq!(normalize_agent_name("  spaced  name "), "spaced_name");
        assert_eq!(normalize_agent_name("__x__"), "x");
        assert_eq!(normalize_agent_name("ISS42"), "iss42");
        assert_eq!(normalize_agent_name(""), "agent");
        assert_eq!(normalize_agent_name("!!!"), "agent");
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in ["Test-Agent", "a--b--c", "", "Mixed Case 42"] {
            let once = normalize_agent_name(raw);
            assert_eq!(normalize_agent_name(&once), once);
        }
    }

    #[test]
    fn summary_takes_first_nonempty_line() {
        assert_eq!(summarize("\n\n  first real line\nsecond"), "first real line");
        assert_eq!(summarize(""), "");
        let long = "x".repeat(SUMMARY_MAX_CHARS + 50);
        assert_eq!(summarize(&long).chars().count(), SUMMARY_MAX_CHARS);
    }
}
