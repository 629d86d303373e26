#![forbid(unsafe_code)]
//! Orchestration hub for a tree of Codex `app-server` agent conversations.
//!
//! One **orchestrator** conversation plans work and steers the rest of the
//! tree by embedding fenced `control` blocks in its replies; the hub
//! interprets them to spawn, message, and close **sub-agents**, each its own
//! backend conversation. Around that core sit the policy layers:
//!
//! - an **autopilot gate** that decides whether control blocks execute and
//!   whether privileged approval requests (`execCommandApproval`,
//!   `applyPatchApproval`) are granted;
//! - a debounced **decision digest** summarizing dirty sub-agents back to the
//!   orchestrator instead of firing it on every event;
//! - a **watchdog** and per-agent scheduler enforcing check-in and budget
//!   SLAs;
//! - an optional **GitHub scheduler** that turns `orchestrate`-labeled issues
//!   into sub-agents with their own git worktrees, labels, status comments,
//!   and pull requests.
//!
//! Everything observable flows through the sequenced event bus in
//! [`hub_events`]; artifacts and per-issue state persist under `.orch/`.

pub mod agent;
pub mod artifacts;
pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod github;
mod hub;
pub mod local_exec;
pub mod text;

pub use config::{ConfigError, GitHubConfig, HubConfig};
pub use error::HubError;
pub use hub::{AgentSnapshot, DecisionEntry, Hub, SpawnOptions, APP_SERVER, ORCHESTRATOR};

#[cfg(test)]
mod tests;
