use app_server::AppServerError;
use thiserror::Error;

use crate::github::GitHubError;

/// Errors surfaced by hub operations.
///
/// Policy denials carry stable, human-readable messages because they are
/// echoed to the orchestrator as prose.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("no such sub-agent '{0}'")]
    UnknownAgent(String),
    #[error("sub-agent '{0}' already exists")]
    AgentExists(String),
    #[error("WIP limit of {limit} reached")]
    WipLimitReached { limit: usize },
    #[error("autopilot disabled")]
    AutopilotDisabled,
    #[error("dangerous mode disabled")]
    DangerousDisabled,
    #[error(transparent)]
    Backend(#[from] AppServerError),
    #[error(transparent)]
    GitHub(#[from] GitHubError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
