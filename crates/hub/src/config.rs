use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Hub-wide settings. Loadable from TOML; the daemon layers CLI flags on top.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Path to the Codex binary exposing the `app-server` subcommand.
    pub codex_bin: PathBuf,
    /// Optional model override for every conversation.
    pub model: Option<String>,
    /// Repository root; becomes the orchestrator's working directory.
    pub cwd: PathBuf,
    /// Grants `danger-full-access` sandboxing and allows approvals + exec.
    pub dangerous: bool,
    /// Initial autopilot value. The orchestrator preamble mirrors it.
    pub autopilot: bool,
    /// Maximum concurrent sub-agents; 0 means unlimited.
    pub wip_limit: usize,
    /// Decision-digest debounce window in seconds.
    pub decide_debounce_s: f64,
    /// Default per-agent check-in SLA.
    pub checkin_seconds: u64,
    /// Default per-agent time budget.
    pub budget_seconds: u64,
    /// Nudges sent before a silent agent is left to the budget policy.
    pub max_nudges: u32,
    /// State directory, relative to `cwd` unless absolute.
    pub orch_dir: PathBuf,
    /// Optional OTEL JSONL file to tail for heartbeats.
    pub otel_log: Option<PathBuf>,
    pub github: GitHubConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub enabled: bool,
    /// Issue poll cadence in seconds.
    pub poll_secs: u64,
    /// Minutes of silence before an issue agent is marked stalled.
    pub stale_minutes: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            codex_bin: PathBuf::from("codex"),
            model: None,
            cwd: PathBuf::from("."),
            dangerous: false,
            autopilot: true,
            wip_limit: 0,
            decide_debounce_s: 3.0,
            checkin_seconds: 900,
            budget_seconds: 3600,
            max_nudges: 2,
            orch_dir: PathBuf::from(".orch"),
            otel_log: None,
            github: GitHubConfig::default(),
        }
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_secs: 90,
            stale_minutes: 30,
        }
    }
}

impl HubConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Absolute state directory.
    pub fn orch_root(&self) -> PathBuf {
        if self.orch_dir.is_absolute() {
            self.orch_dir.clone()
        } else {
            self.cwd.join(&self.orch_dir)
        }
    }

    pub fn debounce(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.decide_debounce_s.max(0.0))
    }
}
