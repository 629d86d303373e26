use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use app_server::{AppServerClient, ClientInfo, TransportConfig};

use crate::{
    config::HubConfig,
    github::{
        scheduler::{mirror_events, IssueScheduler},
        GhCli, GitHubOps,
    },
    hub::Hub,
};

/// Daemon flags. Anything left unset falls back to the TOML config (when
/// `--config` is given) and then to built-in defaults.
#[derive(Debug, Parser)]
#[command(name = "hub", version, about = "Orchestration hub for Codex app-server agents")]
pub struct Args {
    /// Path to the Codex binary exposing `app-server`.
    #[arg(long)]
    pub codex_bin: Option<PathBuf>,

    /// Repository root (defaults to the current directory).
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Model override for all conversations.
    #[arg(long)]
    pub model: Option<String>,

    /// TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Allow privileged approvals, local exec, and full-access sandboxing.
    #[arg(long)]
    pub dangerous: bool,

    /// Start with autopilot off (control blocks logged, not executed).
    #[arg(long)]
    pub no_autopilot: bool,

    /// Maximum concurrent sub-agents (0 = unlimited).
    #[arg(long)]
    pub wip: Option<usize>,

    /// Enable the GitHub issue scheduler.
    #[arg(long)]
    pub github: bool,

    /// GitHub poll cadence in seconds.
    #[arg(long)]
    pub poll_secs: Option<u64>,

    /// Minutes of silence before an issue agent is marked stalled.
    #[arg(long)]
    pub stale_minutes: Option<u64>,

    /// OTEL JSONL file to tail for agent heartbeats.
    #[arg(long)]
    pub otel_log: Option<PathBuf>,

    /// Seed context handed to the orchestrator on startup.
    #[arg(long, default_value = "")]
    pub seed: String,
}

impl Args {
    fn into_config(self) -> anyhow::Result<(HubConfig, String)> {
        let mut config = match &self.config {
            Some(path) => HubConfig::load(path)?,
            None => HubConfig::default(),
        };

        if let Some(bin) = self.codex_bin {
            config.codex_bin = bin;
        }
        if let Some(cwd) = self.cwd {
            config.cwd = cwd;
        }
        if self.model.is_some() {
            config.model = self.model;
        }
        if self.dangerous {
            config.dangerous = true;
        }
        if self.no_autopilot {
            config.autopilot = false;
        }
        if let Some(wip) = self.wip {
            config.wip_limit = wip;
        }
        if self.github {
            config.github.enabled = true;
        }
        if let Some(poll) = self.poll_secs {
            config.github.poll_secs = poll;
        }
        if let Some(stale) = self.stale_minutes {
            config.github.stale_minutes = stale;
        }
        if self.otel_log.is_some() {
            config.otel_log = self.otel_log;
        }

        config.cwd = config
            .cwd
            .canonicalize()
            .with_context(|| format!("cwd `{}` not accessible", config.cwd.display()))?;

        Ok((config, self.seed))
    }
}

/// Daemon entry point: probe, connect, supervise until SIGINT/SIGTERM.
pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let (config, seed) = Args::parse().into_config()?;

    let mut transport = TransportConfig::new(&config.codex_bin);
    transport.current_dir = Some(config.cwd.clone());
    let client_info = ClientInfo {
        name: "hub".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        title: Some("Orchestration Hub".to_string()),
    };
    let backend = Arc::new(
        AppServerClient::start(transport, client_info)
            .await
            .context("app-server startup failed")?,
    );

    let github_cli = if config.github.enabled {
        Some(
            GhCli::discover(&config.cwd)
                .await
                .context("not inside a git repository")?,
        )
    } else {
        None
    };
    let repo_root = github_cli
        .as_ref()
        .map(|gh| gh.repo_root().to_path_buf())
        .unwrap_or_else(|| config.cwd.clone());
    let github: Option<Arc<dyn GitHubOps>> =
        github_cli.map(|gh| Arc::new(gh) as Arc<dyn GitHubOps>);

    let hub = Hub::new(config.clone(), backend, github.clone());
    hub.start(&seed).await.context("hub startup failed")?;
    info!(cwd = %config.cwd.display(), "hub running");

    if let Some(github) = github {
        let scheduler = IssueScheduler::new(hub.clone(), github.clone(), repo_root);
        tokio::spawn(scheduler.run());
        tokio::spawn(mirror_events(hub.clone(), github));
        info!("github scheduler enabled");
    }

    wait_for_shutdown().await;
    info!("shutting down");
    hub.stop().await;
    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).ok();
    let terminate = async {
        match term.as_mut() {
            Some(term) => {
                term.recv().await;
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
}
