use std::{path::Path, time::Duration};

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::AppServerError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// What the startup probe learned about the backend binary.
#[derive(Clone, Debug)]
pub struct BackendProbe {
    /// Parsed from `--version` output when available.
    pub version: Option<semver::Version>,
}

/// Verifies that `binary` understands the `app-server` subcommand.
///
/// Runs `<binary> app-server --help` with a short timeout; any spawn failure,
/// timeout, or non-zero exit is a typed startup error so the caller can fail
/// fast before wiring up the transport. A `--version` probe is attempted for
/// logging but never fails the check.
pub async fn probe_backend(binary: &Path) -> Result<BackendProbe, AppServerError> {
    let help = run_probe(binary, &["app-server", "--help"]).await?;
    if !help.status.success() {
        return Err(AppServerError::Probe {
            binary: binary.to_path_buf(),
            reason: format!("`app-server --help` exited with {:?}", help.status),
        });
    }

    let version = match run_probe(binary, &["--version"]).await {
        Ok(output) if output.status.success() => {
            let text = String::from_utf8_lossy(&output.stdout);
            parse_version_output(&text)
        }
        Ok(output) => {
            warn!(status = ?output.status, "backend --version exited non-zero");
            None
        }
        Err(error) => {
            warn!(%error, "backend --version probe failed");
            None
        }
    };

    if let Some(version) = &version {
        debug!(%version, "backend version detected");
    }

    Ok(BackendProbe { version })
}

async fn run_probe(
    binary: &Path,
    args: &[&str],
) -> Result<std::process::Output, AppServerError> {
    let future = Command::new(binary)
        .args(args)
        .env("RUST_LOG", "error")
        .output();
    match tokio::time::timeout(PROBE_TIMEOUT, future).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(source)) => Err(AppServerError::Probe {
            binary: binary.to_path_buf(),
            reason: format!("failed to run probe: {source}"),
        }),
        Err(_) => Err(AppServerError::Probe {
            binary: binary.to_path_buf(),
            reason: format!("probe timed out after {PROBE_TIMEOUT:?}"),
        }),
    }
}

/// Extracts a semver from output like `codex-cli 0.29.0` or `codex v0.29.0`.
pub(crate) fn parse_version_output(text: &str) -> Option<semver::Version> {
    text.split_whitespace()
        .map(|token| token.trim_start_matches('v'))
        .find_map(|token| semver::Version::parse(token).ok())
}
