use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
};

use serde::Serialize;
use tokio::process::Command;

/// Commands the orchestrator may run through an `exec` control block.
pub fn default_allow_list() -> HashMap<&'static str, HashSet<&'static str>> {
    HashMap::from([
        (
            "git",
            HashSet::from([
                "status", "rev-parse", "checkout", "switch", "add", "commit", "push", "fetch",
                "pull", "merge", "worktree",
            ]),
        ),
        ("gh", HashSet::from(["issue", "pr", "repo", "auth"])),
    ])
}

/// Outcome of an allow-listed local command.
///
/// Denials and missing binaries are results, not errors: the orchestrator
/// gets the same structured report either way.
#[derive(Clone, Debug, Serialize)]
pub struct ExecResult {
    pub ok: bool,
    pub code: i32,
    pub cmd: String,
    pub cwd: PathBuf,
    pub stdout: String,
    pub stderr: String,
}

fn is_allowed(argv: &[String], allow: &HashMap<&str, HashSet<&str>>) -> bool {
    let Some(program) = argv.first() else {
        return false;
    };
    let program = Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("");
    let Some(subcommands) = allow.get(program) else {
        return false;
    };
    match argv.get(1) {
        None => true,
        Some(sub) => subcommands.contains(sub.as_str()) || sub.starts_with('-'),
    }
}

/// Runs `argv` if it clears the allow-list; captures output.
pub async fn run_exec(
    argv: &[String],
    cwd: Option<&Path>,
    env: &BTreeMap<String, String>,
    allow: &HashMap<&'static str, HashSet<&'static str>>,
    default_cwd: &Path,
) -> ExecResult {
    let cwd = cwd.unwrap_or(default_cwd).to_path_buf();
    let cmd_text = argv.join(" ");

    if !is_allowed(argv, allow) {
        return ExecResult {
            ok: false,
            code: 126,
            cmd: cmd_text.clone(),
            cwd,
            stdout: String::new(),
            stderr: format!(
                "denied: {}",
                if cmd_text.is_empty() { "empty command" } else { &cmd_text }
            ),
        };
    }

    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]).current_dir(&cwd);
    for (key, value) in env {
        command.env(key, value);
    }

    match command.output().await {
        Ok(output) => ExecResult {
            ok: output.status.success(),
            code: output.status.code().unwrap_or(-1),
            cmd: cmd_text,
            cwd,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        },
        Err(source) => ExecResult {
            ok: false,
            code: 127,
            cmd: cmd_text,
            cwd,
            stdout: String::new(),
            stderr: source.to_string(),
        },
    }
}
