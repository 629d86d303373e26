pub mod charter;
pub mod scheduler;
pub mod worktree;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::debug;

/// Gate label: only issues carrying it are orchestrated.
pub const LABEL_ORCHESTRATE: &str = "orchestrate";
pub const LABEL_QUEUED: &str = "agent:queued";
pub const LABEL_RUNNING: &str = "agent:running";
pub const LABEL_REVIEW: &str = "agent:review";
pub const LABEL_DONE: &str = "agent:done";
pub const LABEL_STALLED: &str = "agent:stalled";
pub const LABEL_PR_ON_COMPLETE: &str = "auto:pr-on-complete";

/// Hidden anchor that marks the hub-owned status comment.
pub const STATUS_MARKER: &str = "<!-- orch:status -->";

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("GitHub CLI `gh` not found on PATH")]
    GhMissing,
    #[error("{context}: {message}")]
    CommandFailed { context: String, message: String },
    #[error("failed to parse gh output for {context}: {source}")]
    Parse {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// An issue as the scheduler sees it.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct IssueDetails {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub body: String,
}

impl IssueDetails {
    pub fn is_open(&self) -> bool {
        self.state.eq_ignore_ascii_case("open")
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct IssueComment {
    pub id: u64,
    #[serde(default)]
    pub body: String,
}

/// Everything the scheduler needs from GitHub and git, behind one boundary.
///
/// The real implementation shells out to `gh`/`git`; tests supply a scripted
/// fake so scheduling logic runs against typed records only.
#[async_trait]
pub trait GitHubOps: Send + Sync {
    async fn list_orchestrate_issues(&self, limit: usize) -> Result<Vec<IssueDetails>, GitHubError>;
    async fn fetch_issue(&self, number: u64) -> Result<IssueDetails, GitHubError>;
    async fn comment_issue(&self, number: u64, body: &str) -> Result<(), GitHubError>;
    async fn list_comments(&self, number: u64) -> Result<Vec<IssueComment>, GitHubError>;
    /// Creates a comment via the API and returns its id.
    async fn create_comment(&self, number: u64, body: &str) -> Result<u64, GitHubError>;
    async fn update_comment(&self, comment_id: u64, body: &str) -> Result<(), GitHubError>;
    async fn replace_labels(
        &self,
        number: u64,
        add: &[&str],
        remove: &[&str],
    ) -> Result<(), GitHubError>;
    /// Opens a PR from `branch` unless one exists; returns its URL if any.
    async fn ensure_pr(
        &self,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<Option<String>, GitHubError>;
    /// Creates the worktree directory on `branch` if it is not there yet.
    async fn ensure_worktree(&self, branch: &str, dir: &Path) -> Result<(), GitHubError>;
}

/// `gh`/`git` CLI adapter rooted at a repository checkout.
pub struct GhCli {
    repo_root: PathBuf,
    slug: OnceCell<String>,
}

impl GhCli {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            slug: OnceCell::new(),
        }
    }

    /// Resolves the repository root via `git rev-parse --show-toplevel`.
    pub async fn discover(cwd: &Path) -> Result<Self, GitHubError> {
        let output = run_command("git", &["rev-parse", "--show-toplevel"], cwd, "git root").await?;
        Ok(Self::new(PathBuf::from(output.trim())))
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    async fn slug(&self) -> Result<&str, GitHubError> {
        self.slug
            .get_or_try_init(|| async {
                let raw = self
                    .gh(&["repo", "view", "--json", "nameWithOwner"], "repo slug")
                    .await?;
                let value: Value = serde_json::from_str(&raw).map_err(|source| {
                    GitHubError::Parse {
                        context: "repo slug".to_string(),
                        source,
                    }
                })?;
                value
                    .get("nameWithOwner")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| GitHubError::CommandFailed {
                        context: "repo slug".to_string(),
                        message: "nameWithOwner missing from gh output".to_string(),
                    })
            })
            .await
            .map(String::as_str)
    }

    async fn gh(&self, args: &[&str], context: &str) -> Result<String, GitHubError> {
        run_command("gh", args, &self.repo_root, context).await
    }

    async fn git(&self, args: &[&str], context: &str) -> Result<String, GitHubError> {
        run_command("git", args, &self.repo_root, context).await
    }
}

async fn run_command(
    program: &str,
    args: &[&str],
    cwd: &Path,
    context: &str,
) -> Result<String, GitHubError> {
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .env("GH_PAGER", "cat")
        .output()
        .await
        .map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound && program == "gh" {
                GitHubError::GhMissing
            } else {
                GitHubError::CommandFailed {
                    context: context.to_string(),
                    message: source.to_string(),
                }
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let message = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(GitHubError::CommandFailed {
            context: context.to_string(),
            message: if message.is_empty() {
                format!("{program} exited with {:?}", output.status)
            } else {
                message
            },
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn parse_json<T: for<'de> Deserialize<'de>>(raw: &str, context: &str) -> Result<T, GitHubError> {
    serde_json::from_str(raw).map_err(|source| GitHubError::Parse {
        context: context.to_string(),
        source,
    })
}

#[derive(Deserialize)]
struct RawLabel {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct RawIssue {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    labels: Vec<RawLabel>,
    #[serde(default)]
    body: String,
}

impl From<RawIssue> for IssueDetails {
    fn from(raw: RawIssue) -> Self {
        Self {
            number: raw.number,
            title: raw.title,
            state: raw.state,
            url: raw.url,
            labels: raw
                .labels
                .into_iter()
                .map(|l| l.name)
                .filter(|name| !name.is_empty())
                .collect(),
            body: raw.body,
        }
    }
}

#[async_trait]
impl GitHubOps for GhCli {
    async fn list_orchestrate_issues(&self, limit: usize) -> Result<Vec<IssueDetails>, GitHubError> {
        let limit = limit.to_string();
        let raw = self
            .gh(
                &[
                    "issue",
                    "list",
                    "--label",
                    LABEL_ORCHESTRATE,
                    "--state",
                    "all",
                    "--limit",
                    &limit,
                    "--json",
                    "number,title,state,url,labels,body",
                ],
                "list orchestrate issues",
            )
            .await?;
        let issues: Vec<RawIssue> = parse_json(&raw, "issue list")?;
        Ok(issues.into_iter().map(IssueDetails::from).collect())
    }

    async fn fetch_issue(&self, number: u64) -> Result<IssueDetails, GitHubError> {
        let number_text = number.to_string();
        let raw = self
            .gh(
                &[
                    "issue",
                    "view",
                    &number_text,
                    "--json",
                    "number,title,state,url,labels,body",
                ],
                "fetch issue",
            )
            .await?;
        let issue: RawIssue = parse_json(&raw, "issue view")?;
        Ok(issue.into())
    }

    async fn comment_issue(&self, number: u64, body: &str) -> Result<(), GitHubError> {
        let number_text = number.to_string();
        self.gh(
            &["issue", "comment", &number_text, "-b", body],
            "comment issue",
        )
        .await
        .map(|_| ())
    }

    async fn list_comments(&self, number: u64) -> Result<Vec<IssueComment>, GitHubError> {
        let slug = self.slug().await?.to_string();
        let path = format!("repos/{slug}/issues/{number}/comments");
        let raw = self.gh(&["api", &path], "list comments").await?;
        parse_json(&raw, "comment list")
    }

    async fn create_comment(&self, number: u64, body: &str) -> Result<u64, GitHubError> {
        let slug = self.slug().await?.to_string();
        let path = format!("repos/{slug}/issues/{number}/comments");
        let field = format!("body={body}");
        let raw = self
            .gh(&["api", &path, "-f", &field], "create comment")
            .await?;
        let value: Value = parse_json(&raw, "created comment")?;
        value
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| GitHubError::CommandFailed {
                context: "create comment".to_string(),
                message: "comment id missing from gh output".to_string(),
            })
    }

    async fn update_comment(&self, comment_id: u64, body: &str) -> Result<(), GitHubError> {
        let slug = self.slug().await?.to_string();
        let path = format!("repos/{slug}/issues/comments/{comment_id}");
        let field = format!("body={body}");
        self.gh(&["api", "-X", "PATCH", &path, "-f", &field], "update comment")
            .await
            .map(|_| ())
    }

    async fn replace_labels(
        &self,
        number: u64,
        add: &[&str],
        remove: &[&str],
    ) -> Result<(), GitHubError> {
        let number_text = number.to_string();
        let mut args = vec!["issue", "edit", number_text.as_str()];
        let add_args: Vec<String> = add.iter().map(|l| l.to_string()).collect();
        let remove_args: Vec<String> = remove.iter().map(|l| l.to_string()).collect();
        for label in &add_args {
            args.push("--add-label");
            args.push(label);
        }
        for label in &remove_args {
            args.push("--remove-label");
            args.push(label);
        }
        if add.is_empty() && remove.is_empty() {
            return Ok(());
        }
        self.gh(&args, "edit labels").await.map(|_| ())
    }

    async fn ensure_pr(
        &self,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<Option<String>, GitHubError> {
        let existing = self
            .gh(
                &["pr", "list", "--head", branch, "--json", "url", "--limit", "1"],
                "pr list",
            )
            .await?;
        let existing: Vec<Value> = parse_json(&existing, "pr list")?;
        if let Some(url) = existing.first().and_then(|pr| pr.get("url")).and_then(Value::as_str) {
            return Ok(Some(url.to_string()));
        }

        // Nothing to open a PR from if the branch was never pushed.
        if self
            .git(&["push", "-u", "origin", branch], "push branch")
            .await
            .is_err()
        {
            debug!(branch, "branch push failed; skipping PR creation");
            return Ok(None);
        }

        let raw = self
            .gh(
                &["pr", "create", "--head", branch, "--title", title, "--body", body],
                "pr create",
            )
            .await?;
        let url = raw
            .lines()
            .rev()
            .find(|line| line.trim().starts_with("https://"))
            .map(|line| line.trim().to_string());
        Ok(url)
    }

    async fn ensure_worktree(&self, branch: &str, dir: &Path) -> Result<(), GitHubError> {
        if dir.exists() {
            return Ok(());
        }
        if let Some(parent) = dir.parent() {
            std::fs::create_dir_all(parent).map_err(|source| GitHubError::CommandFailed {
                context: "create worktree parent".to_string(),
                message: source.to_string(),
            })?;
        }

        let dir_text = dir.display().to_string();
        // `-b` fails when the branch already exists; retry attaching to it.
        let created = self
            .git(
                &["worktree", "add", &dir_text, "-b", branch],
                "worktree add",
            )
            .await;
        if created.is_err() {
            self.git(&["worktree", "add", &dir_text, branch], "worktree attach")
                .await?;
        }
        Ok(())
    }
}
