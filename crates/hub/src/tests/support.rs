use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};

use app_server::{AppServerError, Backend, EventQueue, ServerEvent};

use crate::{
    config::HubConfig,
    github::{GitHubError, GitHubOps, IssueComment, IssueDetails},
    hub::Hub,
};

/// Scripted backend: answers calls synchronously and lets tests inject
/// server traffic through the same queue the real transport uses.
pub(crate) struct MockBackend {
    pub calls: StdMutex<Vec<(String, Value)>>,
    pub responded: StdMutex<Vec<(Value, Value)>>,
    pub error_responses: StdMutex<Vec<(Value, i64, String)>>,
    events: Arc<EventQueue>,
    conversations: AtomicU64,
}

impl MockBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: StdMutex::new(Vec::new()),
            responded: StdMutex::new(Vec::new()),
            error_responses: StdMutex::new(Vec::new()),
            events: Arc::new(EventQueue::new(256)),
            conversations: AtomicU64::new(0),
        })
    }

    pub(crate) fn push_notification(&self, method: &str, params: Value) {
        self.events.push(ServerEvent::Notification {
            method: method.to_string(),
            params,
        });
    }

    pub(crate) fn push_request(&self, id: Value, method: &str, params: Value) {
        self.events.push(ServerEvent::Request {
            id,
            method: method.to_string(),
            params,
        });
    }

    pub(crate) fn push_stderr(&self, line: &str) {
        self.events.push(ServerEvent::Stderr {
            line: line.to_string(),
        });
    }

    pub(crate) fn calls_of(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    /// `(conversation_id, joined item text)` for every `sendUserMessage`.
    pub(crate) fn sent_texts(&self) -> Vec<(String, String)> {
        self.calls_of("sendUserMessage")
            .into_iter()
            .map(|params| {
                let conversation = params
                    .get("conversationId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let text = params
                    .get("items")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|item| {
                                item.get("data")
                                    .and_then(|d| d.get("text"))
                                    .and_then(Value::as_str)
                            })
                            .collect::<Vec<_>>()
                            .join("")
                    })
                    .unwrap_or_default();
                (conversation, text)
            })
            .collect()
    }

    pub(crate) fn texts_to(&self, conversation: &str) -> Vec<String> {
        self.sent_texts()
            .into_iter()
            .filter(|(conv, _)| conv == conversation)
            .map(|(_, text)| text)
            .collect()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn call(&self, method: &str, params: Value) -> Result<Value, AppServerError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params));
        match method {
            "newConversation" => {
                let n = self.conversations.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!({ "conversationId": format!("conv-{n}") }))
            }
            _ => Ok(json!({})),
        }
    }

    fn notify(&self, method: &str, params: Value) -> Result<(), AppServerError> {
        self.calls
            .lock()
            .unwrap()
            .push((format!("notify:{method}"), params));
        Ok(())
    }

    fn respond(&self, id: Value, result: Value) -> Result<(), AppServerError> {
        self.responded.lock().unwrap().push((id, result));
        Ok(())
    }

    fn respond_error(&self, id: Value, code: i64, message: &str) -> Result<(), AppServerError> {
        self.error_responses
            .lock()
            .unwrap()
            .push((id, code, message.to_string()));
        Ok(())
    }

    fn events(&self) -> Arc<EventQueue> {
        self.events.clone()
    }

    async fn stop(&self) {}
}

pub(crate) struct TestHub {
    pub hub: Arc<Hub>,
    pub backend: Arc<MockBackend>,
    pub dir: tempfile::TempDir,
}

impl TestHub {
    /// The orchestrator's conversation id under the mock backend.
    pub(crate) const ORCH_CONV: &'static str = "conv-1";
}

/// Builds and starts a hub against the mock backend in a scratch directory.
pub(crate) async fn test_hub(mutate: impl FnOnce(&mut HubConfig)) -> TestHub {
    test_hub_with_github(mutate, None).await
}

pub(crate) async fn test_hub_with_github(
    mutate: impl FnOnce(&mut HubConfig),
    github: Option<Arc<dyn GitHubOps>>,
) -> TestHub {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = HubConfig {
        cwd: dir.path().to_path_buf(),
        decide_debounce_s: 0.05,
        ..HubConfig::default()
    };
    mutate(&mut config);

    let backend = MockBackend::new();
    let hub = Hub::new(config, backend.clone(), github);
    hub.start("test seed").await.expect("hub start");
    TestHub { hub, backend, dir }
}

/// Polls `condition` until it holds or two (virtual) seconds pass.
pub(crate) async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Lets the event pump drain whatever was queued.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

type CommentsByIssue = HashMap<u64, Vec<IssueComment>>;

/// Scripted GitHub boundary recording every mutation.
pub(crate) struct MockGitHub {
    pub issues: StdMutex<Vec<IssueDetails>>,
    pub comments: StdMutex<Vec<(u64, String)>>,
    pub status_comments: StdMutex<CommentsByIssue>,
    pub updated_comments: StdMutex<Vec<(u64, String)>>,
    pub labels_added: StdMutex<Vec<(u64, String)>>,
    pub labels_removed: StdMutex<Vec<(u64, String)>>,
    pub worktrees: StdMutex<Vec<(String, PathBuf)>>,
    pub prs: StdMutex<Vec<(String, String)>>,
    next_comment_id: AtomicU64,
}

impl MockGitHub {
    pub(crate) fn new(issues: Vec<IssueDetails>) -> Arc<Self> {
        Arc::new(Self {
            issues: StdMutex::new(issues),
            comments: StdMutex::new(Vec::new()),
            status_comments: StdMutex::new(HashMap::new()),
            updated_comments: StdMutex::new(Vec::new()),
            labels_added: StdMutex::new(Vec::new()),
            labels_removed: StdMutex::new(Vec::new()),
            worktrees: StdMutex::new(Vec::new()),
            prs: StdMutex::new(Vec::new()),
            next_comment_id: AtomicU64::new(100),
        })
    }

    pub(crate) fn set_issue_state(&self, number: u64, state: &str) {
        let mut issues = self.issues.lock().unwrap();
        if let Some(issue) = issues.iter_mut().find(|i| i.number == number) {
            issue.state = state.to_string();
        }
    }

    pub(crate) fn comments_for(&self, number: u64) -> Vec<String> {
        self.comments
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| *n == number)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub(crate) fn added_labels_for(&self, number: u64) -> Vec<String> {
        self.labels_added
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| *n == number)
            .map(|(_, label)| label.clone())
            .collect()
    }
}

#[async_trait]
impl GitHubOps for MockGitHub {
    async fn list_orchestrate_issues(
        &self,
        _limit: usize,
    ) -> Result<Vec<IssueDetails>, GitHubError> {
        Ok(self.issues.lock().unwrap().clone())
    }

    async fn fetch_issue(&self, number: u64) -> Result<IssueDetails, GitHubError> {
        self.issues
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.number == number)
            .cloned()
            .ok_or_else(|| GitHubError::CommandFailed {
                context: "fetch issue".to_string(),
                message: format!("no issue #{number}"),
            })
    }

    async fn comment_issue(&self, number: u64, body: &str) -> Result<(), GitHubError> {
        self.comments
            .lock()
            .unwrap()
            .push((number, body.to_string()));
        Ok(())
    }

    async fn list_comments(&self, number: u64) -> Result<Vec<IssueComment>, GitHubError> {
        Ok(self
            .status_comments
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_comment(&self, number: u64, body: &str) -> Result<u64, GitHubError> {
        let id = self.next_comment_id.fetch_add(1, Ordering::SeqCst);
        self.status_comments
            .lock()
            .unwrap()
            .entry(number)
            .or_default()
            .push(IssueComment {
                id,
                body: body.to_string(),
            });
        Ok(id)
    }

    async fn update_comment(&self, comment_id: u64, body: &str) -> Result<(), GitHubError> {
        self.updated_comments
            .lock()
            .unwrap()
            .push((comment_id, body.to_string()));
        Ok(())
    }

    async fn replace_labels(
        &self,
        number: u64,
        add: &[&str],
        remove: &[&str],
    ) -> Result<(), GitHubError> {
        let mut added = self.labels_added.lock().unwrap();
        for label in add {
            added.push((number, label.to_string()));
        }
        let mut removed = self.labels_removed.lock().unwrap();
        for label in remove {
            removed.push((number, label.to_string()));
        }
        Ok(())
    }

    async fn ensure_pr(
        &self,
        branch: &str,
        title: &str,
        _body: &str,
    ) -> Result<Option<String>, GitHubError> {
        self.prs
            .lock()
            .unwrap()
            .push((branch.to_string(), title.to_string()));
        Ok(Some(format!("https://example.test/pr/{branch}")))
    }

    async fn ensure_worktree(&self, branch: &str, dir: &std::path::Path) -> Result<(), GitHubError> {
        self.worktrees
            .lock()
            .unwrap()
            .push((branch.to_string(), dir.to_path_buf()));
        Ok(())
    }
}

/// Issue fixture with the `orchestrate` gate label plus `extra` labels.
pub(crate) fn issue_fixture(number: u64, title: &str, extra: &[&str], body: &str) -> IssueDetails {
    let mut labels = vec!["orchestrate".to_string()];
    labels.extend(extra.iter().map(|l| l.to_string()));
    IssueDetails {
        number,
        title: title.to_string(),
        state: "open".to_string(),
        url: format!("https://example.test/issues/{number}"),
        labels,
        body: body.to_string(),
    }
}
