use std::sync::Arc;

use serde_json::json;

use crate::github::{
    scheduler::{
        issue_of_agent, load_issue_state, mirror_events, save_issue_state, IssueScheduler,
        IssueState,
    },
    GitHubOps, STATUS_MARKER,
};

use super::support::{issue_fixture, settle, test_hub, wait_for, MockGitHub, TestHub};

fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[test]
fn issue_agent_names_roundtrip() {
    assert_eq!(issue_of_agent("iss42"), Some(42));
    assert_eq!(issue_of_agent("iss"), None);
    assert_eq!(issue_of_agent("worker"), None);
    assert_eq!(issue_of_agent("iss42b"), None);
}

#[tokio::test]
async fn blocked_issues_wait_for_their_blockers() {
    let t = test_hub(|c| c.wip_limit = 5).await;
    let gh = MockGitHub::new(vec![
        issue_fixture(10, "Base work", &[], "# Goal\nDo the base.\n"),
        issue_fixture(11, "Follow-up", &["blocked-by:#10"], "# Goal\nBuild on it.\n"),
    ]);
    let scheduler = IssueScheduler::new(
        t.hub.clone(),
        gh.clone() as Arc<dyn GitHubOps>,
        t.dir.path().to_path_buf(),
    );

    scheduler.poll_once().await.expect("poll");
    assert!(t.hub.has_agent("iss10").await);
    assert!(!t.hub.has_agent("iss11").await);

    // Closing #10 releases #11 on the next poll.
    gh.set_issue_state(10, "closed");
    t.hub.close_sub("iss10").await.expect("close");
    scheduler.poll_once().await.expect("poll");
    assert!(t.hub.has_agent("iss11").await);
}

#[tokio::test]
async fn started_issue_gets_worktree_labels_and_status_comment() {
    let t = test_hub(|_| {}).await;
    let gh = MockGitHub::new(vec![issue_fixture(
        7,
        "Add caching layer",
        &["checkin:1m", "budget:2h"],
        "# Goal\nCache things.\n\n## Acceptance\n- [ ] hit ratio measured\n",
    )]);
    let scheduler = IssueScheduler::new(
        t.hub.clone(),
        gh.clone() as Arc<dyn GitHubOps>,
        t.dir.path().to_path_buf(),
    );

    scheduler.poll_once().await.expect("poll");
    assert!(t.hub.has_agent("iss7").await);

    // Worktree on the slugged branch.
    let worktrees = gh.worktrees.lock().unwrap().clone();
    assert_eq!(worktrees.len(), 1);
    assert_eq!(worktrees[0].0, "ai/iss-7-add-caching-layer");
    assert!(worktrees[0].1.ends_with(".worktrees/iss-7"));

    // SLA labels landed in the agent's meta.
    {
        let state = t.hub.state.lock().await;
        let meta = state.meta.get("iss7").expect("meta");
        assert_eq!(meta.checkin_seconds, 60);
        assert_eq!(meta.budget_seconds, 7200);
        assert_eq!(meta.issue_number, Some(7));
        assert!(meta.status_comment_id.is_some());
    }

    // Marker-anchored status comment exists.
    let status = gh.status_comments.lock().unwrap();
    let comments = status.get(&7).expect("status comment");
    assert!(comments[0].body.contains(STATUS_MARKER));
    drop(status);

    assert!(gh.added_labels_for(7).contains(&"agent:running".to_string()));

    // Charter prompt reached the new agent.
    let prompt = t.backend.texts_to("conv-2").remove(0);
    assert!(prompt.contains("Work on Issue #7: Add caching layer"));
    assert!(prompt.contains("Goal: Cache things."));
    assert!(prompt.contains("1. hit ratio measured"));
    assert!(prompt.contains("branch: ai/iss-7-add-caching-layer"));

    // Durable state file written.
    let state = load_issue_state(&t.hub.config().orch_root(), 7);
    assert_eq!(state.status, "running");
    assert_eq!(state.agent, "iss7");
    assert_eq!(state.branch, "ai/iss-7-add-caching-layer");
}

#[tokio::test]
async fn capacity_limits_spawns_per_poll() {
    let t = test_hub(|c| c.wip_limit = 1).await;
    let gh = MockGitHub::new(vec![
        issue_fixture(1, "One", &[], ""),
        issue_fixture(2, "Two", &[], ""),
    ]);
    let scheduler = IssueScheduler::new(
        t.hub.clone(),
        gh as Arc<dyn GitHubOps>,
        t.dir.path().to_path_buf(),
    );

    scheduler.poll_once().await.expect("poll");
    assert_eq!(t.hub.sub_count().await, 1);
}

#[tokio::test]
async fn completed_issues_are_not_restarted() {
    let t = test_hub(|_| {}).await;
    let gh = MockGitHub::new(vec![issue_fixture(3, "Done before", &[], "")]);
    save_issue_state(
        &t.hub.config().orch_root(),
        3,
        &IssueState {
            agent: "iss3".to_string(),
            status: "complete".to_string(),
            ..IssueState::default()
        },
    );

    let scheduler = IssueScheduler::new(
        t.hub.clone(),
        gh as Arc<dyn GitHubOps>,
        t.dir.path().to_path_buf(),
    );
    scheduler.poll_once().await.expect("poll");
    assert!(!t.hub.has_agent("iss3").await);
}

#[tokio::test]
async fn mirror_posts_agent_updates_as_comments() {
    let t = test_hub(|_| {}).await;
    let gh = MockGitHub::new(vec![issue_fixture(12, "Mirrored", &[], "")]);
    let orch_root = t.hub.config().orch_root();
    save_issue_state(
        &orch_root,
        12,
        &IssueState {
            agent: "iss12".to_string(),
            status: "running".to_string(),
            last_activity: 1.0,
            stalled_at: Some(2.0),
            ..IssueState::default()
        },
    );

    tokio::spawn(mirror_events(
        t.hub.clone(),
        gh.clone() as Arc<dyn GitHubOps>,
    ));
    settle().await;

    t.hub
        .bus()
        .broadcast("iss12", "agent_to_orch", json!({ "text": "made progress" }));
    wait_for("mirrored comment", || {
        gh.comments_for(12).contains(&"made progress".to_string())
    })
    .await;

    let state = load_issue_state(&orch_root, 12);
    assert!(state.stalled_at.is_none());
    assert!(state.last_activity > 1.0);
    let removed = gh.labels_removed.lock().unwrap().clone();
    assert!(removed.contains(&(12, "agent:stalled".to_string())));
}

#[tokio::test]
async fn mirror_completion_without_pr_label_marks_done() {
    let t = test_hub(|_| {}).await;
    let gh = MockGitHub::new(vec![issue_fixture(13, "Finishing", &[], "")]);
    let orch_root = t.hub.config().orch_root();
    save_issue_state(
        &orch_root,
        13,
        &IssueState {
            agent: "iss13".to_string(),
            branch: "ai/iss-13-finishing".to_string(),
            status: "running".to_string(),
            last_activity: now_ts(),
            ..IssueState::default()
        },
    );

    tokio::spawn(mirror_events(
        t.hub.clone(),
        gh.clone() as Arc<dyn GitHubOps>,
    ));
    settle().await;

    t.hub
        .bus()
        .broadcast("iss13", "agent_removed", json!({ "agent": "iss13" }));
    wait_for("done label", || {
        gh.added_labels_for(13).contains(&"agent:done".to_string())
    })
    .await;

    assert!(gh.prs.lock().unwrap().is_empty());
    let state = load_issue_state(&orch_root, 13);
    assert_eq!(state.status, "complete");
    assert!(state.completed_at.is_some());
}

#[tokio::test]
async fn mirror_completion_with_pr_label_opens_pr() {
    let t = test_hub(|_| {}).await;
    let gh = MockGitHub::new(vec![issue_fixture(
        14,
        "Ship it",
        &["auto:pr-on-complete"],
        "",
    )]);
    let orch_root = t.hub.config().orch_root();
    save_issue_state(
        &orch_root,
        14,
        &IssueState {
            agent: "iss14".to_string(),
            branch: "ai/iss-14-ship-it".to_string(),
            status: "running".to_string(),
            last_activity: now_ts(),
            ..IssueState::default()
        },
    );

    tokio::spawn(mirror_events(
        t.hub.clone(),
        gh.clone() as Arc<dyn GitHubOps>,
    ));
    settle().await;

    t.hub
        .bus()
        .broadcast("iss14", "agent_removed", json!({ "agent": "iss14" }));
    wait_for("review label", || {
        gh.added_labels_for(14).contains(&"agent:review".to_string())
    })
    .await;

    let prs = gh.prs.lock().unwrap().clone();
    assert_eq!(prs.len(), 1);
    assert_eq!(prs[0].0, "ai/iss-14-ship-it");
    assert_eq!(prs[0].1, "Issue #14: Ship it");

    let state = load_issue_state(&orch_root, 14);
    assert_eq!(
        state.pr_url.as_deref(),
        Some("https://example.test/pr/ai/iss-14-ship-it")
    );
    assert!(gh
        .comments_for(14)
        .iter()
        .any(|c| c.contains("Opened PR: https://example.test/pr/")));
}

#[tokio::test]
async fn stalled_agents_are_flagged_once() {
    let t = test_hub(|c| c.github.stale_minutes = 1).await;
    let gh = MockGitHub::new(vec![issue_fixture(20, "Quiet one", &[], "")]);
    let scheduler = IssueScheduler::new(
        t.hub.clone(),
        gh.clone() as Arc<dyn GitHubOps>,
        t.dir.path().to_path_buf(),
    );

    scheduler.poll_once().await.expect("poll");
    assert!(t.hub.has_agent("iss20").await);

    // Age the recorded activity past the stale window.
    let orch_root = t.hub.config().orch_root();
    let mut state = load_issue_state(&orch_root, 20);
    state.last_activity = now_ts() - 120.0;
    save_issue_state(&orch_root, 20, &state);

    scheduler.poll_once().await.expect("poll");
    assert!(gh.added_labels_for(20).contains(&"agent:stalled".to_string()));
    let stall_comments = gh
        .comments_for(20)
        .iter()
        .filter(|c| c.contains("stalled"))
        .count();
    assert_eq!(stall_comments, 1);
    assert!(load_issue_state(&orch_root, 20).stalled_at.is_some());

    // Second pass must not repeat the stall comment.
    scheduler.poll_once().await.expect("poll");
    let stall_comments = gh
        .comments_for(20)
        .iter()
        .filter(|c| c.contains("stalled"))
        .count();
    assert_eq!(stall_comments, 1);
}

#[tokio::test]
async fn status_control_block_comments_on_issue() {
    let gh = MockGitHub::new(vec![issue_fixture(30, "Status target", &[], "")]);
    let t = super::support::test_hub_with_github(|_| {}, Some(gh.clone() as Arc<dyn GitHubOps>))
        .await;

    t.backend.push_notification(
        "assistant_message",
        json!({
            "conversation_id": TestHub::ORCH_CONV,
            "text": "```control\n{\"status\":{\"issue\":30,\"text\":\"halfway there\"}}\n```",
        }),
    );
    wait_for("status comment", || {
        gh.comments_for(30).contains(&"halfway there".to_string())
    })
    .await;
}
