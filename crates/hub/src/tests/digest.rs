use std::time::Duration;

use serde_json::{json, Value};

use crate::hub::SpawnOptions;

use super::support::{settle, test_hub, wait_for, TestHub};

/// Pulls every fenced ```event``` JSON object out of a digest text.
fn event_blocks(text: &str) -> Vec<Value> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("```event\n") {
        let body = &rest[start + "```event\n".len()..];
        let Some(end) = body.find("\n```") else {
            break;
        };
        if let Ok(value) = serde_json::from_str(&body[..end]) {
            blocks.push(value);
        }
        rest = &body[end..];
    }
    blocks
}

fn digests(t: &TestHub) -> Vec<String> {
    t.backend
        .texts_to(TestHub::ORCH_CONV)
        .into_iter()
        .filter(|text| text.starts_with("HUB DIGEST"))
        .collect()
}

#[tokio::test]
async fn digest_fires_after_debounce_with_agent_update() {
    let t = test_hub(|c| c.decide_debounce_s = 0.05).await;
    t.hub
        .spawn_sub("worker", "task", SpawnOptions::default())
        .await
        .expect("spawn");

    t.backend.push_notification(
        "agent_message",
        json!({ "conversation_id": "conv-2", "message": "made progress" }),
    );
    wait_for("digest", || !digests(&t).is_empty()).await;

    let digest = digests(&t).remove(0);
    assert!(digest.contains("- worker ["));
    assert!(digest.contains("last check-in"));
    assert!(digest.contains("> made progress"));

    let blocks = event_blocks(&digest);
    let update = blocks
        .iter()
        .find(|b| b["type"] == json!("AGENT_UPDATE"))
        .expect("AGENT_UPDATE block");
    assert_eq!(update["agent"], json!("worker"));
    assert_eq!(update["state"], json!("idle"));
    assert!(update["artifacts"]["last_message"].is_string());

    // Dirty set was cleared: no second digest without new activity.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(digests(&t).len(), 1);

    let log = t.hub.decision_log().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].action, "digest_sent");

    assert!(t
        .hub
        .bus()
        .recent()
        .iter()
        .any(|e| e.kind == "decision" && e.payload["agents"] == json!(["worker"])));
}

#[tokio::test(start_paused = true)]
async fn debounce_coalesces_bursts() {
    let t = test_hub(|c| c.decide_debounce_s = 1.0).await;
    t.hub
        .spawn_sub("worker", "task", SpawnOptions::default())
        .await
        .expect("spawn");

    for n in 0..5 {
        t.backend.push_notification(
            "agent_message",
            json!({ "conversation_id": "conv-2", "message": format!("update {n}") }),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(digests(&t).len(), 1, "burst must coalesce into one digest");
    assert!(digests(&t)[0].contains("> update 4"));
}

#[tokio::test(start_paused = true)]
async fn watchdog_times_out_silent_agents() {
    let t = test_hub(|c| c.decide_debounce_s = 0.5).await;
    t.hub
        .spawn_sub(
            "worker",
            "task",
            SpawnOptions {
                checkin_seconds: Some(1),
                ..SpawnOptions::default()
            },
        )
        .await
        .expect("spawn");

    tokio::time::sleep(Duration::from_secs(12)).await;

    let all = digests(&t).join("\n");
    let blocks: Vec<Value> = event_blocks(&all);
    let timeout = blocks
        .iter()
        .find(|b| b["type"] == json!("TIMEOUT_CHECKIN"))
        .unwrap_or_else(|| panic!("no TIMEOUT_CHECKIN in {all:?}"));
    assert_eq!(timeout["agent"], json!("worker"));
    assert!(timeout["seconds"].as_u64().expect("seconds") >= 2);
}

#[tokio::test(start_paused = true)]
async fn scheduler_nudges_then_wraps_up_then_closes() {
    let t = test_hub(|c| c.decide_debounce_s = 0.5).await;
    t.hub
        .spawn_sub(
            "worker",
            "task",
            SpawnOptions {
                checkin_seconds: Some(1),
                budget_seconds: Some(2),
                ..SpawnOptions::default()
            },
        )
        .await
        .expect("spawn");

    // First scheduler tick: silent past the check-in SLA and over budget.
    tokio::time::sleep(Duration::from_secs(65)).await;
    let texts = t.backend.texts_to("conv-2");
    assert!(
        texts.iter().any(|t| t.contains("next small step")),
        "nudge missing from {texts:?}"
    );
    assert!(
        texts.iter().any(|t| t.contains("time budget exhausted")),
        "wrap-up missing from {texts:?}"
    );
    assert!(t.hub.has_agent("worker").await);

    // Next tick: still silent after the wrap-up grace, so it gets closed.
    tokio::time::sleep(Duration::from_secs(65)).await;
    assert!(!t.hub.has_agent("worker").await);
    assert!(t
        .hub
        .bus()
        .recent()
        .iter()
        .any(|e| e.kind == "agent_removed" && e.payload["agent"] == json!("worker")));
}

#[tokio::test(start_paused = true)]
async fn nudges_are_capped_at_max() {
    let t = test_hub(|c| {
        c.decide_debounce_s = 0.5;
        c.max_nudges = 2;
    })
    .await;
    t.hub
        .spawn_sub(
            "worker",
            "task",
            SpawnOptions {
                checkin_seconds: Some(1),
                budget_seconds: Some(100_000),
                ..SpawnOptions::default()
            },
        )
        .await
        .expect("spawn");

    tokio::time::sleep(Duration::from_secs(310)).await;
    let nudges = t
        .backend
        .texts_to("conv-2")
        .iter()
        .filter(|t| t.contains("next small step"))
        .count();
    assert_eq!(nudges, 2);
}

#[tokio::test(start_paused = true)]
async fn decision_log_is_bounded() {
    let t = test_hub(|c| c.decide_debounce_s = 0.0).await;
    t.hub
        .spawn_sub("worker", "task", SpawnOptions::default())
        .await
        .expect("spawn");

    for n in 0..110 {
        t.backend.push_notification(
            "agent_message",
            json!({ "conversation_id": "conv-2", "message": format!("m{n}") }),
        );
        settle().await;
    }

    let log = t.hub.decision_log().await;
    assert!(log.len() <= 100, "decision log grew to {}", log.len());
    assert!(!log.is_empty());
}
