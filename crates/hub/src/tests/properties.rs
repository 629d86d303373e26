use proptest::prelude::*;

use crate::{
    agent::normalize_agent_name,
    control::{extract_control_blocks, strip_control_blocks},
};

proptest! {
    #[test]
    fn normalization_is_idempotent_and_canonical(raw in "[ -~]{0,48}") {
        let once = normalize_agent_name(&raw);
        prop_assert_eq!(normalize_agent_name(&once), once.clone());
        prop_assert!(!once.is_empty());
        prop_assert!(
            once == "agent" || once.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        );
        prop_assert!(!once.starts_with('_') && !once.ends_with('_'));
    }

    #[test]
    fn extraction_round_trips(
        specs in proptest::collection::vec(("[a-zA-Z][a-zA-Z0-9]{0,7}", "[a-z ]{1,20}"), 1..5),
        prose in proptest::collection::vec("[a-z ]{0,30}", 0..4),
    ) {
        let mut text = String::new();
        for line in &prose {
            text.push_str(line);
            text.push('\n');
        }
        for (name, task) in &specs {
            let block = serde_json::json!({ "spawn": { "name": name, "task": task } });
            text.push_str(&format!("```control\n{block}\n```\nfiller line\n"));
        }

        let extracted = extract_control_blocks(&text);
        prop_assert_eq!(extracted.len(), specs.len());
        for (value, (name, _)) in extracted.iter().zip(&specs) {
            prop_assert_eq!(
                value["spawn"]["name"].as_str(),
                Some(name.as_str()),
                "blocks must come back in source order"
            );
        }

        let stripped = strip_control_blocks(&text);
        prop_assert!(!stripped.contains("```"));
        prop_assert!(extract_control_blocks(&stripped).is_empty());
    }

    // Backticks excluded: removing one fence can butt stray backticks up
    // against a later "control" opener and mint a brand-new fence.
    #[test]
    fn stripping_is_idempotent(body in "[ -_a-~\\n]{0,200}") {
        let once = strip_control_blocks(&body);
        let twice = strip_control_blocks(&once);
        prop_assert_eq!(once, twice);
    }
}
