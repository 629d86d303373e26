use std::{collections::HashMap, sync::OnceLock, time::Duration};

use regex::Regex;

use super::IssueDetails;

/// An issue body parsed into the sections the hub cares about.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IssueCharter {
    pub goal: String,
    pub acceptance: Vec<String>,
    pub scope_notes: Vec<String>,
    pub validation: String,
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#{1,6}\s+(.+?)\s*$").expect("heading regex"))
}

fn checkbox_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\-\*\+]\s*(?:\[[ xX*]\]\s*)?(.*)$").expect("checkbox regex"))
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"))
}

fn issue_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#(\d+)").expect("issue ref regex"))
}

fn blocked_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^blocked\s+by:\s*(.+)$").expect("blocked line regex"))
}

fn sla_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(checkin|budget):(\d+)([smhd])$").expect("sla label regex"))
}

fn normalise_heading(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut gap = false;
    for ch in text.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            if gap && !out.is_empty() {
                out.push('-');
            }
            gap = false;
            out.push(ch);
        } else {
            gap = true;
        }
    }
    out
}

fn parse_checklist(lines: &[String]) -> Vec<String> {
    let mut items = Vec::new();
    for raw in lines {
        let text = raw.trim();
        if text.is_empty() {
            continue;
        }
        let candidate = checkbox_re()
            .captures(text)
            .and_then(|cap| cap.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_else(|| text.to_string());
        if !candidate.is_empty() {
            items.push(candidate);
        }
    }
    items
}

fn clean_lines(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Splits the body into Goal / Acceptance / Scope / Validation sections by
/// Markdown headings; section names match by key or prefix (so
/// "Goal and background" still lands in `goal`).
pub fn parse_issue_body(body: &str) -> IssueCharter {
    let mut sections: HashMap<String, Vec<String>> = HashMap::new();
    let mut order: Vec<String> = vec!["__preamble__".to_string()];
    let mut current = "__preamble__".to_string();
    sections.insert(current.clone(), Vec::new());

    for line in body.lines() {
        if let Some(cap) = heading_re().captures(line) {
            current = normalise_heading(&cap[1]);
            if !sections.contains_key(&current) {
                sections.insert(current.clone(), Vec::new());
                order.push(current.clone());
            }
            continue;
        }
        sections
            .entry(current.clone())
            .or_default()
            .push(line.trim_end().to_string());
    }

    let section = |keys: &[&str]| -> Vec<String> {
        for key in keys {
            if let Some(content) = sections.get(*key) {
                return content.clone();
            }
        }
        for name in &order {
            for key in keys {
                if name.starts_with(key) {
                    if let Some(content) = sections.get(name) {
                        return content.clone();
                    }
                }
            }
        }
        Vec::new()
    };

    let goal_lines = clean_lines(&section(&["goal"]));
    let acceptance_lines = section(&["acceptance-checklist", "acceptance", "acceptance-criteria"]);
    let scope_lines = {
        let direct = section(&["scope", "scope-notes"]);
        if direct.is_empty() {
            section(&["scope-and-limits"])
        } else {
            direct
        }
    };
    let validation_lines = clean_lines(&section(&["validation", "test-plan", "tests"]));

    let scope_notes = {
        let checked = parse_checklist(&scope_lines);
        if checked.is_empty() {
            clean_lines(&scope_lines)
        } else {
            checked
        }
    };

    IssueCharter {
        goal: goal_lines.join(" "),
        acceptance: parse_checklist(&acceptance_lines),
        scope_notes,
        validation: validation_lines.join("\n"),
    }
}

/// Renders the charter into the prompt handed to an issue agent.
pub fn format_issue_prompt(issue: &IssueDetails, charter: &IssueCharter) -> String {
    let ws = whitespace_re();
    let mut lines = vec![format!("Work on Issue #{}: {}", issue.number, issue.title)];
    if !charter.goal.is_empty() {
        lines.push(format!("Goal: {}", ws.replace_all(charter.goal.trim(), " ")));
    }
    if !charter.acceptance.is_empty() {
        lines.push("Acceptance:".to_string());
        for (idx, item) in charter.acceptance.iter().enumerate() {
            lines.push(format!("{}. {}", idx + 1, ws.replace_all(item.trim(), " ")));
        }
    }
    if !charter.scope_notes.is_empty() {
        lines.push(format!("Scope: {}", charter.scope_notes.join("; ")));
    }
    if !charter.validation.trim().is_empty() {
        lines.push(format!("Validation: {}", charter.validation.trim()));
    }
    if !issue.labels.is_empty() {
        let mut labels = issue.labels.clone();
        labels.sort();
        lines.push(format!("Labels: {}", labels.join(", ")));
    }
    lines.join("\n")
}

/// Issue numbers this issue is blocked by, from `blocked-by:` labels and
/// "Blocked by: #N" body lines.
pub fn blockers_of(issue: &IssueDetails) -> Vec<u64> {
    let mut blockers: Vec<u64> = Vec::new();
    let mut push = |n: u64| {
        if !blockers.contains(&n) {
            blockers.push(n);
        }
    };

    for label in &issue.labels {
        if let Some(rest) = label.strip_prefix("blocked-by:") {
            for cap in issue_ref_re().captures_iter(rest) {
                if let Ok(n) = cap[1].parse() {
                    push(n);
                }
            }
        }
    }

    for cap in blocked_line_re().captures_iter(&issue.body) {
        for num in issue_ref_re().captures_iter(&cap[1]) {
            if let Ok(n) = num[1].parse() {
                push(n);
            }
        }
    }

    blockers
}

/// Per-issue SLA overrides from `checkin:<dur>` / `budget:<dur>` labels.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct IssueSlas {
    pub checkin: Option<Duration>,
    pub budget: Option<Duration>,
}

pub fn parse_slas(labels: &[String]) -> IssueSlas {
    let mut slas = IssueSlas::default();
    for label in labels {
        let Some(cap) = sla_label_re().captures(label) else {
            continue;
        };
        let Ok(amount) = cap[2].parse::<u64>() else {
            continue;
        };
        let unit = match &cap[3] {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            _ => 86400,
        };
        let duration = Duration::from_secs(amount * unit);
        match &cap[1] {
            "checkin" => slas.checkin = Some(duration),
            _ => slas.budget = Some(duration),
        }
    }
    slas
}
