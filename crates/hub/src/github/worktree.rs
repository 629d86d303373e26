use std::path::{Path, PathBuf};

/// Maximum slug length carried into branch names.
const SLUG_MAX: usize = 40;

/// Lowercased, dash-separated slug of an issue title; never empty.
pub fn slugify(text: &str) -> String {
    let mut out = String::with_capacity(text.len().min(SLUG_MAX));
    let mut gap = false;
    for ch in text.chars().flat_map(char::to_lowercase) {
        if out.len() >= SLUG_MAX {
            break;
        }
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
    let trimmed = out.trim_matches('-').to_string();
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed
    }
}

/// Branch and worktree directory for an issue agent.
pub fn worktree_paths(root: &Path, issue_number: u64, title: &str) -> (String, PathBuf) {
    let branch = format!("ai/iss-{issue_number}-{}", slugify(title));
    let dir = root.join(".worktrees").join(format!("iss-{issue_number}"));
    (branch, dir)
}
