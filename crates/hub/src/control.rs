use std::{
    collections::{BTreeMap, HashSet},
    path::PathBuf,
    sync::OnceLock,
};

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

/// Keys that qualify a bare JSON line as a control block.
const INLINE_KEYS: [&str; 3] = ["spawn", "send", "close"];

fn control_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)```(?:json\s+)?control\s*\n(.*?)\n```").expect("control fence regex")
    })
}

fn blank_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{2,}").expect("blank run regex"))
}

/// Extracts control blocks from assistant text, in source order.
///
/// Fenced ```` ```control ```` blocks come first; any full line that is a
/// single JSON object carrying a `spawn`/`send`/`close` key is accepted as a
/// fallback, deduplicated against already-extracted blocks by canonical-key
/// serialization.
pub fn extract_control_blocks(text: &str) -> Vec<Value> {
    if text.is_empty() {
        return Vec::new();
    }

    let mut blocks: Vec<Value> = Vec::new();
    for cap in control_fence().captures_iter(text) {
        let candidate = cap[1].trim();
        match serde_json::from_str::<Value>(candidate) {
            Ok(value @ Value::Object(_)) => blocks.push(value),
            _ => continue,
        }
    }

    let mut seen: HashSet<String> = blocks.iter().map(canonical_json).collect();
    for line in text.lines() {
        let candidate = line.trim();
        if !(candidate.starts_with('{') && candidate.ends_with('}')) {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        let Some(map) = value.as_object() else {
            continue;
        };
        if !INLINE_KEYS.iter().any(|key| map.contains_key(*key)) {
            continue;
        }
        let signature = canonical_json(&value);
        if !seen.insert(signature) {
            continue;
        }
        blocks.push(value);
    }

    blocks
}

/// Removes every control block from `text`, collapsing the blank-line runs
/// left behind. `extract_control_blocks(strip_control_blocks(t))` is empty
/// for any `t`.
pub fn strip_control_blocks(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let without_fences = control_fence().replace_all(text, "");
    let kept: Vec<&str> = without_fences
        .lines()
        .filter(|line| !is_inline_control(line.trim()))
        .collect();
    let joined = kept.join("\n");
    blank_runs().replace_all(&joined, "\n").trim().to_string()
}

fn is_inline_control(candidate: &str) -> bool {
    if !(candidate.starts_with('{') && candidate.ends_with('}')) {
        return false;
    }
    serde_json::from_str::<Value>(candidate)
        .ok()
        .and_then(|value| value.as_object().cloned())
        .map(|map| INLINE_KEYS.iter().any(|key| map.contains_key(*key)))
        .unwrap_or(false)
}

/// Serialization with recursively sorted object keys, for dedupe signatures.
fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&canonicalize(value)).unwrap_or_default()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(key, value)| (key.clone(), canonicalize(value)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// A recognized control block, validated and typed.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlBlock {
    Spawn {
        name: String,
        task: String,
        cwd: Option<PathBuf>,
    },
    Send {
        to: String,
        task: String,
    },
    Close {
        agent: String,
        reason: Option<String>,
    },
    Exec {
        argv: Vec<String>,
        cwd: Option<PathBuf>,
        env: BTreeMap<String, String>,
    },
    Status {
        issue: Option<u64>,
        text: String,
    },
    Fetch {
        artifact: String,
        max_chars: Option<usize>,
    },
}

#[derive(Deserialize)]
struct SpawnSpec {
    name: Option<String>,
    #[serde(default)]
    task: String,
    cwd: Option<PathBuf>,
}

#[derive(Deserialize)]
struct SendSpec {
    to: Option<String>,
    #[serde(default)]
    task: String,
}

#[derive(Deserialize)]
struct CloseSpec {
    agent: Option<String>,
    reason: Option<String>,
}

#[derive(Deserialize)]
struct ExecSpec {
    #[serde(default)]
    argv: Vec<String>,
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct StatusSpec {
    issue: Option<u64>,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct FetchSpec {
    artifact: Option<String>,
    max_chars: Option<usize>,
}

impl ControlBlock {
    /// The action key used in suppression events and logs.
    pub fn summary_key(value: &Value) -> &str {
        let known = ["spawn", "send", "close", "exec", "status", "fetch"];
        if let Some(map) = value.as_object() {
            for key in known {
                if map.contains_key(key) {
                    return key;
                }
            }
            if let Some((key, _)) = map.iter().next() {
                return key.as_str();
            }
        }
        "unknown"
    }

    /// Parses a raw block. `None` means no recognized action key;
    /// `Some(Err)` is a malformed block the orchestrator should hear about.
    pub fn parse(value: &Value) -> Option<Result<ControlBlock, String>> {
        let map = value.as_object()?;

        if let Some(raw) = map.get("spawn") {
            return Some(match serde_json::from_value::<SpawnSpec>(raw.clone()) {
                Ok(SpawnSpec {
                    name: Some(name),
                    task,
                    cwd,
                }) if !name.trim().is_empty() => Ok(ControlBlock::Spawn { name, task, cwd }),
                Ok(_) => Err("spawn missing 'name'".to_string()),
                Err(err) => Err(format!("spawn block malformed: {err}")),
            });
        }
        if let Some(raw) = map.get("send") {
            return Some(match serde_json::from_value::<SendSpec>(raw.clone()) {
                Ok(SendSpec {
                    to: Some(to),
                    task,
                }) if !to.trim().is_empty() => Ok(ControlBlock::Send { to, task }),
                Ok(_) => Err("send missing 'to'".to_string()),
                Err(err) => Err(format!("send block malformed: {err}")),
            });
        }
        if let Some(raw) = map.get("close") {
            return Some(match serde_json::from_value::<CloseSpec>(raw.clone()) {
                Ok(CloseSpec {
                    agent: Some(agent),
                    reason,
                }) if !agent.trim().is_empty() => Ok(ControlBlock::Close { agent, reason }),
                Ok(_) => Err("close missing 'agent'".to_string()),
                Err(err) => Err(format!("close block malformed: {err}")),
            });
        }
        if let Some(raw) = map.get("exec") {
            return Some(match serde_json::from_value::<ExecSpec>(raw.clone()) {
                Ok(ExecSpec { argv, cwd, env }) if !argv.is_empty() => {
                    Ok(ControlBlock::Exec { argv, cwd, env })
                }
                Ok(_) => Err("exec missing 'argv'".to_string()),
                Err(err) => Err(format!("exec block malformed: {err}")),
            });
        }
        if let Some(raw) = map.get("status") {
            return Some(match serde_json::from_value::<StatusSpec>(raw.clone()) {
                Ok(StatusSpec { issue, text }) => Ok(ControlBlock::Status { issue, text }),
                Err(err) => Err(format!("status block malformed: {err}")),
            });
        }
        if let Some(raw) = map.get("fetch") {
            return Some(match serde_json::from_value::<FetchSpec>(raw.clone()) {
                Ok(FetchSpec {
                    artifact: Some(artifact),
                    max_chars,
                }) if !artifact.trim().is_empty() => Ok(ControlBlock::Fetch {
                    artifact,
                    max_chars,
                }),
                Ok(_) => Err("fetch missing 'artifact'".to_string()),
                Err(err) => Err(format!("fetch block malformed: {err}")),
            });
        }

        None
    }
}
