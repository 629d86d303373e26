use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use serde_json::{json, Value};

const INDEX_BASENAME: &str = "index.jsonl";

/// Append-only store for text blobs (agent messages, completion reports).
///
/// Each artifact is a body file `<id>.txt` plus one index line
/// `{id, kind, ts, meta}`. Ids are `<unix-ts>-<8-hex>`, so a plain sort is
/// chronological. Nothing is ever rewritten or deleted.
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    /// `root` is the state directory (`.orch`); artifacts live underneath it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            dir: root.into().join("artifacts"),
        }
    }

    pub fn store(&self, kind: &str, body: &str, meta: Value) -> io::Result<String> {
        std::fs::create_dir_all(&self.dir)?;

        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{ts}-{}", &suffix[..8]);

        std::fs::write(self.dir.join(format!("{id}.txt")), body)?;

        let record = json!({"id": id, "kind": kind, "ts": ts, "meta": meta});
        let mut index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(INDEX_BASENAME))?;
        let mut line = record.to_string();
        line.push('\n');
        index.write_all(line.as_bytes())?;

        Ok(id)
    }

    /// Loads an artifact body, optionally capped, returning the full length
    /// alongside the (possibly truncated) text.
    pub fn load(&self, id: &str, max_chars: Option<usize>) -> io::Result<(String, usize)> {
        if !is_valid_id(id) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid artifact id `{id}`"),
            ));
        }
        let data = std::fs::read_to_string(self.dir.join(format!("{id}.txt")))?;
        let total = data.chars().count();
        let text = match max_chars {
            Some(cap) if total > cap => data.chars().take(cap).collect(),
            _ => data,
        };
        Ok((text, total))
    }
}

/// Ids are `<digits>-<8 hex>`; anything else never reaches the filesystem.
fn is_valid_id(id: &str) -> bool {
    let Some((ts, suffix)) = id.split_once('-') else {
        return false;
    };
    !ts.is_empty()
        && ts.bytes().all(|b| b.is_ascii_digit())
        && suffix.len() == 8
        && suffix.bytes().all(|b| b.is_ascii_hexdigit())
}
