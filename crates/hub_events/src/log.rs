use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use tracing::warn;

use crate::Event;

/// Append-only JSONL log of every broadcast event.
///
/// The file is opened per write so external tailers (the dashboard, `tail -f`)
/// always see whole lines; a failed append is warned about and dropped rather
/// than taking the hub down.
pub struct StateLog {
    path: PathBuf,
}

impl StateLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &Event) {
        if let Err(error) = self.try_append(event) {
            warn!(path = %self.path.display(), %error, "state log append failed");
        }
    }

    fn try_append(&self, event: &Event) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        file.write_all(line.as_bytes())
    }
}
