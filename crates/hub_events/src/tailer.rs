use std::{path::PathBuf, time::Duration};

use serde_json::Value;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncSeekExt, BufReader},
    sync::mpsc,
    task::JoinHandle,
    time,
};
use tracing::debug;

/// One heartbeat observed in the OTEL stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OtelHeartbeat {
    pub conversation_id: String,
    pub event_name: String,
}

const HEARTBEAT_CAPACITY: usize = 256;

/// Tails a JSONL file written by an OTEL file exporter.
///
/// Lines that carry a recognizable conversation id become
/// [`OtelHeartbeat`]s; everything else is skipped. The tailer starts at the
/// end of the file (no historical replay) and polls for growth.
pub struct OtelTailer {
    path: PathBuf,
    poll_interval: Duration,
    replay_existing: bool,
}

impl OtelTailer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: Duration::from_secs(1),
            replay_existing: false,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Reads from the start of the file instead of seeking to the end.
    pub fn replay_existing(mut self) -> Self {
        self.replay_existing = true;
        self
    }

    /// Spawns the tail loop; abort the handle to stop it.
    pub fn spawn(self) -> (mpsc::Receiver<OtelHeartbeat>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(HEARTBEAT_CAPACITY);
        let handle = tokio::spawn(self.run(tx));
        (rx, handle)
    }

    async fn run(self, tx: mpsc::Sender<OtelHeartbeat>) {
        // Wait for the exporter to create the file.
        let file = loop {
            match File::open(&self.path).await {
                Ok(file) => break file,
                Err(_) => time::sleep(self.poll_interval).await,
            }
        };

        let mut reader = BufReader::new(file);
        if !self.replay_existing {
            let _ = reader.seek(std::io::SeekFrom::End(0)).await;
        }

        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => time::sleep(self.poll_interval).await,
                Ok(_) => {
                    let Some(heartbeat) = parse_heartbeat(line.trim()) else {
                        continue;
                    };
                    if tx.send(heartbeat).await.is_err() {
                        return;
                    }
                }
                Err(error) => {
                    debug!(%error, "otel tail read failed");
                    time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

fn parse_heartbeat(line: &str) -> Option<OtelHeartbeat> {
    if line.is_empty() {
        return None;
    }
    let payload: Value = serde_json::from_str(line).ok()?;
    let conversation_id = extract_conversation_id(&payload)?;
    let event_name = payload
        .get("name")
        .or_else(|| payload.get("event_name"))
        .or_else(|| payload.get("body").and_then(|b| b.get("name")))
        .and_then(Value::as_str)
        .unwrap_or("otel_event")
        .to_string();
    Some(OtelHeartbeat {
        conversation_id,
        event_name,
    })
}

/// Exporters disagree on where the conversation id lives; probe the shapes
/// seen in the wild.
fn extract_conversation_id(payload: &Value) -> Option<String> {
    for key in ["conversation_id", "session_id", "conversationId", "sessionId"] {
        match payload.get(key) {
            Some(Value::String(s)) => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }

    for root in ["attributes", "resource"] {
        let blob = match payload.get(root) {
            Some(value) if value.is_object() => value,
            _ => payload,
        };
        for key in ["conversation.id", "conversation_id", "session.id", "session_id"] {
            if let Some(found) = dig(blob, key) {
                return Some(found);
            }
        }
    }
    None
}

fn dig(obj: &Value, dotted: &str) -> Option<String> {
    let mut current = obj;
    for part in dotted.split('.') {
        current = current.as_object()?.get(part)?;
    }
    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
