use std::{
    collections::HashMap,
    ffi::OsString,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::{
    error::AppServerError,
    protocol::{classify, Incoming, RequestId, ServerEvent},
    queue::EventQueue,
};

/// Floor for tolerated stdout line length.
const READ_BUFFER_BYTES: usize = 64 * 1024;
/// Default capacity of the fan-out event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 2000;
/// How long to wait for the child after closing stdin before killing it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

type Pending = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Result<Value, AppServerError>>>>>;

/// Launch configuration for the `app-server` subprocess.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub binary: PathBuf,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(OsString, OsString)>,
    pub event_capacity: usize,
}

impl TransportConfig {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            current_dir: None,
            env: Vec::new(),
            event_capacity: EVENT_QUEUE_CAPACITY,
        }
    }
}

/// Owns the `app-server` subprocess and the JSON-RPC channel over its stdio.
///
/// One writer task serializes outbound lines, one reader task demuxes stdout
/// into pending-call resolutions and [`ServerEvent`]s, and one stderr task
/// forwards diagnostics. The subprocess handle never leaves this struct.
pub struct AppServerTransport {
    writer: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Pending,
    events: Arc<EventQueue>,
    next_id: AtomicU64,
    tasks: Vec<JoinHandle<()>>,
    child: Arc<Mutex<Option<Child>>>,
}

impl AppServerTransport {
    /// Spawns `<binary> app-server` with piped stdio and starts the pumps.
    pub async fn spawn(config: TransportConfig) -> Result<Self, AppServerError> {
        let mut command = Command::new(&config.binary);
        command
            .arg("app-server")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &config.current_dir {
            command.current_dir(dir);
        }
        for (key, value) in &config.env {
            command.env(key, value);
        }

        let command_debug = format!("{command:?}");
        let mut child = spawn_with_retry(&mut command, &command_debug).await?;

        let stdout = child.stdout.take().ok_or_else(|| AppServerError::Spawn {
            command: command_debug.clone(),
            source: std::io::Error::other("child stdout unavailable"),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| AppServerError::Spawn {
            command: command_debug.clone(),
            source: std::io::Error::other("child stdin unavailable"),
        })?;
        let stderr = child.stderr.take();

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let events = Arc::new(EventQueue::new(config.event_capacity));
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let mut tasks = vec![
            tokio::spawn(writer_task(stdin, writer_rx)),
            tokio::spawn(reader_task(stdout, pending.clone(), events.clone())),
        ];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(stderr_task(stderr, events.clone())));
        }

        Ok(Self {
            writer: StdMutex::new(Some(writer_tx)),
            pending,
            events,
            next_id: AtomicU64::new(1),
            tasks,
            child: Arc::new(Mutex::new(Some(child))),
        })
    }

    /// The queue carrying notifications, server requests, stderr, and unknowns.
    pub fn events(&self) -> Arc<EventQueue> {
        self.events.clone()
    }

    /// Sends a request and awaits its correlated response.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, AppServerError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let serialized = serde_json::to_string(&message)?;
        let (tx, rx) = oneshot::channel();

        {
            let mut guard = self.pending.lock().await;
            guard.insert(id, tx);
        }

        if self.write_line(serialized).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(AppServerError::Closed);
        }

        match time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AppServerError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(AppServerError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Fire-and-forget notification (no id, no response).
    pub fn notify(&self, method: &str, params: Value) -> Result<(), AppServerError> {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_line(serde_json::to_string(&message)?)
    }

    /// Replies to a server-initiated request.
    pub fn respond(&self, id: Value, result: Value) -> Result<(), AppServerError> {
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        });
        self.write_line(serde_json::to_string(&message)?)
    }

    /// Replies to a server-initiated request with an error.
    pub fn respond_error(
        &self,
        id: Value,
        code: i64,
        message: &str,
    ) -> Result<(), AppServerError> {
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message },
        });
        self.write_line(serde_json::to_string(&message)?)
    }

    /// Closes stdin, waits up to one second, then kills the child.
    ///
    /// All pending calls fail with [`AppServerError::Closed`] and a terminal
    /// [`ServerEvent::Closed`] is queued.
    pub async fn stop(&self) {
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(writer);

        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if time::timeout(SHUTDOWN_GRACE, child.wait()).await.is_err() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        *guard = None;
        drop(guard);

        fail_pending(&self.pending).await;
        self.events.push(ServerEvent::Closed);
    }

    fn write_line(&self, line: String) -> Result<(), AppServerError> {
        let guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) if tx.send(line).is_ok() => Ok(()),
            _ => Err(AppServerError::Closed),
        }
    }
}

impl Drop for AppServerTransport {
    fn drop(&mut self) {
        for handle in &self.tasks {
            handle.abort();
        }
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.start_kill();
            }
        }
    }
}

async fn spawn_with_retry(
    command: &mut Command,
    command_debug: &str,
) -> Result<Child, AppServerError> {
    let mut backoff = Duration::from_millis(2);
    let mut attempt = 0;
    loop {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                let is_busy = matches!(source.kind(), std::io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    attempt += 1;
                    time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(AppServerError::Spawn {
                    command: command_debug.to_string(),
                    source,
                });
            }
        }
    }
}

async fn writer_task(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(message) = rx.recv().await {
        if stdin.write_all(message.as_bytes()).await.is_err() {
            break;
        }
        if stdin.write_all(b"\n").await.is_err() {
            break;
        }
        let _ = stdin.flush().await;
    }

    // Channel closed: signal EOF so the backend can exit cleanly.
    let _ = stdin.shutdown().await;
}

async fn reader_task(stdout: ChildStdout, pending: Pending, events: Arc<EventQueue>) {
    let mut lines = BufReader::with_capacity(READ_BUFFER_BYTES, stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(err) => {
                debug!(%err, "non-JSON line on app-server stdout");
                events.push(ServerEvent::Unknown { raw: line });
                continue;
            }
        };

        match classify(value) {
            Incoming::Response { id, result, error } => {
                resolve_response(id, result, error, &pending).await;
            }
            Incoming::Request { id, method, params } => {
                events.push(ServerEvent::Request { id, method, params });
            }
            Incoming::Notification { method, params } => {
                events.push(ServerEvent::Notification { method, params });
            }
            Incoming::Unknown(value) => {
                events.push(ServerEvent::Unknown {
                    raw: value.to_string(),
                });
            }
        }
    }

    fail_pending(&pending).await;
    events.push(ServerEvent::Closed);
}

async fn stderr_task(stderr: ChildStderr, events: Arc<EventQueue>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        events.push(ServerEvent::Stderr { line });
    }
}

async fn resolve_response(
    id: Value,
    result: Option<Value>,
    error: Option<crate::protocol::RpcErrorBody>,
    pending: &Pending,
) {
    let Some(id) = parse_request_id(&id) else {
        warn!("response with non-numeric id");
        return;
    };

    let sender = { pending.lock().await.remove(&id) };
    let Some(tx) = sender else {
        debug!(id, "response for unknown or timed-out request");
        return;
    };

    let outcome = match error {
        Some(err) => Err(AppServerError::Rpc {
            code: err.code,
            message: err.message,
        }),
        None => Ok(result.unwrap_or(Value::Null)),
    };
    let _ = tx.send(outcome);
}

fn parse_request_id(value: &Value) -> Option<RequestId> {
    if let Some(num) = value.as_u64() {
        return Some(num);
    }
    value.as_str().and_then(|s| s.parse::<RequestId>().ok())
}

async fn fail_pending(pending: &Pending) {
    let mut guard = pending.lock().await;
    for (_, tx) in guard.drain() {
        let _ = tx.send(Err(AppServerError::Closed));
    }
}
