use std::{fs, os::unix::fs::PermissionsExt, path::PathBuf};

use crate::transport::TransportConfig;

/// Writes an executable fake `app-server` that answers our dialect.
///
/// Behavior is keyed off the text of `sendUserMessage` items so tests can
/// script error responses, silence (for timeouts), server-initiated approval
/// requests, and garbage output.
pub(crate) fn write_fake_app_server() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("fake-codex");
    let script = r#"#!/usr/bin/env python3
import json
import sys

sys.stderr.write("fake app-server ready\n")
sys.stderr.flush()

conv_counter = 0

def send(payload):
    sys.stdout.write(json.dumps(payload) + "\n")
    sys.stdout.flush()

def item_text(params):
    parts = []
    for item in params.get("items", []):
        data = item.get("data") or {}
        if isinstance(data.get("text"), str):
            parts.append(data["text"])
    return "".join(parts)

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    msg = json.loads(line)
    method = msg.get("method")
    mid = msg.get("id")
    if method == "initialize":
        send({"jsonrpc": "2.0", "id": mid, "result": {}})
    elif method == "initialized":
        pass
    elif method == "newConversation":
        conv_counter += 1
        send({"jsonrpc": "2.0", "id": mid, "result": {"conversationId": "conv-%d" % conv_counter}})
    elif method == "addConversationListener":
        send({"jsonrpc": "2.0", "id": mid, "result": {}})
    elif method == "sendUserMessage":
        params = msg.get("params", {})
        text = item_text(params)
        conv = params.get("conversationId")
        if "slow" in text:
            continue
        if "boom" in text:
            send({"jsonrpc": "2.0", "id": mid, "error": {"code": -32000, "message": "backend exploded"}})
            continue
        if "garbage" in text:
            sys.stdout.write("this is not json\n")
            sys.stdout.flush()
        if "ask-exec" in text:
            send({"jsonrpc": "2.0", "id": 7001, "method": "execCommandApproval",
                  "params": {"command": ["rm", "-rf", "/"], "conversationId": conv}})
        send({"jsonrpc": "2.0", "id": mid, "result": {}})
        send({"jsonrpc": "2.0", "method": "assistant_message",
              "params": {"conversationId": conv, "text": "echo: " + text}})
    elif method == "die":
        break
    elif mid is not None:
        send({"jsonrpc": "2.0", "id": mid, "error": {"code": -32601, "message": "method not found"}})
"#;

    fs::write(&script_path, script).expect("write script");
    let mut perms = fs::metadata(&script_path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms).expect("chmod");
    (dir, script_path)
}

pub(crate) fn test_config(binary: PathBuf) -> TransportConfig {
    TransportConfig::new(binary)
}
