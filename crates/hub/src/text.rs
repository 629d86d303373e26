use serde_json::Value;

/// Item types whose `text` participates in assistant output.
const TEXT_ITEM_TYPES: [&str; 3] = ["text", "assistant_delta", "assistant_message"];

/// Pulls the assistant text out of a notification's params.
///
/// Preference order: a top-level `text` string; the `text` of qualifying
/// entries in `items`/`deltas`; flattened `message`/`content` shapes
/// (string, `{text}`, `{content: [...]}`, or lists thereof).
pub fn extract_text(params: &Value) -> String {
    if let Some(text) = params.get("text").and_then(Value::as_str) {
        return text.to_string();
    }

    let mut parts: Vec<String> = Vec::new();
    for key in ["items", "deltas"] {
        let Some(items) = params.get(key).and_then(Value::as_array) else {
            continue;
        };
        for item in items {
            let item_type = item.get("type").and_then(Value::as_str).unwrap_or("");
            if !TEXT_ITEM_TYPES.contains(&item_type) {
                continue;
            }
            if let Some(text) = item.get("text").and_then(Value::as_str) {
                parts.push(text.to_string());
            }
        }
    }

    if parts.is_empty() {
        for key in ["message", "content"] {
            if let Some(value) = params.get(key) {
                flatten_message(value, &mut parts);
                if !parts.is_empty() {
                    break;
                }
            }
        }
    }

    parts.join("")
}

fn flatten_message(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(text) => out.push(text.clone()),
        Value::Array(items) => {
            for item in items {
                flatten_message(item, out);
            }
        }
        Value::Object(map) => {
            if let Some(text) = map.get("text").and_then(Value::as_str) {
                out.push(text.to_string());
            } else if let Some(content) = map.get("content") {
                flatten_message(content, out);
            }
        }
        _ => {}
    }
}
