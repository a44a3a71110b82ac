use serde_json::Value;

/// Text used for prefix affinity: `text`, `prompt` (string or list of
/// strings), or the concatenated `messages[].content` of a chat request.
pub fn extract_request_text(body: &Value) -> Option<String> {
    if let Some(text) = body.get("text").and_then(Value::as_str) {
        return Some(text.to_string());
    }

    match body.get("prompt") {
        Some(Value::String(prompt)) => return Some(prompt.clone()),
        Some(Value::Array(items)) => {
            let joined: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
            if !joined.is_empty() {
                return Some(joined.join(" "));
            }
        }
        _ => {}
    }

    let messages = body.get("messages")?.as_array()?;
    let mut text = String::new();
    for message in messages {
        match message.get("content") {
            Some(Value::String(content)) => text.push_str(content),
            // Multimodal content parts: keep the text ones
            Some(Value::Array(parts)) => {
                for part in parts {
                    if let Some(t) = part.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                }
            }
            _ => {}
        }
    }
    (!text.is_empty()).then_some(text)
}
