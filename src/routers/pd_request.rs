//! Request bodies for the two PD stages
//!
//! The prefill stage computes the KV cache only: it is asked for a single
//! token, never streams, and is told to hand its KV cache to a remote decode
//! worker. The decode stage receives the original request plus whatever KV
//! transfer parameters the prefill worker returned. Both stages carry the same
//! bootstrap coordinates so the decode worker can locate the prefill's cache.

use serde_json::{json, Map, Value};

use crate::core::{RouterError, RouterResult, Worker};

/// Rendezvous fields shared by a prefill/decode pair
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapInfo {
    host: Value,
    port: Value,
    room: Value,
}

impl BootstrapInfo {
    pub fn for_prefill(body: &Value, prefill: &Worker) -> RouterResult<Self> {
        let hostname = hostname(prefill.url());
        let port = prefill.bootstrap_port();

        Ok(match batch_size(body)? {
            Some(n) => Self {
                host: json!(vec![hostname; n]),
                port: json!(vec![port; n]),
                room: json!((0..n).map(|_| random_room()).collect::<Vec<_>>()),
            },
            None => Self {
                host: json!(hostname),
                port: json!(port),
                room: json!(random_room()),
            },
        })
    }

    fn apply(&self, body: &mut Map<String, Value>) {
        body.insert("bootstrap_host".to_string(), self.host.clone());
        body.insert("bootstrap_port".to_string(), self.port.clone());
        body.insert("bootstrap_room".to_string(), self.room.clone());
    }
}

pub fn prepare_prefill_request(original: &Value, bootstrap: &BootstrapInfo) -> RouterResult<Value> {
    let mut body = object(original)?;

    body.insert("max_tokens".to_string(), json!(1));
    if body.contains_key("max_completion_tokens") {
        body.insert("max_completion_tokens".to_string(), json!(1));
    }
    if let Some(min_tokens) = body.get("min_tokens").and_then(Value::as_u64) {
        body.insert("min_tokens".to_string(), json!(min_tokens.min(1)));
    }
    if let Some(Value::Object(params)) = body.get_mut("sampling_params") {
        params.insert("max_new_tokens".to_string(), json!(1));
    }
    body.insert("stream".to_string(), json!(false));
    body.remove("stream_options");
    body.insert(
        "kv_transfer_params".to_string(),
        json!({
            "do_remote_decode": true,
            "do_remote_prefill": false,
            "remote_engine_id": null,
            "remote_block_ids": null,
            "remote_host": null,
            "remote_port": null,
        }),
    );
    bootstrap.apply(&mut body);

    Ok(Value::Object(body))
}

/// The original request, with KV transfer parameters from the prefill
/// response when it returned any.
pub fn prepare_decode_request(
    original: &Value,
    prefill_response: Option<&Value>,
    bootstrap: &BootstrapInfo,
) -> RouterResult<Value> {
    let mut body = object(original)?;
    if let Some(params) = prefill_response.and_then(|r| r.get("kv_transfer_params")) {
        if !params.is_null() {
            body.insert("kv_transfer_params".to_string(), params.clone());
        }
    }
    bootstrap.apply(&mut body);
    Ok(Value::Object(body))
}

fn object(value: &Value) -> RouterResult<Map<String, Value>> {
    value
        .as_object()
        .cloned()
        .ok_or_else(|| RouterError::InvalidRequest("Request body must be a JSON object".into()))
}

/// Number of sequences in a batched request, `None` for a single one
fn batch_size(body: &Value) -> RouterResult<Option<usize>> {
    if let Some(n) = body.get("n").and_then(Value::as_u64) {
        if n > 1 {
            return Ok(Some(n as usize));
        }
    }
    for field in ["prompt", "text", "input_ids"] {
        let Some(Value::Array(items)) = body.get(field) else {
            continue;
        };
        // input_ids of a single request is a flat list of token ids
        if field == "input_ids" && !items.iter().all(Value::is_array) {
            continue;
        }
        if items.is_empty() {
            return Err(RouterError::InvalidRequest(format!(
                "Batch {} array is empty",
                field
            )));
        }
        return Ok(Some(items.len()));
    }
    Ok(None)
}

fn hostname(worker_url: &str) -> String {
    url::Url::parse(worker_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| worker_url.to_string())
}

fn random_room() -> u64 {
    rand::random::<u64>() & (i64::MAX as u64)
}
