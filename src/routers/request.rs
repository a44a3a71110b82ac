use axum::http::HeaderMap;
use serde_json::Value;

use super::header_utils::forward_request_headers;
use crate::{
    core::{RouterError, RouterResult},
    policies::{utils::extract_request_text, RoutingKey, SelectWorkerInfo},
};

/// An inference request as the routers see it: the parsed body plus the
/// attributes policies select on.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    route: &'static str,
    headers: HeaderMap,
    body: Value,
    stream: bool,
    routing_key: Option<String>,
    text: Option<String>,
}

impl RouteRequest {
    pub fn parse(route: &'static str, headers: &HeaderMap, body: &[u8]) -> RouterResult<Self> {
        let body: Value = serde_json::from_slice(body)
            .map_err(|e| RouterError::InvalidRequest(format!("Invalid JSON body: {}", e)))?;
        Self::from_json(route, headers, body)
    }

    pub fn from_json(route: &'static str, headers: &HeaderMap, body: Value) -> RouterResult<Self> {
        if !body.is_object() {
            return Err(RouterError::InvalidRequest(
                "Request body must be a JSON object".to_string(),
            ));
        }
        let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let routing_key = RoutingKey::from_request(headers, &body).map(|k| k.hash_key());
        let text = extract_request_text(&body);

        Ok(Self {
            route,
            headers: forward_request_headers(headers),
            body,
            stream,
            routing_key,
            text,
        })
    }

    pub fn route(&self) -> &'static str {
        self.route
    }

    /// Headers to forward to workers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn is_stream(&self) -> bool {
        self.stream
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    pub fn select_info(&self) -> SelectWorkerInfo<'_> {
        SelectWorkerInfo {
            routing_key: self.routing_key.as_deref(),
            request_text: self.text.as_deref(),
        }
    }
}
