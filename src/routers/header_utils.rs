use axum::http::{
    header::{CONTENT_LENGTH, CONTENT_TYPE, HOST},
    HeaderMap, HeaderName, HeaderValue,
};

use crate::core::WorkerId;

pub const WORKER_ID_HEADER: &str = "x-worker-id";
pub const PREFILL_WORKER_ID_HEADER: &str = "x-prefill-worker-id";

/// Client headers to pass on to a worker. Body framing headers are dropped
/// because the router re-serializes the body.
pub fn forward_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if name == CONTENT_TYPE || name == CONTENT_LENGTH || name == HOST {
            continue;
        }
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

/// Worker response headers to return to the client
pub fn preserve_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        let lower = name.as_str();
        // Let hyper recompute framing and encoding
        if is_hop_by_hop(lower) || lower == "content-length" || lower == "content-encoding" {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

pub fn set_worker_id(headers: &mut HeaderMap, name: &'static str, id: &WorkerId) {
    if let Ok(value) = HeaderValue::from_str(id.as_str()) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_request_headers_filters_framing() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        headers.insert(HOST, HeaderValue::from_static("router:3001"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));
        headers.insert("x-session-id", HeaderValue::from_static("s1"));

        let forwarded = forward_request_headers(&headers);
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded.get("authorization").unwrap(), "Bearer t");
        assert_eq!(forwarded.get("x-session-id").unwrap(), "s1");
    }

    #[test]
    fn test_preserve_response_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-custom", HeaderValue::from_static("v"));

        let preserved = preserve_response_headers(&headers);
        assert!(preserved.get("transfer-encoding").is_none());
        assert_eq!(preserved.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(preserved.get("x-custom").unwrap(), "v");
    }

    #[test]
    fn test_set_worker_id() {
        let mut headers = HeaderMap::new();
        set_worker_id(&mut headers, WORKER_ID_HEADER, &WorkerId::from_string("w-1"));
        assert_eq!(headers.get("X-Worker-Id").unwrap(), "w-1");
    }
}
