//! Session/user affinity key extraction
//!
//! Headers are checked first (`x-session-id`, then `x-user-id`), then the
//! request body: `session_params.session_id` > `session_params.user_id` >
//! top-level `user`. Older clients that send top-level `session_id` /
//! `user_id`, or only tenant and tracing headers, are matched after that.
//! The first non-empty value wins.

use std::fmt;

use axum::http::HeaderMap;
use serde_json::Value;

const SESSION_HEADER: &str = "x-session-id";
const USER_HEADER: &str = "x-user-id";
/// Lowest priority, in order
const FALLBACK_HEADERS: [&str; 4] = [
    "x-tenant-id",
    "x-request-id",
    "x-correlation-id",
    "x-trace-id",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoutingKey {
    Session(String),
    User(String),
    /// Value of one of the fallback headers
    Header(&'static str, String),
}

impl RoutingKey {
    pub fn from_request(headers: &HeaderMap, body: &Value) -> Option<Self> {
        Self::from_headers(headers)
            .or_else(|| Self::from_body(body))
            .or_else(|| Self::from_legacy_body(body))
            .or_else(|| Self::from_fallback_headers(headers))
    }

    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        header_value(headers, SESSION_HEADER)
            .map(RoutingKey::Session)
            .or_else(|| header_value(headers, USER_HEADER).map(RoutingKey::User))
    }

    pub fn from_body(body: &Value) -> Option<Self> {
        let session_params = body.get("session_params");
        session_params
            .and_then(|p| key_value(p.get("session_id")))
            .map(RoutingKey::Session)
            .or_else(|| {
                session_params
                    .and_then(|p| key_value(p.get("user_id")))
                    .map(RoutingKey::User)
            })
            .or_else(|| key_value(body.get("user")).map(RoutingKey::User))
    }

    /// Top-level `session_id`, then `user_id`
    pub fn from_legacy_body(body: &Value) -> Option<Self> {
        key_value(body.get("session_id"))
            .map(RoutingKey::Session)
            .or_else(|| key_value(body.get("user_id")).map(RoutingKey::User))
    }

    pub fn from_fallback_headers(headers: &HeaderMap) -> Option<Self> {
        FALLBACK_HEADERS.iter().find_map(|name| {
            header_value(headers, name).map(|value| RoutingKey::Header(*name, value))
        })
    }

    /// Key as placed on the hash ring
    pub fn hash_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingKey::Session(id) => write!(f, "session:{}", id),
            RoutingKey::User(id) => write!(f, "user:{}", id),
            RoutingKey::Header(name, value) => write!(f, "header:{}:{}", name, value),
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Strings and integers are accepted; empty strings and anything else are not.
fn key_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_session_id_beats_user_id_and_user() {
        let body = json!({
            "session_params": {"session_id": "s1", "user_id": "u1"},
            "user": "top"
        });
        assert_eq!(
            RoutingKey::from_body(&body),
            Some(RoutingKey::Session("s1".to_string()))
        );
    }

    #[test]
    fn test_session_user_id_beats_top_level_user() {
        let body = json!({
            "session_params": {"user_id": "u1"},
            "user": "top"
        });
        assert_eq!(
            RoutingKey::from_body(&body),
            Some(RoutingKey::User("u1".to_string()))
        );
    }

    #[test]
    fn test_top_level_user() {
        let body = json!({"prompt": "hi", "user": "top"});
        assert_eq!(
            RoutingKey::from_body(&body),
            Some(RoutingKey::User("top".to_string()))
        );
    }

    #[test]
    fn test_absent_key() {
        assert_eq!(RoutingKey::from_body(&json!({"prompt": "hi"})), None);
        assert_eq!(
            RoutingKey::from_request(&HeaderMap::new(), &json!({"session_params": {}})),
            None
        );
    }

    #[test]
    fn test_empty_values_are_skipped() {
        let body = json!({
            "session_params": {"session_id": "", "user_id": "  "},
            "user": "fallback"
        });
        assert_eq!(
            RoutingKey::from_body(&body),
            Some(RoutingKey::User("fallback".to_string()))
        );
    }

    #[test]
    fn test_integer_ids() {
        let body = json!({"session_params": {"session_id": 42}});
        assert_eq!(RoutingKey::from_body(&body).unwrap().hash_key(), "session:42");
    }

    #[test]
    fn test_headers_take_precedence_over_body() {
        let body = json!({"session_params": {"session_id": "body-session"}});
        let key = RoutingKey::from_request(&headers(&[("x-user-id", "hdr-user")]), &body);
        assert_eq!(key, Some(RoutingKey::User("hdr-user".to_string())));

        let key = RoutingKey::from_request(
            &headers(&[("x-user-id", "hdr-user"), ("x-session-id", "hdr-session")]),
            &body,
        );
        assert_eq!(key, Some(RoutingKey::Session("hdr-session".to_string())));
    }

    #[test]
    fn test_empty_header_falls_through() {
        let body = json!({"user": "body-user"});
        let key = RoutingKey::from_request(&headers(&[("x-session-id", "")]), &body);
        assert_eq!(key, Some(RoutingKey::User("body-user".to_string())));
    }

    #[test]
    fn test_hash_key_namespacing() {
        assert_eq!(RoutingKey::Session("a".into()).hash_key(), "session:a");
        assert_eq!(RoutingKey::User("a".into()).hash_key(), "user:a");
        assert_eq!(
            RoutingKey::Header("x-tenant-id", "a".into()).hash_key(),
            "header:x-tenant-id:a"
        );
    }

    #[test]
    fn test_legacy_body_fields_rank_below_user() {
        let body = json!({"session_id": "legacy-s", "user_id": "legacy-u"});
        assert_eq!(
            RoutingKey::from_request(&HeaderMap::new(), &body),
            Some(RoutingKey::Session("legacy-s".to_string()))
        );

        let body = json!({"user_id": "legacy-u"});
        assert_eq!(
            RoutingKey::from_request(&HeaderMap::new(), &body),
            Some(RoutingKey::User("legacy-u".to_string()))
        );

        let body = json!({"session_id": "legacy-s", "user": "top"});
        assert_eq!(
            RoutingKey::from_request(&HeaderMap::new(), &body),
            Some(RoutingKey::User("top".to_string()))
        );
    }

    #[test]
    fn test_fallback_headers_are_last_resort() {
        let tracing_only = headers(&[("x-trace-id", "t1"), ("x-tenant-id", "acme")]);
        assert_eq!(
            RoutingKey::from_request(&tracing_only, &json!({"prompt": "hi"})),
            Some(RoutingKey::Header("x-tenant-id", "acme".to_string()))
        );

        assert_eq!(
            RoutingKey::from_request(&tracing_only, &json!({"user_id": "legacy-u"})),
            Some(RoutingKey::User("legacy-u".to_string()))
        );

        let request_id = headers(&[("x-request-id", "r1"), ("x-correlation-id", "c1")]);
        assert_eq!(
            RoutingKey::from_request(&request_id, &json!({}))
                .unwrap()
                .hash_key(),
            "header:x-request-id:r1"
        );
    }
}
