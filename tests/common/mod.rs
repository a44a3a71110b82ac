// Shared by several test binaries; each uses a subset
#![allow(dead_code)]

pub mod mock_worker;

use std::{sync::Arc, time::Duration};

use axum::{
    body::{to_bytes, Body},
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use pd_router::{
    config::{PolicyConfig, RetryConfig, RouterConfig, RoutingMode},
    core::{Worker, WorkerId},
    server::{build_app, build_client, AppState},
};
use serde_json::Value;
use tower::ServiceExt;

pub struct TestApp {
    pub state: Arc<AppState>,
    pub app: Router,
}

impl TestApp {
    pub fn new(config: RouterConfig) -> Self {
        let client = build_client(&config).expect("http client");
        let state = Arc::new(AppState::new(config, client).expect("valid test configuration"));
        let app = build_app(Arc::clone(&state), 16 * 1024 * 1024);
        Self { state, app }
    }

    pub async fn post(&self, route: &str, body: Value) -> TestResponse {
        self.post_with_headers(route, body, &[]).await
    }

    pub async fn post_with_headers(
        &self,
        route: &str,
        body: Value,
        headers: &[(&str, &str)],
    ) -> TestResponse {
        let mut builder = Request::post(route).header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let req = builder.body(Body::from(body.to_string())).unwrap();
        TestResponse::read(self.app.clone().oneshot(req).await.unwrap()).await
    }

    pub async fn get(&self, route: &str) -> TestResponse {
        let req = Request::get(route).body(Body::empty()).unwrap();
        TestResponse::read(self.app.clone().oneshot(req).await.unwrap()).await
    }

    pub fn worker(&self, id: &WorkerId) -> Arc<Worker> {
        self.state.registry.get(id).expect("worker registered")
    }

    pub fn worker_by_url(&self, url: &str) -> Arc<Worker> {
        self.state.registry.get_by_url(url).expect("worker registered")
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl TestResponse {
    async fn read(res: axum::response::Response) -> Self {
        let status = res.status();
        let headers = res.headers().clone();
        let body = to_bytes(res.into_body(), usize::MAX).await.unwrap().to_vec();
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("JSON response body")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn worker_id(&self) -> WorkerId {
        WorkerId::from_string(self.header("x-worker-id").expect("x-worker-id header"))
    }

    pub fn error_type(&self) -> String {
        self.json()["error"]["type"]
            .as_str()
            .unwrap_or_default()
            .to_string()
    }
}

pub fn regular_config(urls: &[&str], policy: PolicyConfig) -> RouterConfig {
    RouterConfig::new(
        RoutingMode::Regular {
            worker_urls: urls.iter().map(|u| u.to_string()).collect(),
        },
        policy,
    )
}

/// Retries with negligible backoff
pub fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
