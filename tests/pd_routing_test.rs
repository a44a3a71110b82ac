mod common;

use std::collections::HashMap;

use common::{
    fast_retry,
    mock_worker::{FailureMode, MockWorker, WorkerType},
    TestApp,
};
use pd_router::{
    config::{ConfigError, DiscoveryConfig, PolicyConfig, RouterConfig, RoutingMode},
    core::{PoolRole, RouterError},
    server::AppState,
};
use serde_json::{json, Value};

struct PdCluster {
    prefill: Vec<MockWorker>,
    decode: Vec<MockWorker>,
}

impl PdCluster {
    async fn start(prefill: usize, decode: usize) -> Self {
        let mut cluster = Self {
            prefill: Vec::new(),
            decode: Vec::new(),
        };
        for _ in 0..prefill {
            cluster.prefill.push(MockWorker::with_type(WorkerType::Prefill).await);
        }
        for _ in 0..decode {
            cluster.decode.push(MockWorker::with_type(WorkerType::Decode).await);
        }
        cluster
    }

    fn config(
        &self,
        policy: PolicyConfig,
        prefill_policy: Option<PolicyConfig>,
        decode_policy: Option<PolicyConfig>,
    ) -> RouterConfig {
        RouterConfig::new(
            RoutingMode::PrefillDecode {
                prefill_urls: self
                    .prefill
                    .iter()
                    .enumerate()
                    .map(|(i, w)| (w.url().to_string(), Some(9000 + i as u16)))
                    .collect(),
                decode_urls: self.decode.iter().map(|w| w.url().to_string()).collect(),
                prefill_policy,
                decode_policy,
            },
            policy,
        )
    }

    fn by_name<'a>(workers: &'a [MockWorker], name: &Value) -> &'a MockWorker {
        workers
            .iter()
            .find(|w| w.name() == name.as_str().unwrap_or_default())
            .expect("response names a known worker")
    }
}

#[tokio::test]
async fn test_two_stage_request_bodies() {
    let cluster = PdCluster::start(1, 1).await;
    let app = TestApp::new(cluster.config(PolicyConfig::RoundRobin, None, None));

    let res = app
        .post(
            "/v1/completions",
            json!({"model": "m", "prompt": "hello", "max_tokens": 64, "min_tokens": 4}),
        )
        .await;
    assert_eq!(res.status, 200);

    let decode_id = res.worker_id();
    assert_eq!(app.worker(&decode_id).role(), PoolRole::Decode);
    let prefill_id = res.header("x-prefill-worker-id").expect("prefill worker header");
    assert_eq!(
        app.worker(&pd_router::core::WorkerId::from_string(prefill_id)).role(),
        PoolRole::Prefill
    );

    let prefill_requests = cluster.prefill[0].requests();
    let prefill_body = &prefill_requests[0];
    assert_eq!(prefill_body["max_tokens"], 1);
    assert_eq!(prefill_body["min_tokens"], 1);
    assert_eq!(prefill_body["stream"], false);
    assert_eq!(prefill_body["kv_transfer_params"]["do_remote_decode"], true);
    assert_eq!(prefill_body["bootstrap_host"], "127.0.0.1");
    assert_eq!(prefill_body["bootstrap_port"], 9000);

    let decode_requests = cluster.decode[0].requests();
    let decode_body = &decode_requests[0];
    assert_eq!(decode_body["max_tokens"], 64);
    assert_eq!(decode_body["min_tokens"], 4);
    assert_eq!(
        decode_body["kv_transfer_params"]["remote_engine_id"],
        cluster.prefill[0].name()
    );
    assert_eq!(decode_body["bootstrap_room"], prefill_body["bootstrap_room"]);

    // The client sees the decode worker's answer
    assert_eq!(res.json()["worker"], cluster.decode[0].name());
}

#[tokio::test]
async fn test_pools_follow_independent_policies() {
    let cluster = PdCluster::start(2, 3).await;
    let app = TestApp::new(cluster.config(
        PolicyConfig::Random,
        Some(PolicyConfig::RoundRobin),
        Some(PolicyConfig::ConsistentHash),
    ));

    let mut decode_ids = Vec::new();
    for i in 0..20 {
        let res = app
            .post(
                "/generate",
                json!({"text": format!("q{}", i), "session_params": {"session_id": "pinned"}}),
            )
            .await;
        assert_eq!(res.status, 200);
        decode_ids.push(res.worker_id());
    }

    // Round robin over prefill, hash-pinned decode
    assert_eq!(cluster.prefill[0].request_count(), 10);
    assert_eq!(cluster.prefill[1].request_count(), 10);
    assert!(decode_ids.windows(2).all(|w| w[0] == w[1]));
    let busy: Vec<usize> = cluster.decode.iter().map(|w| w.request_count()).collect();
    assert_eq!(busy.iter().filter(|&&c| c == 20).count(), 1);
    assert_eq!(busy.iter().sum::<usize>(), 20);
}

#[tokio::test]
async fn test_prefill_and_decode_spread_separately() {
    let cluster = PdCluster::start(2, 2).await;
    let app = TestApp::new(cluster.config(PolicyConfig::RoundRobin, None, None));

    let mut prefill_ids: HashMap<String, usize> = HashMap::new();
    for _ in 0..8 {
        let res = app.post("/generate", json!({"text": "hi"})).await;
        assert_eq!(res.status, 200);
        PdCluster::by_name(&cluster.decode, &res.json()["worker"]);
        *prefill_ids
            .entry(res.header("x-prefill-worker-id").unwrap().to_string())
            .or_default() += 1;
    }
    assert_eq!(prefill_ids.len(), 2);
    for w in cluster.prefill.iter().chain(cluster.decode.iter()) {
        assert_eq!(w.request_count(), 4);
    }
}

#[tokio::test]
async fn test_failed_prefill_retries_whole_pair() {
    let cluster = PdCluster::start(2, 1).await;
    cluster.prefill[0].set_failure(FailureMode::Status(500)).await;
    let app = TestApp::new(RouterConfig {
        retry: fast_retry(2),
        ..cluster.config(PolicyConfig::RoundRobin, None, None)
    });

    for _ in 0..4 {
        let res = app.post("/generate", json!({"text": "hi"})).await;
        assert_eq!(res.status, 200);
    }
    // Decode only ever sees requests whose prefill succeeded
    assert_eq!(cluster.decode[0].request_count(), 4);
    assert_eq!(cluster.prefill[1].request_count(), 4);
    for w in app.state.registry.all() {
        assert_eq!(w.load(), 0);
    }
}

#[tokio::test]
async fn test_prefill_client_error_is_forwarded() {
    let cluster = PdCluster::start(1, 1).await;
    cluster.prefill[0].set_failure(FailureMode::Status(400)).await;
    let app = TestApp::new(cluster.config(PolicyConfig::RoundRobin, None, None));

    let res = app.post("/generate", json!({"text": "hi"})).await;
    assert_eq!(res.status, 400);
    assert_eq!(cluster.decode[0].request_count(), 0);
    for w in app.state.registry.all() {
        assert_eq!(w.load(), 0);
    }
}

#[tokio::test]
async fn test_streaming_decode() {
    let cluster = PdCluster::start(1, 1).await;
    let app = TestApp::new(cluster.config(PolicyConfig::RoundRobin, None, None));

    let res = app
        .post("/v1/completions", json!({"prompt": "hello", "stream": true}))
        .await;
    assert_eq!(res.status, 200);
    assert!(res.text().contains("[DONE]"));
    assert_eq!(cluster.prefill[0].requests()[0]["stream"], false);
    assert_eq!(cluster.decode[0].requests()[0]["stream"], true);
}

#[tokio::test]
async fn test_batch_request_bootstrap_fields() {
    let cluster = PdCluster::start(1, 1).await;
    let app = TestApp::new(cluster.config(PolicyConfig::RoundRobin, None, None));

    let res = app
        .post("/generate", json!({"text": ["a", "b"], "sampling_params": {"max_new_tokens": 8}}))
        .await;
    assert_eq!(res.status, 200);

    let prefill_requests = cluster.prefill[0].requests();
    let prefill_body = &prefill_requests[0];
    assert_eq!(prefill_body["sampling_params"]["max_new_tokens"], 1);
    assert_eq!(prefill_body["bootstrap_room"].as_array().unwrap().len(), 2);
    assert_eq!(prefill_body["bootstrap_port"], json!([9000, 9000]));
    let decode_requests = cluster.decode[0].requests();
    let decode_body = &decode_requests[0];
    assert_eq!(decode_body["sampling_params"]["max_new_tokens"], 8);
}

#[test]
fn test_startup_validation_requires_workers_or_discovery() {
    let mode = RoutingMode::PrefillDecode {
        prefill_urls: vec![],
        decode_urls: vec![],
        prefill_policy: None,
        decode_policy: None,
    };

    let err = AppState::new(
        RouterConfig::new(mode.clone(), PolicyConfig::RoundRobin),
        reqwest::Client::new(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        RouterError::Config(ConfigError::PdConfiguration { .. })
    ));

    let config = RouterConfig {
        discovery: Some(DiscoveryConfig { enabled: true }),
        ..RouterConfig::new(mode, PolicyConfig::RoundRobin)
    };
    assert!(AppState::new(config, reqwest::Client::new()).is_ok());
}

#[tokio::test]
async fn test_pd_workers_added_at_runtime() {
    let prefill = MockWorker::with_type(WorkerType::Prefill).await;
    let decode = MockWorker::with_type(WorkerType::Decode).await;
    let app = TestApp::new(RouterConfig {
        discovery: Some(DiscoveryConfig { enabled: true }),
        ..RouterConfig::new(
            RoutingMode::PrefillDecode {
                prefill_urls: vec![],
                decode_urls: vec![],
                prefill_policy: None,
                decode_policy: None,
            },
            PolicyConfig::RoundRobin,
        )
    });

    assert_eq!(app.get("/readiness").await.status, 503);
    let res = app.post("/generate", json!({"text": "hi"})).await;
    assert_eq!(res.status, 503);
    assert_eq!(res.error_type(), "no_healthy_worker");

    let res = app
        .post(
            "/workers",
            json!({"url": prefill.url(), "role": "prefill", "bootstrap_port": 8998}),
        )
        .await;
    assert_eq!(res.status, 201);
    let res = app.post("/workers", json!({"url": decode.url(), "role": "decode"})).await;
    assert_eq!(res.status, 201);

    assert_eq!(app.get("/readiness").await.status, 200);
    let res = app.post("/generate", json!({"text": "hi"})).await;
    assert_eq!(res.status, 200);
    assert_eq!(prefill.requests()[0]["bootstrap_port"], 8998);
}
