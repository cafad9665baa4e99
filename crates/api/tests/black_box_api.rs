use std::sync::Arc;

use drainq_api::app::{self, services};
use drainq_extract::{ExtractError, Extractor, FallbackPolicy, FieldSet, HeuristicExtractor, StructuredResult};
use drainq_infra::QueueConfig;
use reqwest::StatusCode;
use serde_json::{json, Value};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Same router and continuation transport as prod: continuations are posted back
    /// to this server's `/drain`. In-memory store, ephemeral port.
    async fn spawn(config: QueueConfig, primary: Arc<dyn Extractor>) -> Self {
        Self::start(config, primary, true).await
    }

    /// Continuations run on the in-process worker instead.
    async fn in_process(config: QueueConfig, primary: Arc<dyn Extractor>) -> Self {
        Self::start(config, primary, false).await
    }

    async fn start(config: QueueConfig, primary: Arc<dyn Extractor>, over_http: bool) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let mut settings = services::Settings::in_memory(config);
        if over_http {
            settings = settings.with_self_url(base_url.clone());
        }
        let wiring = services::build_services(settings, primary)
            .await
            .expect("failed to wire services");
        let app = app::build_app(wiring.services.clone());

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
            wiring.shutdown().await;
        });

        Self { base_url, handle }
    }

    async fn heuristic() -> Self {
        Self::spawn(QueueConfig::default(), Arc::new(HeuristicExtractor::new())).await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Primary extractor that never succeeds.
struct Unavailable;

#[async_trait::async_trait]
impl Extractor for Unavailable {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    async fn extract(&self, _text: &str, _fields: &FieldSet) -> Result<StructuredResult, ExtractError> {
        Err(ExtractError::upstream("503 service unavailable"))
    }
}

async fn submit(client: &reqwest::Client, base_url: &str, owner: &str, text: &str) -> String {
    let res = client
        .post(format!("{}/jobs", base_url))
        .json(&json!({ "owner": owner, "text": text, "fields": ["name", "email"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: Value = res.json().await.unwrap();
    body["job_id"].as_str().unwrap().to_string()
}

async fn get_json(client: &reqwest::Client, url: String) -> Value {
    let res = client.get(url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    res.json().await.unwrap()
}

async fn status_eventually(client: &reqwest::Client, base_url: &str, owner: &str) -> Value {
    // The drain runs in its own request (or on the worker), not inside the trigger.
    for _ in 0..100 {
        let status = get_json(client, format!("{}/status/{}", base_url, owner)).await;
        if status["progress_percent"] == 100 {
            return status;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    panic!("owner {owner} did not finish draining within timeout");
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::heuristic().await;

    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn submit_rejects_bad_input() {
    let srv = TestServer::heuristic().await;
    let client = reqwest::Client::new();

    for body in [
        json!({ "owner": "u1", "text": "   " }),
        json!({ "owner": "has space", "text": "Ada" }),
        json!({ "owner": "u1", "text": "Ada", "fields": ["shoe_size"] }),
        json!({ "owner": "u1", "text": "Ada", "fields": [] }),
    ] {
        let res = client.post(format!("{}/jobs", srv.base_url)).json(&body).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "body: {body}");
        let err: Value = res.json().await.unwrap();
        assert!(err["error"].is_string());
    }
}

#[tokio::test]
async fn submitted_job_waits_in_the_queue() {
    let srv = TestServer::heuristic().await;
    let client = reqwest::Client::new();

    let job_id = submit(&client, &srv.base_url, "u1", "Ada Lovelace\nada@engines.example").await;

    let job = get_json(&client, format!("{}/jobs/{}", srv.base_url, job_id)).await;
    assert_eq!(job["status"], "queued");
    assert_eq!(job["attempt"], 0);

    let status = get_json(&client, format!("{}/status/u1", srv.base_url)).await;
    assert_eq!(status["counts"]["queued"], 1);
    assert_eq!(status["needs_dispatch"], true);

    let res = client
        .get(format!("{}/jobs/{}", srv.base_url, "0190a5b4-0000-7000-8000-000000000000"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn trigger_acks_then_the_queue_drains_in_the_background() {
    let srv = TestServer::heuristic().await;
    let client = reqwest::Client::new();

    let first = submit(&client, &srv.base_url, "u1", "Ada Lovelace\nada@engines.example").await;
    submit(&client, &srv.base_url, "u1", "Grace Hopper\ngrace@navy.example").await;

    let res = client
        .post(format!("{}/trigger", srv.base_url))
        .json(&json!({ "owner": "u1", "job_id": first }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let ack: Value = res.json().await.unwrap();
    assert_eq!(ack["accepted"], true);
    assert_eq!(ack["continuation_emitted"], true);
    assert_eq!(ack["reclaim"]["reset"], 0);

    let status = status_eventually(&client, &srv.base_url, "u1").await;
    assert_eq!(status["counts"]["done"], 2);
    assert_eq!(status["needs_dispatch"], false);
    assert_eq!(status["is_stuck"], false);

    let job = get_json(&client, format!("{}/jobs/{}", srv.base_url, first)).await;
    assert_eq!(job["status"], "done");
    assert_eq!(job["outcome"]["kind"], "success");
    assert_eq!(job["outcome"]["result"]["email"], json!(["ada@engines.example"]));
}

#[tokio::test]
async fn trigger_for_someone_elses_job_is_refused() {
    let srv = TestServer::heuristic().await;
    let client = reqwest::Client::new();
    let job_id = submit(&client, &srv.base_url, "u1", "Ada Lovelace").await;

    let res = client
        .post(format!("{}/trigger", srv.base_url))
        .json(&json!({ "owner": "u2", "job_id": job_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let ack: Value = res.json().await.unwrap();
    assert_eq!(ack["accepted"], false);
    assert_eq!(ack["continuation_emitted"], false);
}

#[tokio::test]
async fn drain_reports_the_dispatch_not_the_job_failures() {
    let config = QueueConfig {
        max_attempts: 2,
        fallback: FallbackPolicy::Never,
        ..QueueConfig::default()
    };
    let srv = TestServer::spawn(config, Arc::new(Unavailable)).await;
    let client = reqwest::Client::new();
    let job_id = submit(&client, &srv.base_url, "u1", "Ada Lovelace").await;

    let res = client
        .post(format!("{}/drain", srv.base_url))
        .json(&json!({ "owner": "u1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report: Value = res.json().await.unwrap();
    assert_eq!(report["chain_depth"], 0);
    assert_eq!(report["dispatched"], 2);
    assert_eq!(report["requeued"], 1);
    assert_eq!(report["killed"], 1);
    assert_eq!(report["remaining"], false);

    let job = get_json(&client, format!("{}/jobs/{}", srv.base_url, job_id)).await;
    assert_eq!(job["status"], "dead");
    assert_eq!(job["attempt"], 2);
    assert!(job["outcome"]["error"].as_str().unwrap().contains("503"));
}

#[tokio::test]
async fn continuation_request_runs_as_its_own_drain() {
    let srv = TestServer::heuristic().await;
    let client = reqwest::Client::new();
    submit(&client, &srv.base_url, "u1", "Ada Lovelace").await;

    // The body an upstream invocation posts when it runs out of budget.
    let res = client
        .post(format!("{}/drain", srv.base_url))
        .json(&json!({ "owner": "u1", "chain_depth": 3, "requested_at": "2026-01-01T00:00:00Z" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report: Value = res.json().await.unwrap();
    assert_eq!(report["chain_depth"], 3);
    assert_eq!(report["succeeded"], 1);

    let status = get_json(&client, format!("{}/status/u1", srv.base_url)).await;
    assert_eq!(status["counts"]["done"], 1);
}

#[tokio::test]
async fn in_process_worker_drains_after_a_trigger() {
    let srv = TestServer::in_process(QueueConfig::default(), Arc::new(HeuristicExtractor::new())).await;
    let client = reqwest::Client::new();
    let job_id = submit(&client, &srv.base_url, "u1", "Ada Lovelace").await;

    let res = client
        .post(format!("{}/trigger", srv.base_url))
        .json(&json!({ "owner": "u1", "job_id": job_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    let status = status_eventually(&client, &srv.base_url, "u1").await;
    assert_eq!(status["counts"]["done"], 1);
}

#[tokio::test]
async fn retention_sweep_keeps_recent_jobs() {
    let srv = TestServer::heuristic().await;
    let client = reqwest::Client::new();
    let job_id = submit(&client, &srv.base_url, "u1", "Ada Lovelace").await;
    client
        .post(format!("{}/drain", srv.base_url))
        .json(&json!({ "owner": "u1" }))
        .send()
        .await
        .unwrap();

    let res = client.post(format!("{}/admin/retention", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report: Value = res.json().await.unwrap();
    assert_eq!(report["deleted"], 0);

    let job = get_json(&client, format!("{}/jobs/{}", srv.base_url, job_id)).await;
    assert_eq!(job["status"], "done");
}
