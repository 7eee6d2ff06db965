use std::sync::Arc;

use chrono::TimeZone;
use reqwest::StatusCode;
use serde_json::json;

use bulwark_core::{CallerId, ManualClock};
use bulwark_infra::cache::SetOptions;
use bulwark_infra::jobs::{FnHandler, Job, JobKind, JobOutput};
use bulwark_infra::quota::TierLimits;
use bulwark_infra::{AppContext, BulwarkConfig};

struct TestServer {
    base_url: String,
    ctx: AppContext,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(config: BulwarkConfig) -> Self {
        // Fixed clock so rate windows never roll over mid-test.
        let clock = Arc::new(ManualClock::new(
            chrono::Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap(),
        ));
        let ctx = AppContext::in_memory_with_clock(config, clock);
        ctx.register_handler(
            JobKind::Scrape,
            Arc::new(FnHandler::new(|payload: serde_json::Value, _job: Job| async move {
                Ok(JobOutput::new(payload))
            })),
        );

        // Same router as prod, bound to an ephemeral port. No workers run,
        // so enqueued jobs stay pending.
        let app = bulwark_api::app::build_app(ctx.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, ctx, handle }
    }

    async fn default() -> Self {
        Self::spawn(BulwarkConfig::default()).await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn enqueue(
    client: &reqwest::Client,
    server: &TestServer,
    caller: &str,
    body: serde_json::Value,
) -> reqwest::Response {
    client
        .post(format!("{}/jobs", server.base_url))
        .header("x-caller-id", caller)
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let server = TestServer::default().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["breakers"].as_array().unwrap().is_empty());
    assert!(body["shared_cache"].is_null());
}

#[tokio::test]
async fn missing_caller_is_rejected() {
    let server = TestServer::default().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/jobs", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "missing_caller");
}

#[tokio::test]
async fn enqueue_then_fetch_is_scoped_to_caller() {
    let server = TestServer::default().await;
    let client = reqwest::Client::new();

    let res = enqueue(
        &client,
        &server,
        "acme",
        json!({ "kind": "scrape", "payload": { "subject": "alice" }, "priority": 2, "tags": ["vip"] }),
    )
    .await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    assert_eq!(res.headers()["x-ratelimit-limit"], "100");
    assert!(res.headers().contains_key("x-ratelimit-reset"));

    let job: serde_json::Value = res.json().await.unwrap();
    assert_eq!(job["status"], "pending");
    assert_eq!(job["priority"], 2);
    assert_eq!(job["metadata"]["caller_id"], "acme");
    let id = job["id"].as_str().unwrap().to_string();

    let res = client
        .get(format!("{}/jobs/{}", server.base_url, id))
        .header("x-caller-id", "acme")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let fetched: serde_json::Value = res.json().await.unwrap();
    assert_eq!(fetched["id"], id.as_str());
    assert_eq!(fetched["tags"], json!(["vip"]));

    // Another caller cannot see it.
    let res = client
        .get(format!("{}/jobs/{}", server.base_url, id))
        .header("x-caller-id", "other")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .get(format!("{}/jobs?kind=scrape&status=pending", server.base_url))
        .header("x-caller-id", "acme")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let list: serde_json::Value = res.json().await.unwrap();
    assert_eq!(list["jobs"].as_array().unwrap().len(), 1);
    assert_eq!(list["stats"]["pending"], 1);
}

#[tokio::test]
async fn invalid_requests_map_to_client_errors() {
    let server = TestServer::default().await;
    let client = reqwest::Client::new();

    let res = enqueue(&client, &server, "acme", json!({ "kind": "teleport" })).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_kind");

    // Known kind without a handler.
    let res = enqueue(&client, &server, "acme", json!({ "kind": "batch_scrape" })).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unregistered_kind");

    let res = enqueue(&client, &server, "acme", json!({ "kind": "scrape", "priority": 11 })).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_priority");

    let res = client
        .get(format!("{}/jobs/not-a-uuid", server.base_url))
        .header("x-caller-id", "acme")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_pending_job_once() {
    let server = TestServer::default().await;
    let client = reqwest::Client::new();

    let job: serde_json::Value = enqueue(&client, &server, "acme", json!({ "kind": "scrape" }))
        .await
        .json()
        .await
        .unwrap();
    let url = format!("{}/jobs/{}", server.base_url, job["id"].as_str().unwrap());

    let res = client.delete(&url).header("x-caller-id", "acme").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let cancelled: serde_json::Value = res.json().await.unwrap();
    assert_eq!(cancelled["status"], "cancelled");

    let res = client.delete(&url).header("x-caller-id", "acme").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_cancellable");
}

#[tokio::test]
async fn cached_result_short_circuits_enqueue() {
    let server = TestServer::default().await;
    let client = reqwest::Client::new();
    server
        .ctx
        .cache
        .set("profile:alice", json!({ "followers": 42 }), None, SetOptions::default())
        .await;

    let res = enqueue(
        &client,
        &server,
        "acme",
        json!({ "kind": "scrape", "payload": { "subject": "alice" }, "cache_key": "profile:alice" }),
    )
    .await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["cached"], true);
    assert_eq!(body["value"]["followers"], 42);
    assert_eq!(server.ctx.queue.stats().await.unwrap().total(), 0);

    let res = enqueue(
        &client,
        &server,
        "acme",
        json!({ "kind": "scrape", "cache_key": "profile:bob" }),
    )
    .await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn minute_rate_limit_returns_429() {
    let mut config = BulwarkConfig::default();
    config.tiers.free = TierLimits {
        daily: 100,
        monthly: 1_000,
        concurrent: 5,
        per_minute: 3,
        per_hour: 100,
    };
    let server = TestServer::spawn(config).await;
    let client = reqwest::Client::new();

    for _ in 0..3 {
        let res = client
            .get(format!("{}/quota", server.base_url))
            .header("x-caller-id", "acme")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    let res = client
        .get(format!("{}/quota", server.base_url))
        .header("x-caller-id", "acme")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    // 12:00:00 on the fixed clock, so the minute window resets in 60s.
    assert_eq!(res.headers()["retry-after"], "60");
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["allowed"], false);
    assert_eq!(body["reason"], "minute_rate_exceeded");

    // Other callers are unaffected.
    let res = client
        .get(format!("{}/quota", server.base_url))
        .header("x-caller-id", "globex")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Denied requests do not leak concurrency slots.
    let record = server
        .ctx
        .ledger
        .snapshot(&CallerId::new("acme"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.concurrent.current, 0);
}

#[tokio::test]
async fn blocked_caller_gets_403() {
    let server = TestServer::default().await;
    let client = reqwest::Client::new();
    server
        .ctx
        .ledger
        .block(&CallerId::new("spammer"), "abuse", std::time::Duration::from_secs(3600))
        .await
        .unwrap();

    let res = enqueue(&client, &server, "spammer", json!({ "kind": "scrape" })).await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(res.headers()["retry-after"], "3600");
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["reason"], "blocked");
    assert!(body["block_until"].is_string());
}

#[tokio::test]
async fn quota_snapshot_reflects_tier() {
    let server = TestServer::default().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/quota", server.base_url))
        .header("x-caller-id", "acme")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["x-ratelimit-remaining"], "100");

    let record: serde_json::Value = res.json().await.unwrap();
    assert_eq!(record["caller_id"], "acme");
    assert_eq!(record["tier"], "free");
    assert_eq!(record["daily"]["limit"], 100);
    assert_eq!(record["daily"]["used"], 0);
    // The in-flight request holds the slot while the snapshot is taken.
    assert_eq!(record["concurrent"]["current"], 1);
}
