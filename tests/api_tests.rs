//! Submission API guards and projections, driven through the real router.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use edgelink::api::{self, ApiState, MAX_BODY_BYTES};
use edgelink::job::{Job, JobStatus, JobStore, MemoryJobStore};
use edgelink::queue::{InMemoryQueue, PendingQueue};
use edgelink::registry::AgentRegistry;

struct TestApi {
    app: Router,
    store: Arc<MemoryJobStore>,
    queue: Arc<InMemoryQueue>,
    registry: Arc<AgentRegistry>,
}

fn test_api() -> TestApi {
    let store = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(InMemoryQueue::new());
    let registry = Arc::new(AgentRegistry::new());
    let app = api::router(ApiState {
        registry: registry.clone(),
        store: store.clone(),
        queue: queue.clone(),
    });
    TestApi {
        app,
        store,
        queue,
        registry,
    }
}

fn post_jobs(body: impl Into<Body>, content_type: &str) -> Request<Body> {
    let builder = Request::builder().method("POST").uri("/api/jobs");
    let builder = if content_type.is_empty() {
        builder
    } else {
        builder.header("content-type", content_type)
    };
    builder.body(body.into()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn create_job_returns_201_and_enqueues() {
    let api = test_api();
    let body = json!({
        "input_bucket": "b",
        "input_key": "in/a.jpg",
        "output_bucket": "b",
        "output_extension": ".json",
        "command": "convert {input} {output}"
    })
    .to_string();

    let response = api
        .app
        .oneshot(post_jobs(body, "application/json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let json = body_json(response).await;
    let job_id = json["job_id"].as_str().unwrap().to_string();
    assert_eq!(json["status"], "PENDING");

    let stored = api.store.get(&job_id).await.unwrap();
    assert_eq!(stored.output_prefix, format!("jobs/{job_id}/1/"));
    assert_eq!(stored.output_extension, "json");
    assert_eq!(api.queue.size().await.unwrap(), 1);
    assert_eq!(
        api.queue.peek().await.unwrap().as_deref(),
        Some(job_id.as_str())
    );
}

#[tokio::test]
async fn oversized_body_is_413() {
    let api = test_api();
    let body = vec![b'x'; MAX_BODY_BYTES + 1];
    let response = api
        .app
        .oneshot(post_jobs(body, "application/json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn non_json_content_types_are_415() {
    let api = test_api();
    let response = api
        .app
        .clone()
        .oneshot(post_jobs("{}", "multipart/form-data; boundary=x"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let response = api
        .app
        .oneshot(post_jobs("{}", "text/plain"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn mismatched_input_pair_is_400() {
    let api = test_api();
    let body = json!({ "input_bucket": "b", "output_bucket": "b" }).to_string();
    let response = api
        .app
        .oneshot(post_jobs(body, "application/json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn oversized_command_is_400() {
    let api = test_api();
    let body = json!({ "command": "x".repeat(8193) }).to_string();
    let response = api
        .app
        .oneshot(post_jobs(body, "application/json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn forward_job_requires_url_and_known_mode() {
    let api = test_api();
    let body = json!({ "job_type": "FORWARD_HTTP" }).to_string();
    let response = api
        .app
        .clone()
        .oneshot(post_jobs(body, "application/json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = json!({
        "job_type": "FORWARD_HTTP",
        "forward_url": "http://127.0.0.1:9005/work",
        "input_forward_mode": "CARRIER_PIGEON"
    })
    .to_string();
    let response = api
        .app
        .clone()
        .oneshot(post_jobs(body, "application/json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = json!({
        "job_type": "FORWARD_HTTP",
        "forward_url": "http://127.0.0.1:9005/work",
        "input_forward_mode": "LOCAL_FILE"
    })
    .to_string();
    let response = api
        .app
        .oneshot(post_jobs(body, "application/json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn unknown_job_type_and_empty_body_are_400() {
    let api = test_api();
    let body = json!({ "job_type": "TELEPORT" }).to_string();
    let response = api
        .app
        .clone()
        .oneshot(post_jobs(body, "application/json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = api
        .app
        .oneshot(post_jobs(Body::empty(), "application/json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_job_projects_the_record() {
    let api = test_api();
    let job = Job::new("aaaaaaaa-bbbb-cccc-dddd-eeeeffff0001");
    api.store.create(&job).await.unwrap();

    let response = api
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/jobs/{}", job.job_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["job_id"], job.job_id.as_str());
    assert_eq!(json["status"], "PENDING");

    let response = api
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/jobs/aaaaaaaa-bbbb-cccc-dddd-eeeeffff0002")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = api
        .app
        .oneshot(
            Request::builder()
                .uri("/api/jobs/not-a-uuid")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn list_jobs_filters_by_status() {
    let api = test_api();
    for i in 0..3 {
        let job = Job::new(format!("aaaaaaaa-bbbb-cccc-dddd-eeeeffff100{i}"));
        api.store.create(&job).await.unwrap();
    }
    api.store
        .update_status("aaaaaaaa-bbbb-cccc-dddd-eeeeffff1000", JobStatus::Canceled)
        .await
        .unwrap();

    let response = api
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/jobs?status=PENDING")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json.as_array().unwrap().len(), 2);

    let response = api
        .app
        .oneshot(
            Request::builder()
                .uri("/api/jobs?limit=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn agents_online_projects_the_registry() {
    let api = test_api();
    let response = api
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/agents/online")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json.as_array().unwrap().is_empty());

    api.registry.register("a1", "edge-7", 2);
    api.registry.update_heartbeat("a1", false, 1);

    let response = api
        .app
        .oneshot(
            Request::builder()
                .uri("/api/agents/online")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    let agents = json.as_array().unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["agent_id"], "a1");
    assert_eq!(agents[0]["hostname"], "edge-7");
    assert_eq!(agents[0]["running_jobs"], 1);
}

#[tokio::test]
async fn health_endpoint_responds() {
    let api = test_api();
    let response = api
        .app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
}
