mod test_harness;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

use stagehand::config::{HostConfig, RunnerConfig};
use stagehand::dashboard::{router, DashboardState};
use test_harness::{pipeline, wait_for, TestMount, SHELL};

fn create_test_app(config: RunnerConfig) -> Router {
    let (pipeline, _rx) = pipeline(config);
    router(DashboardState { pipeline })
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

async fn post_json(app: &Router, uri: &str, payload: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

async fn wait_for_state(app: &Router, id: &str, state: &str) -> bool {
    let uri = format!("/api/jobs/{}", id);
    wait_for(Duration::from_secs(10), || {
        let app = app.clone();
        let uri = uri.clone();
        async move { get_json(&app, &uri).await.1["state"] == state }
    })
    .await
}

#[tokio::test]
async fn test_activity_idle() {
    let mount = TestMount::new();
    let app = create_test_app(mount.config());

    let (status, json) = get_json(&app, "/api/activity").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["activity"]["status"], "idle");
    assert_eq!(json["backlog"], 0);
}

#[tokio::test]
async fn test_list_jobs_empty() {
    let mount = TestMount::new();
    let app = create_test_app(mount.config());

    let (status, json) = get_json(&app, "/api/jobs").await;

    assert_eq!(status, StatusCode::OK);
    assert!(json.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_submit_rejected_before_setup() {
    let mount = TestMount::new();
    let app = create_test_app(
        RunnerConfig::new(HostConfig::default())
            .with_program(SHELL)
            .with_upload_root(mount.sources()),
    );
    let input = mount.source("a.inp", "exit 0\n");

    let (status, json) = post_json(
        &app,
        "/api/jobs",
        json!({ "author": "alice", "inputs": [{ "source": input.source.to_string() }] }),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["success"], false);
    assert!(json["job_id"].is_null());
    assert!(json["error"].as_str().unwrap().contains("Setup is not complete"));
}

#[tokio::test]
async fn test_submit_and_poll_until_finished() {
    let mount = TestMount::new();
    let app = create_test_app(mount.config());
    let input = mount.source("methane.inp", "echo done\n");
    let aux = mount.source("methane.xyz", "5\n");

    let (status, json) = post_json(
        &app,
        "/api/jobs",
        json!({
            "author": "bob",
            "inputs": [
                { "source": input.source.to_string() },
                { "source": aux.source.to_string(), "filename": "start.xyz" }
            ]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    let id = json["job_id"].as_str().unwrap().to_string();

    assert!(wait_for_state(&app, &id, "succeeded").await);

    let (status, job) = get_json(&app, &format!("/api/jobs/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["name"], "methane");
    assert_eq!(job["author"], "bob");
    assert_eq!(job["exit_outcome"], true);
    assert!(job["elapsed"].is_string());

    let workdir = std::path::PathBuf::from(job["working_directory"].as_str().unwrap());
    assert!(workdir.join("aux1.xyz").exists());

    let (_, jobs) = get_json(&app, "/api/jobs").await;
    assert_eq!(jobs.as_array().unwrap().len(), 1);
    assert_eq!(jobs[0]["id"], id.as_str());
}

#[tokio::test]
async fn test_activity_shows_running_job() {
    let mount = TestMount::new();
    let app = create_test_app(mount.config());
    let input = mount.source("benzene.inp", "sleep 0.5\n");

    let (_, json) = post_json(
        &app,
        "/api/jobs",
        json!({ "author": "alice", "inputs": [{ "source": input.source.to_string() }] }),
    )
    .await;
    let id = json["job_id"].as_str().unwrap().to_string();

    assert!(wait_for_state(&app, &id, "running").await);
    let (_, activity) = get_json(&app, "/api/activity").await;
    assert_eq!(activity["activity"], json!({ "status": "running", "name": "benzene" }));

    assert!(wait_for_state(&app, &id, "succeeded").await);
}

#[tokio::test]
async fn test_cancel_running_job_over_http() {
    let mount = TestMount::new();
    let app = create_test_app(mount.config());
    let input = mount.source("long.inp", "sleep 30\n");

    let (_, json) = post_json(
        &app,
        "/api/jobs",
        json!({ "author": "alice", "inputs": [{ "source": input.source.to_string() }] }),
    )
    .await;
    let id = json["job_id"].as_str().unwrap().to_string();
    assert!(wait_for_state(&app, &id, "running").await);

    let (status, json) = post_json(&app, &format!("/api/jobs/{}/cancel", id), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["outcome"], "signalled");

    assert!(wait_for_state(&app, &id, "cancelled").await);

    let (status, json) = post_json(&app, &format!("/api/jobs/{}/cancel", id), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let mount = TestMount::new();
    let app = create_test_app(mount.config());
    let id = uuid::Uuid::new_v4();

    let (status, _) = get_json(&app, &format!("/api/jobs/{}", id)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, json) = post_json(&app, &format!("/api/jobs/{}/cancel", id), json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn test_malformed_job_id_is_bad_request() {
    let mount = TestMount::new();
    let app = create_test_app(mount.config());

    let (status, _) = get_json(&app, "/api/jobs/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_submit_rejects_path_outside_upload_root() {
    let mount = TestMount::new();
    let app = create_test_app(mount.config());
    let secret = mount.dir.path().join("secret.inp");
    std::fs::write(&secret, "echo leaked\n").unwrap();

    for source in [
        "/etc/passwd".to_string(),
        secret.display().to_string(),
        format!("{}/../secret.inp", mount.sources().display()),
        format!("file://{}", secret.display()),
    ] {
        let (status, json) = post_json(
            &app,
            "/api/jobs",
            json!({ "author": "mallory", "inputs": [{ "source": source }] }),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", source);
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("not allowed"));
    }

    let (_, jobs) = get_json(&app, "/api/jobs").await;
    assert!(jobs.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_submit_rejects_local_path_without_upload_root() {
    let mount = TestMount::new();
    let mut config = mount.config();
    config.upload_root = None;
    let app = create_test_app(config);
    let input = mount.source("a.inp", "exit 0\n");

    let (status, json) = post_json(
        &app,
        "/api/jobs",
        json!({ "author": "alice", "inputs": [{ "source": input.source.to_string() }] }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
}
