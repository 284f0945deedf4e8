//! Black-box tests that drive the router's axum `Router` directly via
//! `tower::ServiceExt::oneshot`, against a synthetic models directory and a
//! fake `llama-server` shell script standing in for the real binary.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

/// Writes a fake inference binary. When `spawn_log` is given, every
/// invocation appends a line to it, so tests can count how many times the
/// backend process was actually spawned.
fn write_fake_inference_binary(dir: &Path, spawn_log: Option<&Path>) -> std::path::PathBuf {
    let script_path = dir.join("fake-llama-server");
    let log_line = match spawn_log {
        Some(p) => format!("echo spawned >> '{}'\n", p.display()),
        None => String::new(),
    };
    let script = format!(
        r#"#!/bin/sh
{log_line}port=""
while [ "$#" -gt 0 ]; do
  if [ "$1" = "--port" ]; then
    shift
    port="$1"
  fi
  shift
done
python3 - "$port" <<'PY' &
import http.server, sys
class H(http.server.BaseHTTPRequestHandler):
    def do_GET(self):
        self.send_response(200)
        self.end_headers()
        self.wfile.write(b'{{"status":"ok"}}')
    def do_POST(self):
        length = int(self.headers.get('Content-Length', 0))
        self.rfile.read(length)
        self.send_response(200)
        self.send_header('Content-Type', 'application/json')
        self.end_headers()
        self.wfile.write(b'{{"ok":true}}')
    def log_message(self, *a):
        pass
http.server.HTTPServer(("127.0.0.1", int(sys.argv[1])), H).serve_forever()
PY
wait
"#
    );
    let mut f = std::fs::File::create(&script_path).unwrap();
    f.write_all(script.as_bytes()).unwrap();
    let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script_path, perms).unwrap();
    script_path
}

fn write_model(root: &Path, user: &str, repo: &str, quant: &str) {
    let dir = root.join(user).join(repo);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("{quant}.gguf")), b"not-a-real-gguf-file").unwrap();
}

async fn build_test_app(tmp: &Path, fake_binary: &Path, max_models: usize, port_range: (u16, u16)) -> axum::Router {
    let mut config = router_core::RouterConfig::default();
    config.models_dir = tmp.join("models");
    config.snapshot_path = tmp.join("state/router.json");
    config.template_cache_dir = tmp.join("templates");
    config.logs_dir = tmp.join("logs");
    config.inference_binary = fake_binary.to_path_buf();
    config.backend_port_min = port_range.0;
    config.backend_port_max = port_range.1;
    config.startup_timeout_secs = 10;
    config.max_models = max_models;

    let persistence = std::sync::Arc::new(router_core::StatePersistence::new(
        config.snapshot_path.clone(),
        0,
    ));
    let manager = std::sync::Arc::new(router_core::ModelManager::new(config.clone(), persistence));
    let idle_monitor = std::sync::Arc::new(router_core::IdleMonitor::new(
        manager.clone(),
        std::time::Duration::from_secs(3600),
        std::time::Duration::from_secs(3600),
    ));

    let state = router_proxy::AppState {
        manager,
        idle_monitor,
        config,
        http: reqwest::Client::new(),
        started_at: std::time::Instant::now(),
    };
    router_proxy::build_router(state)
}

async fn run_model(app: &axum::Router, name: &str) -> serde_json::Value {
    let body = serde_json::json!({ "model": name }).to_string();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/run")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_endpoint_returns_ok() {
    let tmp = tempfile::tempdir().unwrap();
    let fake_binary = write_fake_inference_binary(tmp.path(), None);
    let app = build_test_app(tmp.path(), &fake_binary, 2, (20200, 20299)).await;

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn models_endpoint_lists_downloaded_models_before_any_are_loaded() {
    let tmp = tempfile::tempdir().unwrap();
    write_model(&tmp.path().join("models"), "acme", "demo-model", "Q4_K_M");
    let fake_binary = write_fake_inference_binary(tmp.path(), None);
    let app = build_test_app(tmp.path(), &fake_binary, 2, (20200, 20299)).await;

    let response = app
        .oneshot(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let data = value["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["id"], "acme/demo-model:Q4_K_M");
}

#[tokio::test]
async fn chat_completions_with_unknown_model_returns_404_with_suggestions() {
    let tmp = tempfile::tempdir().unwrap();
    write_model(&tmp.path().join("models"), "acme", "demo-model", "Q4_K_M");
    let fake_binary = write_fake_inference_binary(tmp.path(), None);
    let app = build_test_app(tmp.path(), &fake_binary, 2, (20200, 20299)).await;

    let body = serde_json::json!({"model": "totally-unrelated-xyz", "messages": []});
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn run_endpoint_loads_model_and_status_reports_it() {
    let tmp = tempfile::tempdir().unwrap();
    write_model(&tmp.path().join("models"), "acme", "demo-model", "Q4_K_M");
    let fake_binary = write_fake_inference_binary(tmp.path(), None);
    let app = build_test_app(tmp.path(), &fake_binary, 2, (20200, 20299)).await;

    run_model(&app, "acme/demo-model").await;

    let status_response = app
        .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = axum::body::to_bytes(status_response.into_body(), usize::MAX).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["loaded_count"], 1);
}

#[tokio::test]
async fn concurrent_requests_for_missing_model_spawn_exactly_one_child() {
    let tmp = tempfile::tempdir().unwrap();
    write_model(&tmp.path().join("models"), "acme", "demo-model", "Q4_K_M");
    let spawn_log = tmp.path().join("spawn_log");
    let fake_binary = write_fake_inference_binary(tmp.path(), Some(&spawn_log));
    let app = build_test_app(tmp.path(), &fake_binary, 4, (20400, 20499)).await;

    let body = serde_json::json!({"model": "acme/demo-model", "messages": []}).to_string();
    let mut handles = Vec::with_capacity(50);
    for _ in 0..50 {
        let app = app.clone();
        let body = body.clone();
        handles.push(tokio::spawn(async move {
            app.oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap()
            .status()
        }));
    }

    let mut ok_count = 0;
    for handle in handles {
        if handle.await.unwrap() == StatusCode::OK {
            ok_count += 1;
        }
    }
    assert_eq!(ok_count, 50, "every coalesced request should reach the single spawned backend");

    let spawned = std::fs::read_to_string(&spawn_log).unwrap_or_default();
    let spawn_count = spawned.lines().filter(|l| !l.is_empty()).count();
    assert_eq!(
        spawn_count, 1,
        "50 concurrent requests for the same missing model must spawn exactly one child, got {spawn_count}"
    );
}

#[tokio::test]
async fn lru_eviction_frees_the_evicted_backends_port() {
    let tmp = tempfile::tempdir().unwrap();
    let models_root = tmp.path().join("models");
    write_model(&models_root, "acme", "model-a", "Q4_K_M");
    write_model(&models_root, "acme", "model-b", "Q4_K_M");
    write_model(&models_root, "acme", "model-c", "Q4_K_M");
    let fake_binary = write_fake_inference_binary(tmp.path(), None);
    // Exactly as many ports as max_models: a third load can only succeed if
    // the first backend's port was actually released on eviction, not just
    // its registry entry removed.
    let app = build_test_app(tmp.path(), &fake_binary, 2, (20500, 20501)).await;

    run_model(&app, "acme/model-a").await;
    run_model(&app, "acme/model-b").await;
    run_model(&app, "acme/model-c").await;

    let status_response = app
        .clone()
        .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(status_response.into_body(), usize::MAX).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["loaded_count"], 2);
    let backends = value["backends"].as_array().unwrap();
    assert!(
        backends.iter().all(|b| b["model"] != "acme/model-a"),
        "least-recently-used model-a should have been evicted to admit model-c"
    );
    assert!(backends.iter().any(|b| b["model"] == "acme/model-b"));
    assert!(backends.iter().any(|b| b["model"] == "acme/model-c"));
}
