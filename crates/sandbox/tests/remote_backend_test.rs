//! Remote-isolated backend against a fake sandbox service.
//!
//! The fake service stores files on the local disk and runs the runner job
//! in-process, so the full HTTP contract is exercised without a real
//! provider.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use codebox_bridge::{BridgeChannel, QueryHandler};
use codebox_core::mocks::MockModel;
use codebox_core::{BackendVariant, EnvironmentConfig, Error, Namespace, RemoteOptions, SessionId, Value};
use codebox_sandbox::{BlockRequest, ExecControl, IsolatedBackend, SandboxBackend, Termination};

// =============================================================================
// Fake Service
// =============================================================================

#[derive(Default)]
struct Service {
    created: AtomicUsize,
    deleted: AtomicUsize,
    /// Number of create calls to answer with 503 before succeeding.
    flaky_creates: AtomicUsize,
}

#[derive(Deserialize)]
struct ExecBody {
    command: Vec<String>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Bearer test-token")
}

async fn create(State(svc): State<Arc<Service>>, headers: HeaderMap) -> (StatusCode, Json<serde_json::Value>) {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({})));
    }
    if svc
        .flaky_creates
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({})));
    }
    let n = svc.created.fetch_add(1, Ordering::SeqCst);
    (StatusCode::OK, Json(json!({ "id": format!("sbx-{}", n) })))
}

async fn exec(Json(body): Json<ExecBody>) -> Json<serde_json::Value> {
    let program = body.command.first().cloned().unwrap_or_default();
    if program == "mkdir" {
        for dir in body.command.iter().skip(2) {
            std::fs::create_dir_all(dir).unwrap();
        }
        return Json(json!({"exit_code": 0, "stdout": "", "stderr": ""}));
    }
    if program.ends_with("codebox-runner") {
        let job = body.command[1].clone();
        let out = tokio::task::spawn_blocking(move || codebox_runtime::run_job_file(std::path::Path::new(&job)))
            .await
            .unwrap();
        return match out {
            Ok(line) => Json(json!({"exit_code": 0, "stdout": format!("{}\n", line), "stderr": ""})),
            Err(e) => Json(json!({"exit_code": 2, "stdout": "", "stderr": e.to_string()})),
        };
    }
    Json(json!({"exit_code": 127, "stdout": "", "stderr": format!("{}: not found", program)}))
}

async fn put_file(Query(q): Query<HashMap<String, String>>, body: Bytes) -> StatusCode {
    let path = std::path::PathBuf::from(&q["path"]);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, &body).unwrap();
    StatusCode::NO_CONTENT
}

async fn get_file(Query(q): Query<HashMap<String, String>>) -> Result<Vec<u8>, StatusCode> {
    std::fs::read(&q["path"]).map_err(|_| StatusCode::NOT_FOUND)
}

async fn delete(State(svc): State<Arc<Service>>, Path(_id): Path<String>) -> StatusCode {
    svc.deleted.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT
}

async fn spawn_service(svc: Arc<Service>) -> String {
    let app = Router::new()
        .route("/v1/health", get(|| async { "ok" }))
        .route("/v1/sandboxes", post(create))
        .route("/v1/sandboxes/:id", axum::routing::delete(delete))
        .route("/v1/sandboxes/:id/exec", post(exec))
        .route("/v1/sandboxes/:id/files", put(put_file).get(get_file))
        .with_state(svc);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remote_backend_end_to_end() {
    let svc = Arc::new(Service::default());
    svc.flaky_creates.store(1, Ordering::SeqCst);
    let endpoint = spawn_service(Arc::clone(&svc)).await;
    let workdir = tempfile::tempdir().unwrap();

    let port = free_port();
    let bridge_addr = format!("127.0.0.1:{}", port);
    let mut remote = RemoteOptions::new(endpoint, bridge_addr.clone());
    remote.api_token = Some(secrecy::Secret::new("test-token".to_string()));
    remote.workdir = workdir.path().to_string_lossy().into_owned();
    let mut config = EnvironmentConfig::for_variant(BackendVariant::Remote).with_remote(remote);
    config.bridge_address = Some(bridge_addr);
    config.validate().unwrap();

    let session = SessionId::new();
    let model = MockModel::new().with_reply("2+2?", "4");
    let handler = Arc::new(QueryHandler::new(Arc::new(model), 4));
    let bridge = Arc::new(BridgeChannel::new(session.clone(), handler, Duration::from_secs(5)));

    let mut backend = IsolatedBackend::remote(&config).unwrap();
    assert_eq!(backend.variant(), BackendVariant::Remote);
    backend.start(Arc::clone(&bridge)).await.unwrap();
    assert_eq!(svc.created.load(Ordering::SeqCst), 1);

    let mut ns = Namespace::new();
    let ctl = ExecControl::new();
    let run = |ordinal: u64, code: &str| BlockRequest {
        session_id: session.clone(),
        ordinal,
        code: code.to_string(),
        execute_timeout: Duration::from_secs(5),
        query_timeout: Duration::from_secs(5),
    };

    bridge.begin_block(1);
    let out = backend
        .run_block(&mut ns, &run(1, "answer = llm_query('2+2?')"), &ctl)
        .await
        .unwrap();
    bridge.end_block();
    assert_eq!(out.termination, Termination::Completed);
    assert!(out.error.is_none(), "{:?} / {}", out.error, out.stderr);

    bridge.begin_block(2);
    let out = backend
        .run_block(&mut ns, &run(2, "print('answer is ' .. answer)\nreturn tonumber(answer) * 10"), &ctl)
        .await
        .unwrap();
    bridge.end_block();
    assert_eq!(out.stdout, "answer is 4\n");
    assert_eq!(out.return_value, Some(Value::Int(40)));
    assert_eq!(ns.get("answer"), Some(&Value::Str("4".into())));

    backend.shutdown().await.unwrap();
    assert_eq!(svc.deleted.load(Ordering::SeqCst), 1);
    bridge.close();
}

#[tokio::test]
async fn test_remote_rejects_bad_token() {
    let svc = Arc::new(Service::default());
    let endpoint = spawn_service(svc).await;
    let mut remote = RemoteOptions::new(endpoint, format!("127.0.0.1:{}", free_port()));
    remote.api_token = Some(secrecy::Secret::new("wrong".to_string()));
    let mut config = EnvironmentConfig::for_variant(BackendVariant::Remote).with_remote(remote);
    config.bridge_address = Some("127.0.0.1:0".into());

    let handler = Arc::new(QueryHandler::new(Arc::new(MockModel::new()), 1));
    let bridge = Arc::new(BridgeChannel::new(SessionId::new(), handler, Duration::from_secs(1)));
    let mut backend = IsolatedBackend::remote(&config).unwrap();
    let err = backend.start(bridge).await.unwrap_err();
    match err {
        Error::BackendInit(msg) => assert!(msg.contains("401"), "{}", msg),
        other => panic!("expected backend init error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_request_retries_count_after_first_attempt() {
    let svc = Arc::new(Service::default());
    let endpoint = spawn_service(Arc::clone(&svc)).await;
    let workdir = tempfile::tempdir().unwrap();
    let config = |retries: u32| {
        let mut remote = RemoteOptions::new(endpoint.clone(), format!("127.0.0.1:{}", free_port()));
        remote.api_token = Some(secrecy::Secret::new("test-token".to_string()));
        remote.workdir = workdir.path().to_string_lossy().into_owned();
        remote.request_retries = retries;
        let mut config = EnvironmentConfig::for_variant(BackendVariant::Remote).with_remote(remote);
        config.bridge_address = Some("127.0.0.1:0".into());
        config
    };
    let bridge = || {
        let handler = Arc::new(QueryHandler::new(Arc::new(MockModel::new()), 1));
        Arc::new(BridgeChannel::new(SessionId::new(), handler, Duration::from_secs(1)))
    };

    // One retry survives one 503.
    svc.flaky_creates.store(1, Ordering::SeqCst);
    let mut backend = IsolatedBackend::remote(&config(1)).unwrap();
    backend.start(bridge()).await.unwrap();
    assert_eq!(svc.created.load(Ordering::SeqCst), 1);
    backend.shutdown().await.unwrap();

    // Two 503s exhaust both attempts.
    svc.flaky_creates.store(2, Ordering::SeqCst);
    let mut backend = IsolatedBackend::remote(&config(1)).unwrap();
    match backend.start(bridge()).await.unwrap_err() {
        Error::BackendInit(msg) => assert!(msg.contains("after 2 attempts"), "{}", msg),
        other => panic!("expected backend init error, got {:?}", other),
    }
    assert_eq!(svc.flaky_creates.load(Ordering::SeqCst), 0);
    assert_eq!(svc.created.load(Ordering::SeqCst), 1);

    // Zero retries means a single attempt.
    svc.flaky_creates.store(1, Ordering::SeqCst);
    let mut backend = IsolatedBackend::remote(&config(0)).unwrap();
    assert!(backend.start(bridge()).await.is_err());
    assert_eq!(svc.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_service_fails_start() {
    let mut config = EnvironmentConfig::for_variant(BackendVariant::Remote)
        .with_remote(RemoteOptions::new(format!("http://127.0.0.1:{}", free_port()), "127.0.0.1:7000"));
    config.bridge_address = Some("127.0.0.1:0".into());

    let handler = Arc::new(QueryHandler::new(Arc::new(MockModel::new()), 1));
    let bridge = Arc::new(BridgeChannel::new(SessionId::new(), handler, Duration::from_secs(1)));
    let mut backend = IsolatedBackend::remote(&config).unwrap();
    assert!(matches!(backend.start(bridge).await, Err(Error::BackendInit(_))));
}
