//! E2E tests for the Gateway HTTP API

use std::sync::Arc;

use parley_context::{EstimateTokenizer, JsonDirRepository, SessionStore};
use parley_gateway::{build_routes, AppState};
use parley_runtime::{MockCompletionClient, ModelRegistry};
use tempfile::TempDir;
use tokio::net::TcpListener;

struct Harness {
    addr: std::net::SocketAddr,
    mock: Arc<MockCompletionClient>,
    store: Arc<SessionStore>,
    _dir: TempDir,
    _server: tokio::task::JoinHandle<()>,
}

async fn spawn_gateway_server() -> Harness {
    let dir = TempDir::new().expect("temp dir");
    let mock = Arc::new(MockCompletionClient::new());
    let store = Arc::new(
        SessionStore::open(
            mock.clone(),
            Arc::new(EstimateTokenizer),
            Arc::new(JsonDirRepository::new(dir.path())),
        )
        .await
        .expect("open store"),
    );
    let state = AppState::new(
        store.clone(),
        ModelRegistry::builtin(),
        "You are a helpful assistant.",
        "GPT4",
    );

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let app = build_routes(state);
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve gateway app");
    });

    Harness {
        addr,
        mock,
        store,
        _dir: dir,
        _server: server,
    }
}

#[tokio::test]
async fn gateway_health_check() {
    let harness = spawn_gateway_server().await;

    let response = reqwest::get(format!("http://{}/health", harness.addr))
        .await
        .expect("health check request");

    assert!(response.status().is_success());
    assert_eq!(response.text().await.expect("body"), "OK");
}

#[tokio::test]
async fn gateway_legacy_flow() {
    let harness = spawn_gateway_server().await;
    harness.mock.enqueue_reply("OK");
    harness.mock.enqueue_reply("Sure");
    let http = reqwest::Client::new();
    let base = format!("http://{}", harness.addr);

    let id: u64 = http
        .get(format!("{base}/newid?hint=1"))
        .send()
        .await
        .expect("newid request")
        .text()
        .await
        .expect("newid body")
        .parse()
        .expect("numeric id");
    assert_eq!(id, 1);

    let created = http
        .get(format!("{base}/create?sid={id}&systemMsg=You%20are%20terse."))
        .send()
        .await
        .expect("create request");
    assert_eq!(created.text().await.expect("create body"), "OK");

    let first = http
        .post(format!("{base}/api"))
        .json(&serde_json::json!({"sid": id, "msg": "Hi", "ensure_id": true}))
        .send()
        .await
        .expect("first call");
    assert_eq!(first.text().await.expect("first body"), "OK");

    let sent = harness.mock.last_request().expect("request recorded");
    assert_eq!(sent.system, "You are terse.");
    assert_eq!(sent.turns.len(), 1);
    assert_eq!(harness.store.len().await, 2);
}

#[tokio::test]
async fn gateway_chat_chain() {
    let harness = spawn_gateway_server().await;
    harness.mock.enqueue_reply("Hello");
    harness.mock.enqueue_reply("Fine");
    let http = reqwest::Client::new();
    let url = format!("http://{}/v1/chat", harness.addr);

    let first: serde_json::Value = http
        .post(&url)
        .json(&serde_json::json!({"message": "Hi", "system_msg": "Be brief."}))
        .send()
        .await
        .expect("first chat")
        .json()
        .await
        .expect("first outcome");
    let second: serde_json::Value = http
        .post(&url)
        .json(&serde_json::json!({"session_id": first["session_id"], "message": "How are you?"}))
        .send()
        .await
        .expect("second chat")
        .json()
        .await
        .expect("second outcome");

    assert_eq!(first["reply"], "Hello");
    assert_eq!(second["reply"], "Fine");
    assert_ne!(first["session_id"], second["session_id"]);
    assert_eq!(second["persisted"], true);

    let sent = harness.mock.last_request().expect("request recorded");
    let texts: Vec<_> = sent.turns.iter().map(|turn| turn.content.as_str()).collect();
    assert_eq!(texts, vec!["Hi", "Hello", "How are you?"]);
}

#[tokio::test]
async fn gateway_maps_missing_session_to_404() {
    let harness = spawn_gateway_server().await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/chat", harness.addr))
        .json(&serde_json::json!({"session_id": 12345, "message": "Hi"}))
        .send()
        .await
        .expect("chat request");

    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
