//! End-to-end conversation flows over real storage

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use parley_context::{
    CallRequest, EstimateTokenizer, JsonDirRepository, SessionStore, TiktokenTokenizer,
};
use parley_runtime::{MockCompletionClient, ModelRegistry, ModelSpec, OpenAIClient};
use tempfile::TempDir;

fn gpt4() -> ModelSpec {
    ModelRegistry::builtin()
        .resolve("GPT4")
        .expect("builtin model")
        .clone()
}

#[tokio::test]
async fn conversation_survives_restart() {
    let dir = TempDir::new().expect("temp dir");
    let mock = Arc::new(MockCompletionClient::new());
    mock.enqueue_reply("OK");
    mock.enqueue_reply("Sure");
    mock.enqueue_reply("Done");

    let store = SessionStore::open(
        mock.clone(),
        Arc::new(EstimateTokenizer),
        Arc::new(JsonDirRepository::new(dir.path())),
    )
    .await
    .expect("open store");
    store.create(1, "You are terse.").await.expect("create root");

    let first = store
        .call(CallRequest::new("Hi", gpt4()).in_session(1))
        .await
        .expect("first call");
    assert_ne!(first.session_id, 1);
    assert!(first.persisted);

    let second = store
        .call(CallRequest::new("More", gpt4()).in_session(first.session_id))
        .await
        .expect("second call");
    let sent = mock.last_request().expect("request recorded");
    assert_eq!(sent.system, "You are terse.");
    let texts: Vec<_> = sent.turns.iter().map(|turn| turn.content.as_str()).collect();
    assert_eq!(texts, vec!["Hi", "OK", "More"]);
    assert!(dir.path().join(format!("s_{}.json", second.session_id)).exists());
    drop(store);

    let reopened = SessionStore::open(
        mock.clone(),
        Arc::new(EstimateTokenizer),
        Arc::new(JsonDirRepository::new(dir.path())),
    )
    .await
    .expect("reopen store");
    assert_eq!(reopened.len().await, 3);

    reopened
        .call(CallRequest::new("Last", gpt4()).in_session(second.session_id))
        .await
        .expect("call after restart");
    let sent = mock.last_request().expect("request recorded");
    let texts: Vec<_> = sent.turns.iter().map(|turn| turn.content.as_str()).collect();
    assert_eq!(texts, vec!["Hi", "OK", "More", "Sure", "Last"]);
}

#[tokio::test]
async fn store_drives_http_provider() {
    let server = MockServer::start_async().await;
    let completion_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .body_includes("\"content\":\"Be brief.\"");
            then.status(200).json_body(serde_json::json!({
                "choices": [{
                    "index": 0,
                    "message": {
                        "role": "assistant",
                        "content": "Hello.",
                        "reasoning_content": "A greeting."
                    },
                    "finish_reason": "stop"
                }]
            }));
        })
        .await;

    let dir = TempDir::new().expect("temp dir");
    let client = OpenAIClient::new(
        "test-api-key",
        format!("{}/v1", server.base_url()),
        Duration::from_secs(5),
    )
    .expect("build client");
    let store = SessionStore::open(
        Arc::new(client),
        Arc::new(TiktokenTokenizer::new().expect("load vocabularies")),
        Arc::new(JsonDirRepository::new(dir.path())),
    )
    .await
    .expect("open store");

    let outcome = store
        .call(CallRequest::new("Hi there", gpt4()).with_system("Be brief."))
        .await
        .expect("call succeeds");

    completion_mock.assert_async().await;
    assert_eq!(outcome.reply, "Hello.");
    assert_eq!(outcome.reasoning_content.as_deref(), Some("A greeting."));
    assert!(outcome.token_in > 0);
    assert!(outcome.token_out > 0);

    let saved = std::fs::read_to_string(dir.path().join(format!("s_{}.json", outcome.session_id)))
        .expect("session file written");
    let saved: serde_json::Value = serde_json::from_str(&saved).expect("valid json");
    assert_eq!(saved["system_msg"], "Be brief.");
    assert_eq!(saved["assistant_message"], "Hello.");
    assert_eq!(saved["reasoning_content"], "A greeting.");
}
