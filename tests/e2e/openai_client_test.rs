use std::time::Duration;

use httpmock::prelude::*;
use parley_runtime::{CompletionClient, CompletionError, ModelRegistry, OpenAIClient, Turn};

fn client_for(server: &MockServer) -> OpenAIClient {
    OpenAIClient::new(
        "test-api-key",
        format!("{}/v1", server.base_url()),
        Duration::from_secs(5),
    )
    .expect("build client")
}

#[tokio::test]
async fn multi_turn_request_reaches_compatible_endpoint() {
    let server = MockServer::start_async().await;
    let registry = ModelRegistry::builtin();
    let model = registry.resolve("GPT4O_MINI").expect("builtin model");

    let completion_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer test-api-key")
                .json_body(serde_json::json!({
                    "model": "gpt-4o-mini",
                    "messages": [
                        {"role": "system", "content": "You are terse."},
                        {"role": "user", "content": "Hi", "name": "alice"},
                        {"role": "assistant", "content": "OK"},
                        {"role": "user", "content": "More"}
                    ]
                }));
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::json!({
                    "id": "chatcmpl-mock-1",
                    "object": "chat.completion",
                    "created": 1700000000,
                    "model": "gpt-4o-mini",
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": "Fine."},
                        "finish_reason": "stop"
                    }],
                    "usage": {"prompt_tokens": 20, "completion_tokens": 2, "total_tokens": 22}
                }));
        })
        .await;

    let turns = vec![
        Turn::user("Hi", Some("alice".to_string())),
        Turn::assistant("OK", None),
        Turn::user("More", None),
    ];
    let reply = client_for(&server)
        .complete("You are terse.", &turns, model)
        .await
        .expect("completion succeeds");

    completion_mock.assert_async().await;
    assert_eq!(reply.content, "Fine.");
    assert_eq!(reply.reasoning_content, None);
}

#[tokio::test]
async fn unreachable_endpoint_is_a_transport_error() {
    let registry = ModelRegistry::builtin();
    let model = registry.resolve("GPT4").expect("builtin model");
    let client = OpenAIClient::new("k", "http://127.0.0.1:9", Duration::from_secs(2))
        .expect("build client");

    let err = client
        .complete("sys", &[Turn::user("Hi", None)], model)
        .await
        .unwrap_err();

    assert!(matches!(err, CompletionError::Transport(_)));
}
