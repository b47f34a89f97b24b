//! HTTP routes for Parley Gateway

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use parley_context::{CallOutcome, CallRequest, ContextResult, SessionId, SessionStore};
use parley_runtime::{ModelRegistry, ModelSpec};
use serde::Deserialize;

use crate::error::ApiError;
use crate::metrics;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub models: Arc<ModelRegistry>,
    pub default_system: String,
    pub default_model: String,
}

impl AppState {
    pub fn new(
        store: Arc<SessionStore>,
        models: ModelRegistry,
        default_system: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            store,
            models: Arc::new(models),
            default_system: default_system.into(),
            default_model: default_model.into(),
        }
    }

    fn model(&self, selector: Option<&str>) -> Result<ModelSpec, ApiError> {
        let selector = selector.unwrap_or(&self.default_model);
        Ok(self.models.resolve(selector)?.clone())
    }
}

/// Build the main router for the gateway
pub fn build_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/api", post(api_call))
        .route("/newid", get(new_id))
        .route("/create", get(create))
        .route("/v1/chat", post(chat))
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

#[allow(clippy::cast_precision_loss)]
async fn metrics_handler(State(state): State<AppState>) -> String {
    let sessions = state.store.len().await;
    metrics::SESSIONS.set(sessions as f64);
    metrics::export()
}

/// Session ids arrive as JSON numbers or decimal strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SidParam {
    Number(SessionId),
    Text(String),
}

impl SidParam {
    fn parse(self) -> Result<SessionId, ApiError> {
        match self {
            Self::Number(id) => Ok(id),
            Self::Text(text) => parse_sid(&text),
        }
    }
}

fn parse_sid(text: &str) -> Result<SessionId, ApiError> {
    text.trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("sid must be an unsigned integer, got {text:?}")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiCallBody {
    sid: Option<SidParam>,
    msg: String,
    #[serde(default, rename = "ensure_id")]
    ensure_id: bool,
    system_msg: Option<String>,
    model: Option<String>,
}

/// Legacy contract: reply text only. `ensure_id` refuses to create a
/// missing session.
async fn api_call(
    State(state): State<AppState>,
    Json(body): Json<ApiCallBody>,
) -> Result<String, ApiError> {
    let sid = body
        .sid
        .ok_or_else(|| ApiError::BadRequest("missing sid".to_string()))?
        .parse()?;
    let model = state.model(body.model.as_deref())?;
    let model_name = model.wire_name.clone();
    let request = CallRequest::new(body.msg, model).in_session(sid);

    let outcome = if body.ensure_id {
        timed("api", &model_name, state.store.call(request)).await?
    } else {
        let system = body.system_msg.unwrap_or_else(|| state.default_system.clone());
        timed(
            "api",
            &model_name,
            state.store.call_or_create(request.with_system(system)),
        )
        .await?
    };
    Ok(outcome.reply)
}

#[derive(Debug, Deserialize)]
struct NewIdParams {
    hint: Option<String>,
}

async fn new_id(State(state): State<AppState>, Query(params): Query<NewIdParams>) -> String {
    let hint = params.hint.and_then(|hint| hint.trim().parse().ok());
    state.store.new_id(hint).await.to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateParams {
    sid: Option<String>,
    system_msg: Option<String>,
}

async fn create(
    State(state): State<AppState>,
    Query(params): Query<CreateParams>,
) -> Result<&'static str, ApiError> {
    let sid = params
        .sid
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("missing sid".to_string()))
        .and_then(parse_sid)?;
    let system = params
        .system_msg
        .unwrap_or_else(|| state.default_system.clone());

    state.store.create(sid, system).await?;
    Ok("OK")
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    session_id: Option<SessionId>,
    message: String,
    model: Option<String>,
    system_msg: Option<String>,
    override_system_msg: Option<String>,
    user_name: Option<String>,
    assistant_name: Option<String>,
}

/// Structured entry point returning the full call outcome.
async fn chat(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> Result<Json<CallOutcome>, ApiError> {
    let model = state.model(body.model.as_deref())?;

    if let Some(system) = body.override_system_msg {
        let id = body.session_id.ok_or_else(|| {
            ApiError::BadRequest("override_system_msg requires session_id".to_string())
        })?;
        let outcome = timed(
            "chat",
            &model.wire_name,
            state
                .store
                .continue_session(id, body.message, &model, Some(system)),
        )
        .await?;
        return Ok(Json(outcome));
    }

    let model_name = model.wire_name.clone();
    let mut request = CallRequest::new(body.message, model);
    request.user_name = body.user_name;
    request.assistant_name = body.assistant_name;
    let request = match body.session_id {
        Some(id) => request.in_session(id),
        None => request.with_system(
            body.system_msg
                .unwrap_or_else(|| state.default_system.clone()),
        ),
    };

    Ok(Json(timed("chat", &model_name, state.store.call(request)).await?))
}

async fn timed<F>(route: &str, model: &str, call: F) -> ContextResult<CallOutcome>
where
    F: std::future::Future<Output = ContextResult<CallOutcome>>,
{
    let started = Instant::now();
    let result = call.await;
    let elapsed = started.elapsed().as_secs_f64();

    match &result {
        Ok(outcome) => {
            metrics::observe_call(route, "ok", elapsed);
            metrics::observe_tokens(model, outcome.token_in, outcome.token_out);
            tracing::info!(
                route,
                model,
                session_id = outcome.session_id,
                token_in = outcome.token_in,
                token_out = outcome.token_out,
                persisted = outcome.persisted,
                elapsed_secs = elapsed,
                "call completed"
            );
        }
        Err(err) => {
            metrics::observe_call(route, "error", elapsed);
            tracing::warn!(route, model, error = %err, "call failed");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use parley_context::{EstimateTokenizer, MemoryRepository};
    use parley_runtime::{CompletionError, MockCompletionClient};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app(mock: &Arc<MockCompletionClient>) -> (Router, Arc<SessionStore>) {
        let store = Arc::new(SessionStore::new(
            mock.clone(),
            Arc::new(EstimateTokenizer),
            Arc::new(MemoryRepository::new()),
        ));
        let state = AppState::new(
            store.clone(),
            ModelRegistry::builtin(),
            "You are a helpful assistant.",
            "GPT4",
        );
        (build_routes(state), store)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let (app, _) = app(&Arc::new(MockCompletionClient::new()));
        let response = app.oneshot(get("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn api_creates_then_continues_by_sid() {
        let mock = Arc::new(MockCompletionClient::new());
        mock.enqueue_reply("Hello!");
        mock.enqueue_reply("Again!");
        let (app, store) = app(&mock);

        let first = app
            .clone()
            .oneshot(post_json("/api", json!({"sid": 5, "msg": "Hi", "systemMsg": "Be kind."})))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(body_text(first).await, "Hello!");
        assert!(store.contains(5).await);

        let second = app
            .oneshot(post_json("/api", json!({"sid": "5", "msg": "More", "ensure_id": true})))
            .await
            .unwrap();
        assert_eq!(body_text(second).await, "Again!");

        let sent = mock.last_request().unwrap();
        assert_eq!(sent.system, "Be kind.");
        assert_eq!(sent.turns.len(), 3);
        assert_eq!(sent.model, "gpt-4");
    }

    #[tokio::test]
    async fn api_with_ensure_id_refuses_unknown_sessions() {
        let mock = Arc::new(MockCompletionClient::new());
        let (app, _) = app(&mock);

        let response = app
            .oneshot(post_json("/api", json!({"sid": 9, "msg": "Hi", "ensure_id": true})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn api_rejects_missing_sid_and_unknown_model() {
        let (app, _) = app(&Arc::new(MockCompletionClient::new()));

        let missing = app
            .clone()
            .oneshot(post_json("/api", json!({"msg": "Hi"})))
            .await
            .unwrap();
        let unknown = app
            .oneshot(post_json("/api", json!({"sid": 1, "msg": "Hi", "model": "GPT9"})))
            .await
            .unwrap();

        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
        assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn new_id_honours_free_hint() {
        let (app, store) = app(&Arc::new(MockCompletionClient::new()));
        store.create(10, "sys").await.unwrap();

        let free = app.clone().oneshot(get("/newid?hint=11")).await.unwrap();
        let taken = app.clone().oneshot(get("/newid?hint=10")).await.unwrap();
        let malformed = app.oneshot(get("/newid?hint=abc")).await.unwrap();

        assert_eq!(body_text(free).await, "11");
        let taken: SessionId = body_text(taken).await.parse().unwrap();
        assert_ne!(taken, 10);
        assert_eq!(malformed.status(), StatusCode::OK);
        assert!(body_text(malformed).await.parse::<SessionId>().is_ok());
    }

    #[tokio::test]
    async fn create_validates_sid_and_conflicts() {
        let (app, store) = app(&Arc::new(MockCompletionClient::new()));

        let missing = app.clone().oneshot(get("/create")).await.unwrap();
        let created = app
            .clone()
            .oneshot(get("/create?sid=42&systemMsg=Be%20brief."))
            .await
            .unwrap();
        let duplicate = app.oneshot(get("/create?sid=42")).await.unwrap();

        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
        assert_eq!(created.status(), StatusCode::OK);
        assert_eq!(body_text(created).await, "OK");
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);
        assert_eq!(
            store.get(42).await.unwrap().record().await.system_msg.as_deref(),
            Some("Be brief.")
        );
    }

    #[tokio::test]
    async fn chat_returns_structured_outcome() {
        let mock = Arc::new(MockCompletionClient::new());
        mock.enqueue_reply("Hi there");
        mock.enqueue_reply("Still here");
        let (app, _) = app(&mock);

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/chat",
                json!({"message": "Hello", "system_msg": "Be kind.", "user_name": "alice"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let outcome: CallOutcome = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(outcome.reply, "Hi there");
        assert!(outcome.persisted);

        let response = app
            .oneshot(post_json(
                "/v1/chat",
                json!({"session_id": outcome.session_id, "message": "More", "model": "GPT4O"}),
            ))
            .await
            .unwrap();
        let next: CallOutcome = serde_json::from_str(&body_text(response).await).unwrap();

        assert_ne!(next.session_id, outcome.session_id);
        let sent = mock.last_request().unwrap();
        assert_eq!(sent.model, "gpt-4o");
        assert_eq!(sent.turns[0].name.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn chat_override_only_applies_to_childless_roots() {
        let mock = Arc::new(MockCompletionClient::new());
        mock.enqueue_reply("first");
        mock.enqueue_reply("second");
        let (app, store) = app(&mock);
        store.create(1, "old").await.unwrap();

        let accepted = app
            .clone()
            .oneshot(post_json(
                "/v1/chat",
                json!({"session_id": 1, "message": "Hi", "override_system_msg": "new"}),
            ))
            .await
            .unwrap();
        assert_eq!(accepted.status(), StatusCode::OK);
        assert_eq!(mock.last_request().unwrap().system, "new");

        let rejected = app
            .oneshot(post_json(
                "/v1/chat",
                json!({"session_id": 1, "message": "Hi", "override_system_msg": "newer"}),
            ))
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rate_limit_maps_to_429() {
        let mock = Arc::new(MockCompletionClient::new());
        mock.enqueue(Err(CompletionError::RateLimited("slow down".to_string())));
        let (app, _) = app(&mock);

        let response = app
            .oneshot(post_json("/v1/chat", json!({"message": "Hello"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(body["error"].as_str().unwrap().contains("slow down"));
    }

    #[tokio::test]
    async fn metrics_endpoint_exposes_call_counters() {
        let mock = Arc::new(MockCompletionClient::new());
        mock.enqueue_reply("ok");
        let (app, _) = app(&mock);
        app.clone()
            .oneshot(post_json("/api", json!({"sid": 3, "msg": "Hi"})))
            .await
            .unwrap();

        let response = app.oneshot(get("/metrics")).await.unwrap();
        let text = body_text(response).await;

        assert!(text.contains("parley_calls_total"));
        assert!(text.contains("parley_sessions"));
    }
}
