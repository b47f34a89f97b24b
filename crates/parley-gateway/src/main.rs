//! Parley Gateway - Entry Point

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use parley_context::{JsonDirRepository, SessionStore, TiktokenTokenizer};
use parley_gateway::{build_routes, metrics, AppState, GatewayConfig, GATEWAY_VERSION};
use parley_runtime::{ModelRegistry, OpenAIClient};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "parley_gateway=info,parley_context=info,tower_http=info";

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = GatewayConfig::parse();
    init_tracing(config.log_json);
    metrics::init_metrics();

    tracing::info!("Starting Parley Gateway v{}", GATEWAY_VERSION);

    let models = ModelRegistry::builtin();
    models
        .resolve(&config.default_model)
        .with_context(|| {
            format!(
                "default model {:?} is not one of {:?}",
                config.default_model,
                models.keys()
            )
        })?;

    let client = match &config.api_base {
        Some(base) => {
            let key = std::env::var("OPENAI_API_KEY")
                .context("OPENAI_API_KEY environment variable must be set")?;
            OpenAIClient::new(key, base.clone(), config.request_timeout())?
        }
        None => OpenAIClient::from_env(Some(config.request_timeout()))?,
    };
    let tokenizer = TiktokenTokenizer::new()?;
    let repository = JsonDirRepository::new(&config.data_dir);
    let store = Arc::new(
        SessionStore::open(Arc::new(client), Arc::new(tokenizer), Arc::new(repository))
            .await
            .with_context(|| format!("loading sessions from {}", config.data_dir.display()))?,
    );

    let state = AppState::new(
        store.clone(),
        models,
        config.system_msg.clone(),
        config.default_model.clone(),
    );
    let app = Router::new()
        .merge(build_routes(state))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .layer(TraceLayer::new_for_http());

    let addr = config.bind_addr()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let saved = store.save().await?;
    tracing::info!(sessions = saved, "Sessions saved, bye");

    Ok(())
}
