use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::actions::{dispatch, ActionContext, ChatAction};
use crate::auth::{authenticate, RemoteAuth, SessionResolver};
use crate::config::{AuthMode, Config, StoreBackend};
use crate::error::ApiError;
use crate::store::{ChatStore, MemorySeed, MemoryStore, PageLimits, PgStore};

pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    pub sessions: SessionResolver,
    pub page_limits: PageLimits,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chat-api", post(chat_api))
        .route("/functions/v1/chat-api", post(chat_api))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

/// Credentials are checked before the body is parsed, so an anonymous caller
/// gets a 401 rather than a validation error.
async fn chat_api(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let caller = authenticate(state.store.as_ref(), &state.sessions, &headers).await?;

    let action = serde_json::from_slice::<ChatAction>(&body)
        .map_err(|err| ApiError::bad_request(format!("invalid request: {err}")))?;

    let ctx = ActionContext {
        store: state.store.as_ref(),
        caller: &caller,
        page_limits: state.page_limits,
    };
    dispatch(&ctx, action).await.map(Json)
}

async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn ChatStore>> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let store = PgStore::connect(&config.database_url, config.max_connections)
                .await
                .context("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)")?;
            store
                .run_migrations()
                .await
                .context("failed to run sqlx migrations")?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            let seed = match &config.memory_seed {
                Some(path) => {
                    let raw = tokio::fs::read_to_string(path)
                        .await
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    serde_json::from_str::<MemorySeed>(&raw)
                        .with_context(|| format!("invalid memory seed {}", path.display()))?
                }
                None => MemorySeed::default(),
            };
            tracing::warn!("using in-memory store; data is lost on restart");
            Ok(Arc::new(MemoryStore::with_seed(seed)))
        }
    }
}

fn build_sessions(config: &Config) -> anyhow::Result<SessionResolver> {
    Ok(match config.auth_mode {
        AuthMode::Database => SessionResolver::Database,
        AuthMode::Remote => {
            let url = config
                .auth_remote_url
                .as_deref()
                .context("AUTH_REMOTE_URL must be set when AUTH_MODE=remote")?;
            SessionResolver::Remote(RemoteAuth::new(url, config.auth_remote_api_key.clone()))
        }
    })
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        store: build_store(&config).await?,
        sessions: build_sessions(&config)?,
        page_limits: config.page_limits,
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(port = config.port, "support chat server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("server runtime failure")
}
