use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;
use crate::assets;
use crate::cors;
use crate::routes;

pub fn build_router(state: AppState) -> Router {
    let cors_layer = cors::build(state.config.cors_origins.clone());

    Router::new()
        .route("/health", get(routes::health))
        .route("/v1/models", get(routes::list_models))
        .route("/v1/chat/completions", post(routes::chat_completions))
        .route("/v1/completions", post(routes::completions))
        .route("/v1/embeddings", post(routes::embeddings))
        .route("/v1/messages", post(routes::messages))
        .route("/v1/messages/count_tokens", post(routes::count_tokens))
        .route("/api/status", get(routes::status))
        .route("/api/run", post(routes::run))
        .route("/api/stop", post(routes::stop))
        .route("/api/stop-all", post(routes::stop_all))
        .route("/", get(spa_root))
        .route("/*path", get(spa_fallback))
        .layer(cors_layer)
        .with_state(state)
}

async fn spa_root() -> Response {
    assets::serve_spa_fallback("")
}

async fn spa_fallback(State(_state): State<AppState>, Path(path): Path<String>) -> Response {
    if assets::is_spa_route(&path) {
        assets::serve_spa_fallback(&path)
    } else {
        axum::http::StatusCode::NOT_FOUND.into_response()
    }
}
