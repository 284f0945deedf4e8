use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;

use router_core::backend::{BackendStatus, OptionValue, Options};
use router_core::RouterError;

use crate::app_state::AppState;
use crate::errors::{AnthropicError, OpenAiError};
use crate::proxying;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct ModelEntry {
    id: String,
    status: &'static str,
    port: Option<u16>,
    downloaded: bool,
}

pub async fn list_models(State(state): State<AppState>) -> Result<Json<serde_json::Value>, OpenAiError> {
    let downloaded = state.manager.list_downloaded().map_err(OpenAiError)?;
    let backends = state.manager.list_backends().await;

    let mut by_name: HashMap<String, ModelEntry> = HashMap::new();
    for model in downloaded {
        by_name.insert(
            model.full_name.clone(),
            ModelEntry {
                id: model.full_name,
                status: "stopped",
                port: None,
                downloaded: true,
            },
        );
    }
    for backend in backends {
        let status = backend.status().await;
        let status_str = match status {
            BackendStatus::Starting => "starting",
            BackendStatus::Ready => "ready",
            BackendStatus::Stopping => "stopping",
            BackendStatus::Stopped => "stopped",
        };
        by_name.insert(
            backend.model_name.clone(),
            ModelEntry {
                id: backend.model_name.clone(),
                status: status_str,
                port: Some(backend.port),
                downloaded: true,
            },
        );
    }
    let mut data: Vec<ModelEntry> = by_name.into_values().collect();
    data.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(Json(json!({ "object": "list", "data": data })))
}

fn json_value_to_option(value: &serde_json::Value) -> Option<OptionValue> {
    match value {
        serde_json::Value::Bool(b) => Some(OptionValue::Bool(*b)),
        serde_json::Value::String(s) => Some(OptionValue::Str(s.clone())),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(OptionValue::Int(i))
            } else {
                n.as_f64().map(OptionValue::Float)
            }
        }
        _ => None,
    }
}

fn options_from_json(value: Option<&serde_json::Value>) -> Options {
    let mut options = Options::new();
    let Some(serde_json::Value::Object(map)) = value else {
        return options;
    };
    for (key, value) in map {
        if let Some(v) = json_value_to_option(value) {
            options.insert(key.clone(), v);
        }
    }
    options
}

async fn proxy_to_backend(
    state: &AppState,
    path: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RouterError> {
    let model = proxying::extract_model(&body)?;
    let options = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("options").cloned());
    let options = options_from_json(options.as_ref());

    let backend = state.manager.get_or_load(&model, options).await?;
    backend.update_activity().await;

    proxying::forward(&state.http, backend.port, path, Method::POST, headers, body).await
}

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match proxy_to_backend(&state, "/v1/chat/completions", headers, body).await {
        Ok(resp) => resp,
        Err(e) => OpenAiError(e).into_response(),
    }
}

pub async fn completions(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match proxy_to_backend(&state, "/v1/completions", headers, body).await {
        Ok(resp) => resp,
        Err(e) => OpenAiError(e).into_response(),
    }
}

pub async fn embeddings(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match proxy_to_backend(&state, "/v1/embeddings", headers, body).await {
        Ok(resp) => resp,
        Err(e) => OpenAiError(e).into_response(),
    }
}

pub async fn messages(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match proxy_to_backend(&state, "/v1/messages", headers, body).await {
        Ok(resp) => resp,
        Err(e) => AnthropicError(e).into_response(),
    }
}

pub async fn count_tokens(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match proxy_to_backend(&state, "/v1/messages/count_tokens", headers, body).await {
        Ok(resp) => resp,
        Err(e) => AnthropicError(e).into_response(),
    }
}

#[derive(Serialize)]
struct BackendStatusEntry {
    model: String,
    status: String,
    port: u16,
    idle_secs: u64,
}

pub async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let backends = state.manager.list_backends().await;
    let mut entries = Vec::with_capacity(backends.len());
    for backend in &backends {
        entries.push(BackendStatusEntry {
            model: backend.model_name.clone(),
            status: backend.status().await.to_string(),
            port: backend.port,
            idle_secs: backend.idle_duration().await.as_secs(),
        });
    }
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "host": state.config.bind_host,
        "port": state.config.bind_port,
        "max_models": state.config.max_models,
        "loaded_count": entries.len(),
        "idle_threshold_secs": state.config.idle_threshold_secs,
        "backends": entries,
    }))
}

#[derive(Deserialize)]
pub struct RunRequest {
    model: String,
    #[serde(default)]
    options: serde_json::Value,
}

pub async fn run(State(state): State<AppState>, body: Bytes) -> Response {
    let req: RunRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return OpenAiError(RouterError::BadRequest(format!("invalid JSON body: {e}"))).into_response(),
    };
    let options = options_from_json(Some(&req.options));
    match state.manager.get_or_load(&req.model, options).await {
        Ok(backend) => Json(json!({
            "model": backend.model_name,
            "port": backend.port,
            "status": backend.status().await.to_string(),
        }))
        .into_response(),
        Err(e) => OpenAiError(e).into_response(),
    }
}

#[derive(Deserialize)]
pub struct ModelNameRequest {
    model: String,
}

pub async fn stop(State(state): State<AppState>, body: Bytes) -> Response {
    let req: ModelNameRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return OpenAiError(RouterError::BadRequest(format!("invalid JSON body: {e}"))).into_response(),
    };
    match state.manager.stop(&req.model).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => OpenAiError(e).into_response(),
    }
}

pub async fn stop_all(State(state): State<AppState>) -> Response {
    match state.manager.stop_all().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => OpenAiError(e).into_response(),
    }
}
