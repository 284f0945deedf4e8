use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Response, StatusCode};

use router_core::RouterError;

/// Transparent reverse proxy: forwards method/headers/body to the backend
/// verbatim and streams the response back without reinterpreting it, so
/// server-sent-event chat streams pass through untouched.
pub async fn forward(
    http: &reqwest::Client,
    port: u16,
    path: &str,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, RouterError> {
    let url = format!("http://127.0.0.1:{port}{path}");
    let mut builder = http.request(method, &url);
    for (name, value) in headers.iter() {
        if name == axum::http::header::HOST || name == axum::http::header::CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name, value);
    }

    let upstream = builder
        .body(body)
        .send()
        .await
        .map_err(|e| RouterError::Internal(e.into()))?;

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let response_headers = upstream.headers().clone();
    let stream = upstream.bytes_stream();

    let mut response = Response::builder()
        .status(status)
        .body(Body::from_stream(stream))
        .map_err(|e| RouterError::Internal(e.into()))?;
    for (name, value) in response_headers.iter() {
        response.headers_mut().insert(name, value.clone());
    }
    Ok(response)
}

pub fn extract_model(body: &[u8]) -> Result<String, RouterError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| RouterError::BadRequest(format!("invalid JSON body: {e}")))?;
    value
        .get("model")
        .and_then(|m| m.as_str())
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .ok_or_else(|| RouterError::BadRequest("missing 'model' field".into()))
}
