use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use router_core::RouterError;
use serde_json::json;

fn status_and_message(err: &RouterError) -> (StatusCode, String) {
    let status = match err {
        RouterError::Ambiguous(_) | RouterError::BadRequest(_) => StatusCode::BAD_REQUEST,
        RouterError::NotFound { .. } | RouterError::UnknownBackend(_) => StatusCode::NOT_FOUND,
        RouterError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        RouterError::CapacityExhausted => StatusCode::INTERNAL_SERVER_ERROR,
        RouterError::StartupTimeout { .. }
        | RouterError::StartupFailed { .. }
        | RouterError::BackendGone(_)
        | RouterError::ContainerFormat(_)
        | RouterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

/// OpenAI-shaped error body: `{"error":{"message","type","code"?}}`.
pub struct OpenAiError(pub RouterError);

impl IntoResponse for OpenAiError {
    fn into_response(self) -> Response {
        let (status, message) = status_and_message(&self.0);
        let body = json!({
            "error": {
                "message": message,
                "type": self.0.kind(),
                "code": serde_json::Value::Null,
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Anthropic-shaped error body plus a `request-id` header, matching the
/// Messages API envelope.
pub struct AnthropicError(pub RouterError);

fn anthropic_error_type(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "invalid_request_error",
        StatusCode::UNAUTHORIZED => "authentication_error",
        StatusCode::FORBIDDEN => "permission_error",
        StatusCode::NOT_FOUND => "not_found_error",
        StatusCode::PAYLOAD_TOO_LARGE => "request_too_large",
        StatusCode::TOO_MANY_REQUESTS => "rate_limit_error",
        StatusCode::SERVICE_UNAVAILABLE => "overloaded_error",
        _ => "api_error",
    }
}

impl IntoResponse for AnthropicError {
    fn into_response(self) -> Response {
        let (status, message) = status_and_message(&self.0);
        let request_id = format!("req_{}", &uuid::Uuid::new_v4().simple().to_string()[..24]);
        let body = json!({
            "type": "error",
            "error": {
                "type": anthropic_error_type(status),
                "message": message,
            },
            "request_id": request_id,
        });
        let mut response = (status, Json(body)).into_response();
        if let Ok(value) = request_id_header(&request_id) {
            response.headers_mut().insert("request-id", value);
        }
        response
    }
}

fn request_id_header(id: &str) -> Result<axum::http::HeaderValue, axum::http::header::InvalidHeaderValue> {
    axum::http::HeaderValue::from_str(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_maps_to_bad_request() {
        let err = RouterError::Ambiguous(vec!["a".into(), "b".into()]);
        let (status, _) = status_and_message(&err);
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn not_found_maps_to_404() {
        let err = RouterError::NotFound { suggestions: vec![] };
        let (status, _) = status_and_message(&err);
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn anthropic_error_type_mapping() {
        assert_eq!(anthropic_error_type(StatusCode::NOT_FOUND), "not_found_error");
        assert_eq!(anthropic_error_type(StatusCode::INTERNAL_SERVER_ERROR), "api_error");
    }
}
