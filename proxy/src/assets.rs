use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;

/// The web UI ships as a separate static-asset build; this embeds
/// whatever tree lands in `assets/web` at compile time so the binary has
/// no runtime dependency on that directory existing.
#[derive(RustEmbed)]
#[folder = "assets/web"]
struct WebAssets;

pub fn serve_spa_fallback(path: &str) -> Response {
    let asset_path = if path.is_empty() { "index.html" } else { path };
    if let Some(file) = WebAssets::get(asset_path) {
        return Response::builder()
            .header(header::CONTENT_TYPE, guess_content_type(asset_path))
            .body(Body::from(file.data.into_owned()))
            .unwrap();
    }
    match WebAssets::get("index.html") {
        Some(file) => Response::builder()
            .header(header::CONTENT_TYPE, "text/html")
            .body(Body::from(file.data.into_owned()))
            .unwrap(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn guess_content_type(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

/// Single-page-app fallback: no dotted extension, not under an API
/// namespace.
pub fn is_spa_route(path: &str) -> bool {
    !path.contains('.') && !path.starts_with("v1/") && !path.starts_with("api/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spa_route_excludes_api_and_versioned_paths() {
        assert!(is_spa_route(""));
        assert!(is_spa_route("chat"));
        assert!(!is_spa_route("v1/models"));
        assert!(!is_spa_route("api/status"));
        assert!(!is_spa_route("favicon.ico"));
    }
}
