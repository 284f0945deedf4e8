use axum::http::HeaderValue;
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Builds a CORS layer from a configured allow-list. `*` is honored as a
/// literal wildcard; anything else is matched exactly or with a `:port`
/// suffix on the configured origin, so `https://evil-example.com` can
/// never pass a configured `https://example.com`.
pub fn build(origins: Vec<String>) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let allowed = origins;
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let Ok(origin) = origin.to_str() else {
                return false;
            };
            allowed.iter().any(|configured| origin_matches(configured, origin))
        }))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

fn origin_matches(configured: &str, incoming: &str) -> bool {
    if configured == incoming {
        return true;
    }
    incoming.starts_with(configured) && incoming[configured.len()..].starts_with(':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_origin_matches() {
        assert!(origin_matches("https://example.com", "https://example.com"));
    }

    #[test]
    fn port_suffix_matches() {
        assert!(origin_matches("http://localhost", "http://localhost:5173"));
    }

    #[test]
    fn subdomain_is_not_a_port_bypass() {
        assert!(!origin_matches("https://example.com", "https://evil-example.com"));
        assert!(!origin_matches("https://example.com", "https://example.com.evil.net"));
    }
}
