/// Stable error taxonomy surfaced across the crate boundary.
///
/// Internal plumbing uses `anyhow::Result` and gets mapped into one of
/// these kinds wherever a caller needs a stable, matchable reason.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("query matched multiple models: {0:?}")]
    Ambiguous(Vec<String>),

    #[error("no model matched the query")]
    NotFound { suggestions: Vec<String> },

    #[error("no free backend port available")]
    CapacityExhausted,

    #[error("backend for '{model}' did not become ready within {timeout_secs}s")]
    StartupTimeout { model: String, timeout_secs: u64 },

    #[error("backend for '{model}' failed to start: {reason}")]
    StartupFailed { model: String, reason: String },

    #[error("backend for '{0}' is gone")]
    BackendGone(String),

    #[error("no backend named '{0}' is loaded")]
    UnknownBackend(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("malformed model container: {0}")]
    ContainerFormat(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RouterError {
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::Ambiguous(_) => "ambiguous",
            RouterError::NotFound { .. } => "not_found",
            RouterError::CapacityExhausted => "capacity_exhausted",
            RouterError::StartupTimeout { .. } => "startup_timeout",
            RouterError::StartupFailed { .. } => "startup_failed",
            RouterError::BackendGone(_) => "backend_gone",
            RouterError::UnknownBackend(_) => "unknown_backend",
            RouterError::BadRequest(_) => "bad_request",
            RouterError::MethodNotAllowed => "method_not_allowed",
            RouterError::ContainerFormat(_) => "container_format",
            RouterError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
