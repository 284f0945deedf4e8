use std::path::PathBuf;

use serde::Deserialize;

/// Router configuration.
///
/// Loaded from an optional TOML file with every field defaulted, then
/// overridden by environment variables. CLI parsing, persona files, and
/// directory-layout bootstrap are owned by an external caller; this struct
/// is the seam it wires values into.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub max_models: usize,
    pub idle_threshold_secs: u64,
    pub idle_check_interval_secs: u64,
    pub startup_timeout_secs: u64,
    pub backend_port_min: u16,
    pub backend_port_max: u16,
    pub cors_origins: Vec<String>,
    pub models_dir: PathBuf,
    pub inference_binary: PathBuf,
    pub template_cache_dir: PathBuf,
    pub snapshot_path: PathBuf,
    pub logs_dir: PathBuf,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            bind_port: default_bind_port(),
            max_models: default_max_models(),
            idle_threshold_secs: default_idle_threshold_secs(),
            idle_check_interval_secs: default_idle_check_interval_secs(),
            startup_timeout_secs: default_startup_timeout_secs(),
            backend_port_min: default_backend_port_min(),
            backend_port_max: default_backend_port_max(),
            cors_origins: default_cors_origins(),
            models_dir: default_models_dir(),
            inference_binary: default_inference_binary(),
            template_cache_dir: default_template_cache_dir(),
            snapshot_path: default_snapshot_path(),
            logs_dir: default_logs_dir(),
        }
    }
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}
fn default_bind_port() -> u16 {
    8090
}
fn default_max_models() -> usize {
    2
}
fn default_idle_threshold_secs() -> u64 {
    600
}
fn default_idle_check_interval_secs() -> u64 {
    60
}
fn default_startup_timeout_secs() -> u64 {
    60
}
fn default_backend_port_min() -> u16 {
    9100
}
fn default_backend_port_max() -> u16 {
    9199
}
fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_models_dir() -> PathBuf {
    PathBuf::from("./models")
}
fn default_inference_binary() -> PathBuf {
    PathBuf::from("llama-server")
}
fn default_template_cache_dir() -> PathBuf {
    PathBuf::from("./cache/templates")
}
fn default_snapshot_path() -> PathBuf {
    PathBuf::from("./state/router.json")
}

const ENV_PREFIX: &str = "ROUTER_";

impl RouterConfig {
    /// Load from an optional TOML file, falling back to all-defaults when
    /// the path is absent, then apply environment overrides.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(p)?;
                toml::from_str(&text)?
            }
            Some(p) => {
                tracing::warn!(path = %p.display(), "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}BIND_HOST")) {
            self.bind_host = v;
        }
        if let Some(v) = env_parsed::<u16>("BIND_PORT") {
            self.bind_port = v;
        }
        if let Some(v) = env_parsed::<usize>("MAX_MODELS") {
            self.max_models = v;
        }
        if let Some(v) = env_parsed::<u64>("IDLE_THRESHOLD_SECS") {
            self.idle_threshold_secs = v;
        }
        if let Some(v) = env_parsed::<u64>("IDLE_CHECK_INTERVAL_SECS") {
            self.idle_check_interval_secs = v;
        }
        if let Some(v) = env_parsed::<u64>("STARTUP_TIMEOUT_SECS") {
            self.startup_timeout_secs = v;
        }
        if let Some(v) = env_parsed::<u16>("BACKEND_PORT_MIN") {
            self.backend_port_min = v;
        }
        if let Some(v) = env_parsed::<u16>("BACKEND_PORT_MAX") {
            self.backend_port_max = v;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}CORS_ORIGINS")) {
            self.cors_origins = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}MODELS_DIR")) {
            self.models_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}INFERENCE_BINARY")) {
            self.inference_binary = PathBuf::from(v);
        }
    }
}

fn env_parsed<T: std::str::FromStr>(suffix: &str) -> Option<T> {
    std::env::var(format!("{ENV_PREFIX}{suffix}"))
        .ok()
        .and_then(|v| v.parse().ok())
}
