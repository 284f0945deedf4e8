use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex;

use crate::backend::{Backend, BackendStatus, OptionValue, Options};
use crate::config::RouterConfig;
use crate::error::{Result, RouterError};
use crate::port::PortAllocator;
use crate::resolver::{self, DownloadedModel, Resolution};
use crate::state::{BackendSnapshot, StatePersistence};
use crate::template;

/// Option keys that require a reload when their value changes. Everything
/// else in a caller's options map is informational only.
const SERVER_AFFECTING_KEYS: &[&str] = &[
    "ctx_size",
    "gpu_layers",
    "threads",
    "batch_size",
    "ubatch_size",
    "flash_attn",
    "cache_type_k",
    "cache_type_v",
    "mlock",
];

struct Registry {
    backends: HashMap<String, Arc<Backend>>,
    mru: Vec<String>,
}

impl Registry {
    fn touch_mru(&mut self, name: &str) {
        self.mru.retain(|n| n != name);
        self.mru.insert(0, name.to_string());
    }
}

pub struct ModelManager {
    config: RouterConfig,
    ports: PortAllocator,
    registry: Mutex<Registry>,
    /// Serializes the evict-then-insert admission sequence so two concurrent
    /// `get_or_load` calls for distinct missing models can't each observe
    /// the registry at capacity, each evict a victim, and both insert,
    /// overshooting `max_models`.
    admission: Mutex<()>,
    http: reqwest::Client,
    persistence: Arc<StatePersistence>,
}

impl ModelManager {
    pub fn new(config: RouterConfig, persistence: Arc<StatePersistence>) -> Self {
        let ports = PortAllocator::new(config.backend_port_min, config.backend_port_max);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            config,
            ports,
            registry: Mutex::new(Registry {
                backends: HashMap::new(),
                mru: Vec::new(),
            }),
            admission: Mutex::new(()),
            http,
            persistence,
        }
    }

    fn scan_models(&self) -> Result<Vec<DownloadedModel>> {
        resolver::scan(&self.config.models_dir)
    }

    pub fn list_downloaded(&self) -> Result<Vec<DownloadedModel>> {
        self.scan_models()
    }

    pub async fn list_backends(&self) -> Vec<Arc<Backend>> {
        self.registry.lock().await.backends.values().cloned().collect()
    }

    pub async fn get_backend(&self, model_name: &str) -> Option<Arc<Backend>> {
        self.registry.lock().await.backends.get(model_name).cloned()
    }

    /// Coalescing entry point: resolve, reuse if ready, wait if starting,
    /// otherwise spawn exactly one startup worker and wait on it.
    pub async fn get_or_load(&self, query: &str, options: Options) -> Result<Arc<Backend>> {
        let models = self.scan_models()?;
        let resolved = match resolver::resolve(query, &models) {
            Resolution::Unique(m) => m,
            Resolution::Ambiguous(hits) => {
                return Err(RouterError::Ambiguous(hits.into_iter().map(|m| m.full_name).collect()))
            }
            Resolution::NotFound { suggestions } => {
                return Err(RouterError::NotFound {
                    suggestions: suggestions.into_iter().map(|m| m.full_name).collect(),
                })
            }
        };

        loop {
            let existing = {
                let mut reg = self.registry.lock().await;
                reg.backends.get(&resolved.full_name).cloned()
            };

            if let Some(backend) = existing {
                let status = backend.status().await;
                match status {
                    BackendStatus::Ready => {
                        if options_require_reload(&backend.options, &options) {
                            self.stop(&resolved.full_name).await?;
                            continue;
                        }
                        let mut reg = self.registry.lock().await;
                        reg.touch_mru(&resolved.full_name);
                        drop(reg);
                        backend.update_activity().await;
                        return Ok(backend);
                    }
                    BackendStatus::Starting => {
                        let mut rx = backend.ready_signal();
                        let _ = rx.changed().await;
                        if backend.status().await == BackendStatus::Ready {
                            backend.update_activity().await;
                            return Ok(backend);
                        }
                        return Err(RouterError::StartupFailed {
                            model: resolved.full_name.clone(),
                            reason: "backend exited before becoming ready".into(),
                        });
                    }
                    BackendStatus::Stopping | BackendStatus::Stopped => {
                        // A concurrent stop() is still tearing this entry
                        // down (or about to remove it). Retry rather than
                        // racing a fresh spawn against its final removal.
                        tokio::time::sleep(Duration::from_millis(25)).await;
                        continue;
                    }
                }
            }

            // Held across the re-check, the eviction, and the registry
            // insert so no other get_or_load can interleave between "room
            // freed up" and "new entry inserted", and so two callers racing
            // on the same missing model can't both decide to spawn.
            let admission = self.admission.lock().await;
            let already = {
                let reg = self.registry.lock().await;
                reg.backends.get(&resolved.full_name).cloned()
            };
            if already.is_some() {
                drop(admission);
                continue;
            }
            self.enforce_capacity().await?;
            let admitted = self.admit_backend(resolved.clone(), options.clone()).await;
            drop(admission);
            let backend = admitted?;
            return self.await_backend_ready(backend, resolved.full_name).await;
        }
    }

    async fn enforce_capacity(&self) -> Result<()> {
        if self.config.max_models == 0 {
            return Ok(());
        }
        let victim = {
            let reg = self.registry.lock().await;
            if reg.backends.len() < self.config.max_models {
                None
            } else {
                reg.mru.last().cloned()
            }
        };
        if let Some(name) = victim {
            self.stop(&name).await.ok();
        }
        Ok(())
    }

    /// Allocates a port, creates the registry entry, and launches the
    /// startup worker. Callers hold `admission` across this so the
    /// capacity check and the insert it follows are never split by a
    /// concurrent admission.
    async fn admit_backend(&self, model: DownloadedModel, options: Options) -> Result<Arc<Backend>> {
        let port = self.ports.allocate()?;
        let log_path = self.config.logs_dir.join(format!("{}.log", sanitize(&model.full_name)));
        let backend = Arc::new(Backend::new(
            model.full_name.clone(),
            model.path.clone(),
            port,
            options,
            log_path,
        ));

        {
            let mut reg = self.registry.lock().await;
            reg.backends.insert(model.full_name.clone(), backend.clone());
            reg.mru.insert(0, model.full_name.clone());
        }
        self.persist().await;

        let worker_backend = backend.clone();
        let worker_config = self.config.clone();
        let worker_http = self.http.clone();
        tokio::spawn(async move {
            run_startup_worker(worker_backend, worker_config, worker_http).await;
        });

        Ok(backend)
    }

    /// Waits for a just-admitted backend to become ready. Deliberately run
    /// outside the `admission` lock so one slow startup can't stall every
    /// other model's admission.
    async fn await_backend_ready(&self, backend: Arc<Backend>, model_name: String) -> Result<Arc<Backend>> {
        let mut rx = backend.ready_signal();
        let timeout = Duration::from_secs(self.config.startup_timeout_secs);
        let outcome = tokio::time::timeout(timeout, rx.changed()).await;
        self.persist().await;

        match outcome {
            Err(_) => {
                self.stop(&model_name).await.ok();
                Err(RouterError::StartupTimeout {
                    model: model_name,
                    timeout_secs: self.config.startup_timeout_secs,
                })
            }
            Ok(_) => {
                if backend.status().await == BackendStatus::Ready {
                    Ok(backend)
                } else {
                    Err(RouterError::StartupFailed {
                        model: model_name,
                        reason: "startup worker reported failure".into(),
                    })
                }
            }
        }
    }

    pub async fn stop(&self, model_name: &str) -> Result<()> {
        let backend = {
            let reg = self.registry.lock().await;
            reg.backends
                .get(model_name)
                .cloned()
                .ok_or_else(|| RouterError::UnknownBackend(model_name.to_string()))?
        };
        backend.set_status(BackendStatus::Stopping).await;

        let mut guard = backend.process.lock().await;
        if let Some(child) = guard.as_mut() {
            if let Some(pid) = child.id() {
                send_signal(pid, nix::sys::signal::Signal::SIGTERM);
            }
            let waited = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
            if waited.is_err() {
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
        drop(guard);

        self.ports.release(backend.port);
        backend.close_ready_signal();
        backend.set_status(BackendStatus::Stopped).await;

        {
            let mut reg = self.registry.lock().await;
            reg.backends.remove(model_name);
            reg.mru.retain(|n| n != model_name);
        }
        self.persist().await;
        Ok(())
    }

    pub async fn stop_all(&self) -> Result<()> {
        let names: Vec<String> = {
            let reg = self.registry.lock().await;
            reg.backends.keys().cloned().collect()
        };
        let mut last_err = None;
        for name in names {
            if let Err(e) = self.stop(&name).await {
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn persist(&self) {
        let reg = self.registry.lock().await;
        let mut backends = Vec::new();
        for backend in reg.backends.values() {
            backends.push(BackendSnapshot {
                model_name: backend.model_name.clone(),
                pid: backend.pid().await,
                port: backend.port,
                started_at: backend
                    .started_at
                    .elapsed()
                    .as_secs()
                    .try_into()
                    .unwrap_or(0),
            });
        }
        drop(reg);
        self.persistence.save(
            self.config.bind_host.clone(),
            self.config.bind_port,
            backends,
        );
    }
}

/// Looks for a vision projector file (e.g. `mmproj-*.gguf`) alongside the
/// model weights. Multimodal model directories ship the projector as a
/// separate file next to the main weights; absence just means a text-only
/// model.
fn find_vision_projector(model_path: &std::path::Path) -> Option<std::path::PathBuf> {
    let dir = model_path.parent()?;
    std::fs::read_dir(dir).ok()?.flatten().map(|e| e.path()).find(|p| {
        let name = p.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_lowercase();
        name.ends_with(".gguf") && (name.contains("mmproj") || name.contains("vision") || name.contains("clip"))
    })
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn send_signal(pid: u32, sig: nix::sys::signal::Signal) {
    let pid = nix::unistd::Pid::from_raw(pid as i32);
    match nix::sys::signal::kill(pid, sig) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::warn!(?e, pid = pid.as_raw(), "failed to signal backend process"),
    }
}

fn options_require_reload(current: &Options, requested: &Options) -> bool {
    if requested.is_empty() {
        return false;
    }
    for key in SERVER_AFFECTING_KEYS {
        let (Some(a), Some(b)) = (current.get(*key), requested.get(*key)) else {
            continue;
        };
        if !option_values_equal(a, b) {
            return true;
        }
    }
    false
}

fn option_values_equal(a: &OptionValue, b: &OptionValue) -> bool {
    match (a, b) {
        (OptionValue::Bool(x), OptionValue::Bool(y)) => x == y,
        (OptionValue::Str(x), OptionValue::Str(y)) => x == y,
        (OptionValue::Int(x), OptionValue::Int(y)) => x == y,
        (a, b) => as_f64(a) == as_f64(b),
    }
}

fn as_f64(v: &OptionValue) -> Option<f64> {
    match v {
        OptionValue::Int(i) => Some(*i as f64),
        OptionValue::Float(f) => Some(*f),
        _ => None,
    }
}

fn build_args(
    backend: &Backend,
    config: &RouterConfig,
    template_path: Option<&std::path::Path>,
    projector_path: Option<&std::path::Path>,
) -> Vec<String> {
    let mut args = vec![
        "--model".to_string(),
        backend.model_path.display().to_string(),
        "--host".to_string(),
        "127.0.0.1".to_string(),
        "--port".to_string(),
        backend.port.to_string(),
        "--embeddings".to_string(),
        "--no-webui".to_string(),
    ];
    if let Some(path) = template_path {
        args.push("--chat-template-file".to_string());
        args.push(path.display().to_string());
    }
    if let Some(path) = projector_path {
        args.push("--mmproj".to_string());
        args.push(path.display().to_string());
    }
    for (key, value) in &backend.options {
        match value {
            OptionValue::Bool(true) => args.push(format!("--{key}")),
            OptionValue::Bool(false) => {}
            OptionValue::Int(i) => {
                args.push(format!("--{key}"));
                args.push(i.to_string());
            }
            OptionValue::Float(f) => {
                args.push(format!("--{key}"));
                if f.fract() == 0.0 {
                    args.push(format!("{}", *f as i64));
                } else {
                    args.push(f.to_string());
                }
            }
            OptionValue::Str(s) if !s.is_empty() => {
                args.push(format!("--{key}"));
                args.push(s.clone());
            }
            OptionValue::Str(_) => {}
        }
    }
    let _ = config;
    args
}

async fn run_startup_worker(backend: Arc<Backend>, config: RouterConfig, http: reqwest::Client) {
    let model_path = backend.model_path.clone();
    let template_cache_dir = config.template_cache_dir.clone();
    let (template_path, projector_path) = tokio::task::spawn_blocking(move || {
        let projector = find_vision_projector(&model_path);
        let template = std::fs::read(&model_path).ok().and_then(|bytes| {
            let mtime = std::fs::metadata(&model_path)
                .and_then(|m| m.modified())
                .map(|t| t.duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_nanos() as i128)
                .unwrap_or(0);
            template::extract_and_patch(&model_path, &bytes, mtime, &template_cache_dir)
                .ok()
                .flatten()
        });
        (template, projector)
    })
    .await
    .unwrap_or((None, None));

    let args = build_args(&backend, &config, template_path.as_deref(), projector_path.as_deref());

    let log_file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&backend.log_path)
        .await
    {
        Ok(f) => f,
        Err(e) => {
            tracing::error!(?e, model = %backend.model_name, "failed to open backend log file");
            backend.set_status(BackendStatus::Stopped).await;
            backend.close_ready_signal();
            return;
        }
    };
    let stderr_file = log_file.try_clone().await.ok();

    let mut command = Command::new(&config.inference_binary);
    command.args(&args).kill_on_drop(true);
    command.stdout(log_file.into_std().await);
    if let Some(f) = stderr_file {
        command.stderr(f.into_std().await);
    }

    let child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(?e, model = %backend.model_name, "failed to spawn inference process");
            backend.set_status(BackendStatus::Stopped).await;
            backend.close_ready_signal();
            return;
        }
    };
    *backend.process.lock().await = Some(child);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(config.startup_timeout_secs);
    let health_url = format!("http://127.0.0.1:{}/health", backend.port);

    loop {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(model = %backend.model_name, "backend startup timed out");
            kill_backend_process(&backend).await;
            backend.set_status(BackendStatus::Stopped).await;
            backend.close_ready_signal();
            return;
        }

        {
            let mut guard = backend.process.lock().await;
            if let Some(child) = guard.as_mut() {
                if let Ok(Some(_status)) = child.try_wait() {
                    tracing::warn!(model = %backend.model_name, "backend process exited during startup");
                    backend.set_status(BackendStatus::Stopped).await;
                    backend.close_ready_signal();
                    return;
                }
            }
        }

        match http.get(&health_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                backend.set_status(BackendStatus::Ready).await;
                backend.close_ready_signal();
                return;
            }
            _ => {}
        }

        if log_has_error_signature(&backend.log_path) {
            tracing::warn!(model = %backend.model_name, "backend log shows a startup error signature");
            kill_backend_process(&backend).await;
            backend.set_status(BackendStatus::Stopped).await;
            backend.close_ready_signal();
            return;
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn kill_backend_process(backend: &Backend) {
    let mut guard = backend.process.lock().await;
    if let Some(child) = guard.as_mut() {
        let _ = child.kill().await;
    }
}

fn log_has_error_signature(log_path: &std::path::Path) -> bool {
    let Ok(contents) = std::fs::read_to_string(log_path) else {
        return false;
    };
    contents.lines().rev().take(50).any(|line| {
        let lower = line.to_lowercase();
        (lower.contains("error") && lower.contains("failed")) || lower.contains("could not load model")
    })
}
