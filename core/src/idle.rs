use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backend::BackendStatus;
use crate::manager::ModelManager;

/// Periodically stops backends that have been idle past the configured
/// threshold. `start` is idempotent; `stop` cancels the loop and waits for
/// it to observe cancellation before returning.
pub struct IdleMonitor {
    manager: Arc<ModelManager>,
    interval: Duration,
    threshold: Duration,
    cancel: CancellationToken,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl IdleMonitor {
    pub fn new(manager: Arc<ModelManager>, interval: Duration, threshold: Duration) -> Self {
        Self {
            manager,
            interval,
            threshold,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub async fn start(&self) {
        let mut guard = self.handle.lock().await;
        if guard.is_some() {
            return;
        }
        let manager = self.manager.clone();
        let interval = self.interval;
        let threshold = self.threshold;
        let cancel = self.cancel.clone();
        *guard = Some(tokio::spawn(async move {
            run(manager, interval, threshold, cancel).await;
        }));
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run(manager: Arc<ModelManager>, interval: Duration, threshold: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("idle monitor shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                sweep(&manager, threshold).await;
            }
        }
    }
}

async fn sweep(manager: &ModelManager, threshold: Duration) {
    let backends = manager.list_backends().await;
    for backend in backends {
        if backend.status().await != BackendStatus::Ready {
            continue;
        }
        if backend.idle_duration().await > threshold {
            tracing::info!(model = %backend.model_name, "evicting idle backend");
            if let Err(e) = manager.stop(&backend.model_name).await {
                tracing::warn!(?e, model = %backend.model_name, "failed to stop idle backend");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use crate::state::StatePersistence;

    fn test_manager(dir: &std::path::Path) -> Arc<ModelManager> {
        let mut config = RouterConfig::default();
        config.models_dir = dir.join("models");
        config.snapshot_path = dir.join("state.json");
        config.template_cache_dir = dir.join("templates");
        config.logs_dir = dir.join("logs");
        let persistence = Arc::new(StatePersistence::new(config.snapshot_path.clone(), 0));
        Arc::new(ModelManager::new(config, persistence))
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        let monitor = IdleMonitor::new(manager, Duration::from_secs(60), Duration::from_secs(600));
        monitor.start().await;
        monitor.start().await;
        assert!(monitor.handle.lock().await.is_some());
        monitor.stop().await;
    }

    #[tokio::test]
    async fn stop_before_start_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        let monitor = IdleMonitor::new(manager, Duration::from_secs(60), Duration::from_secs(600));
        monitor.stop().await;
    }

    #[tokio::test]
    async fn sweep_with_no_backends_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        sweep(&manager, Duration::from_secs(1)).await;
    }
}
