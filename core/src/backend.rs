use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use serde::Serialize;
use tokio::process::Child;
use tokio::sync::{watch, Mutex, RwLock};

/// A single option value frozen at load time, used to diff reload requests.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

pub type Options = HashMap<String, OptionValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Starting,
    Ready,
    Stopping,
    Stopped,
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendStatus::Starting => "starting",
            BackendStatus::Ready => "ready",
            BackendStatus::Stopping => "stopping",
            BackendStatus::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

struct Mutable {
    status: BackendStatus,
    last_activity: Instant,
}

/// The live record for one child inference process.
///
/// `status`/`last_activity` sit behind their own lock so a request handler
/// never has to touch the registry lock just to bump an activity timestamp.
pub struct Backend {
    pub model_name: String,
    pub model_path: PathBuf,
    pub port: u16,
    pub started_at: Instant,
    pub options: Options,
    pub log_path: PathBuf,
    pub process: Mutex<Option<Child>>,
    mutable: RwLock<Mutable>,
    ready_tx: StdMutex<Option<watch::Sender<()>>>,
    ready_rx: watch::Receiver<()>,
}

impl Backend {
    pub fn new(
        model_name: String,
        model_path: PathBuf,
        port: u16,
        options: Options,
        log_path: PathBuf,
    ) -> Self {
        let (tx, rx) = watch::channel(());
        let now = Instant::now();
        Self {
            model_name,
            model_path,
            port,
            started_at: now,
            options,
            log_path,
            process: Mutex::new(None),
            mutable: RwLock::new(Mutable {
                status: BackendStatus::Starting,
                last_activity: now,
            }),
            ready_tx: StdMutex::new(Some(tx)),
            ready_rx: rx,
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        self.process.lock().await.as_ref().and_then(|c| c.id())
    }

    pub async fn status(&self) -> BackendStatus {
        self.mutable.read().await.status
    }

    pub async fn set_status(&self, status: BackendStatus) {
        self.mutable.write().await.status = status;
    }

    pub async fn update_activity(&self) {
        self.mutable.write().await.last_activity = Instant::now();
    }

    pub async fn idle_duration(&self) -> std::time::Duration {
        self.mutable.read().await.last_activity.elapsed()
    }

    pub fn ready_signal(&self) -> watch::Receiver<()> {
        self.ready_rx.clone()
    }

    /// Closes the readiness broadcast. Safe to call more than once; only
    /// the first call has any effect.
    pub fn close_ready_signal(&self) {
        let mut guard = self.ready_tx.lock().expect("ready_tx lock poisoned");
        guard.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_ready_signal_is_idempotent() {
        let backend = Backend::new("m".into(), "m.gguf".into(), 9100, Options::new(), "m.log".into());
        let mut rx = backend.ready_signal();
        backend.close_ready_signal();
        backend.close_ready_signal();
        assert!(rx.changed().await.is_err());
    }

    #[tokio::test]
    async fn idle_duration_grows_until_activity_update() {
        let backend = Backend::new("m".into(), "m.gguf".into(), 9100, Options::new(), "m.log".into());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let before = backend.idle_duration().await;
        backend.update_activity().await;
        let after = backend.idle_duration().await;
        assert!(after < before);
    }
}
