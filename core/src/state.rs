use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSnapshot {
    pub model_name: String,
    pub pid: Option<u32>,
    pub port: u16,
    pub started_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub pid: u32,
    pub host: String,
    pub port: u16,
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backends: Vec<BackendSnapshot>,
}

/// Owns the on-disk snapshot file: atomic writes, and orphan cleanup of a
/// previous run's children when the parent that owned them is dead.
pub struct StatePersistence {
    path: PathBuf,
    started_at: i64,
    last: Mutex<()>,
}

impl StatePersistence {
    pub fn new(path: PathBuf, started_at: i64) -> Self {
        Self {
            path,
            started_at,
            last: Mutex::new(()),
        }
    }

    /// Write-temp-then-rename so readers never observe a half-written file.
    pub fn save(&self, host: String, port: u16, backends: Vec<BackendSnapshot>) {
        let _guard = self.last.lock().expect("snapshot lock poisoned");
        let snapshot = Snapshot {
            pid: std::process::id(),
            host,
            port,
            started_at: self.started_at,
            backends,
        };
        if let Err(e) = write_atomic(&self.path, &snapshot) {
            tracing::warn!(?e, path = %self.path.display(), "failed to persist router snapshot");
        }
    }

    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    pub fn load(&self) -> Option<Snapshot> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Run at process start, before the manager exists: if the prior
    /// parent is dead, kill any of its recorded children still alive and
    /// still running the inference binary, then drop the stale snapshot.
    pub async fn cleanup_orphans(&self, inference_binary: &str) {
        let Some(snapshot) = self.load() else {
            return;
        };
        if pid_is_alive(snapshot.pid) {
            tracing::info!(pid = snapshot.pid, "previous router instance still running, leaving snapshot in place");
            return;
        }
        for child in &snapshot.backends {
            let Some(pid) = child.pid else { continue };
            if !pid_is_alive(pid) {
                continue;
            }
            if !cmdline_contains(pid, inference_binary) {
                continue;
            }
            tracing::info!(pid, model = %child.model_name, "cleaning up orphaned backend process");
            send_signal(pid, nix::sys::signal::Signal::SIGTERM);
            let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
            while tokio::time::Instant::now() < deadline && pid_is_alive(pid) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if pid_is_alive(pid) {
                send_signal(pid, nix::sys::signal::Signal::SIGKILL);
            }
        }
        self.remove();
    }
}

fn write_atomic(path: &std::path::Path, snapshot: &Snapshot) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let body = serde_json::to_vec_pretty(snapshot)?;
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
}

fn pid_is_alive(pid: u32) -> bool {
    let pid = nix::unistd::Pid::from_raw(pid as i32);
    matches!(nix::sys::signal::kill(pid, None), Ok(()))
}

fn send_signal(pid: u32, sig: nix::sys::signal::Signal) {
    let pid = nix::unistd::Pid::from_raw(pid as i32);
    let _ = nix::sys::signal::kill(pid, sig);
}

/// Best-effort, portable-enough verification that a PID still belongs to
/// the inference binary and isn't a reused PID for some unrelated process.
fn cmdline_contains(pid: u32, needle: &str) -> bool {
    let output = Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "command", "-ww"])
        .output();
    match output {
        Ok(out) => String::from_utf8_lossy(&out.stdout).contains(needle),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/router.json");
        let persistence = StatePersistence::new(path.clone(), 1234);
        persistence.save(
            "127.0.0.1".into(),
            8090,
            vec![BackendSnapshot {
                model_name: "a/b:Q4_K_M".into(),
                pid: Some(999_999),
                port: 9100,
                started_at: 5,
            }],
        );
        let loaded = persistence.load().unwrap();
        assert_eq!(loaded.backends.len(), 1);
        assert_eq!(loaded.started_at, 1234);
    }

    #[test]
    fn empty_backends_omitted_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.json");
        let persistence = StatePersistence::new(path.clone(), 1);
        persistence.save("127.0.0.1".into(), 8090, vec![]);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("backends"));
    }

    #[tokio::test]
    async fn cleanup_is_noop_without_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let persistence = StatePersistence::new(path, 1);
        persistence.cleanup_orphans("llama-server").await;
    }

    #[tokio::test]
    async fn scenario_7_dead_parent_triggers_cleanup_and_removes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.json");
        let persistence = StatePersistence::new(path.clone(), 1);

        // Spawn and reap a short-lived process so its PID is guaranteed dead.
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id().unwrap();
        child.wait().await.unwrap();

        let snapshot = Snapshot {
            pid: dead_pid,
            host: "127.0.0.1".into(),
            port: 8090,
            started_at: 1,
            backends: vec![],
        };
        write_atomic(&path, &snapshot).unwrap();
        persistence.cleanup_orphans("llama-server").await;
        assert!(!path.exists());
    }

    #[test]
    fn pid_is_alive_reports_false_for_a_reaped_process() {
        let output = Command::new("true").status().unwrap();
        assert!(output.success());
        // PID 1 is always alive on any Unix system under test.
        assert!(pid_is_alive(1));
    }
}
