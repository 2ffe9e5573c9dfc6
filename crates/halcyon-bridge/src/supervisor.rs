//! Child process lifecycle: spawn, monitor, kill.
//!
//! The supervisor owns the bridge child on its monitor thread, polling its
//! alive state in 100 ms ticks. Process death is how the server detects a
//! crashed plugin; there is no heartbeat on the RT path. On shutdown the
//! child gets two seconds to exit after the protocol-level Quit before it is
//! force-killed.

use crate::error::{BridgeError, Result};
use crate::protocol::{PluginType, ENV_SHM_IDS, NO_FILENAME};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const MONITOR_TICK: Duration = Duration::from_millis(100);
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct WineOptions {
    /// Wine executable; `wine` when unset. A configured absolute path gets a
    /// `64` suffix appended when that file exists.
    pub executable: Option<PathBuf>,
    /// Derive `WINEPREFIX` from the plugin path (walk up to a directory
    /// containing `drive_c`).
    pub auto_prefix: bool,
    /// Used when neither auto-derivation nor the environment supplies one.
    pub fallback_prefix: Option<PathBuf>,
}

/// Everything needed to launch one bridge child.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub binary: PathBuf,
    pub plugin_type: PluginType,
    pub filename: PathBuf,
    pub label: String,
    pub unique_id: i64,
    /// The four concatenated 6-char shm suffixes.
    pub shm_ids: String,
    /// Extra `ENGINE_OPTION_*` variables, name without the prefix.
    pub engine_options: Vec<(String, String)>,
    pub wine: WineOptions,
}

impl SpawnSpec {
    fn build_command(&self) -> Command {
        let uses_wine = cfg!(not(windows))
            && self.binary.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("exe"));

        let mut cmd = if uses_wine {
            let mut wine = self
                .wine
                .executable
                .clone()
                .unwrap_or_else(|| PathBuf::from("wine"));
            if wine.is_absolute() {
                let wine64 = PathBuf::from(format!("{}64", wine.display()));
                if wine64.is_file() {
                    wine = wine64;
                }
            }
            let mut cmd = Command::new(wine);
            cmd.arg(&self.binary);
            cmd
        } else {
            Command::new(&self.binary)
        };

        let filename = if self.filename.as_os_str().is_empty() {
            NO_FILENAME.to_string()
        } else {
            self.filename.display().to_string()
        };
        cmd.arg(self.plugin_type.as_str())
            .arg(filename)
            .arg(&self.label)
            .arg(self.unique_id.to_string());

        cmd.env(ENV_SHM_IDS, &self.shm_ids);
        for (key, value) in &self.engine_options {
            cmd.env(format!("ENGINE_OPTION_{key}"), value);
        }

        if uses_wine {
            if let Some(prefix) = self.wine_prefix() {
                cmd.env("WINEPREFIX", prefix);
            }
        }

        cmd
    }

    fn wine_prefix(&self) -> Option<PathBuf> {
        if self.wine.auto_prefix {
            if let Some(prefix) = find_wine_prefix(&self.filename) {
                return Some(prefix);
            }
        }
        if let Ok(env_prefix) = std::env::var("WINEPREFIX") {
            if !env_prefix.is_empty() {
                return Some(PathBuf::from(env_prefix));
            }
        }
        if let Some(fallback) = &self.wine.fallback_prefix {
            return Some(fallback.clone());
        }
        std::env::var("HOME").ok().map(|home| PathBuf::from(home).join(".wine"))
    }
}

/// Walk up from the plugin file looking for a wine prefix root.
pub fn find_wine_prefix(plugin_path: &Path) -> Option<PathBuf> {
    let mut dir = plugin_path.parent()?;
    loop {
        if dir.join("drive_c").is_dir() {
            return Some(dir.to_path_buf());
        }
        dir = dir.parent()?;
    }
}

enum MonitorRequest {
    /// Give the child `KILL_GRACE` to exit, then force-kill.
    Stop,
    /// Kill immediately.
    Kill,
}

pub struct ProcessSupervisor {
    running: Arc<AtomicBool>,
    exit_code: Arc<AtomicI32>,
    exited: Arc<AtomicBool>,
    request_tx: Sender<MonitorRequest>,
    monitor: Option<JoinHandle<()>>,
}

impl ProcessSupervisor {
    pub fn spawn(spec: &SpawnSpec) -> Result<Self> {
        let mut cmd = spec.build_command();
        tracing::debug!(binary = %spec.binary.display(), plugin_type = spec.plugin_type.as_str(),
                        "spawning bridge child");
        let child = cmd
            .spawn()
            .map_err(|e| BridgeError::Spawn(format!("{}: {e}", spec.binary.display())))?;

        let running = Arc::new(AtomicBool::new(true));
        let exit_code = Arc::new(AtomicI32::new(0));
        let exited = Arc::new(AtomicBool::new(false));
        let (request_tx, request_rx) = bounded(1);

        let monitor = std::thread::Builder::new()
            .name("bridge-supervisor".to_string())
            .spawn({
                let running = Arc::clone(&running);
                let exit_code = Arc::clone(&exit_code);
                let exited = Arc::clone(&exited);
                move || Self::monitor_loop(child, request_rx, running, exit_code, exited)
            })
            .map_err(|e| BridgeError::Spawn(format!("supervisor thread: {e}")))?;

        Ok(Self { running, exit_code, exited, request_tx, monitor: Some(monitor) })
    }

    fn monitor_loop(
        mut child: Child,
        requests: Receiver<MonitorRequest>,
        running: Arc<AtomicBool>,
        exit_code: Arc<AtomicI32>,
        exited: Arc<AtomicBool>,
    ) {
        let record_exit = |status: std::process::ExitStatus,
                           exit_code: &AtomicI32,
                           exited: &AtomicBool,
                           running: &AtomicBool| {
            exit_code.store(status.code().unwrap_or(-1), Ordering::Relaxed);
            exited.store(true, Ordering::Release);
            running.store(false, Ordering::Release);
        };

        loop {
            match requests.recv_timeout(MONITOR_TICK) {
                Ok(MonitorRequest::Stop) => {
                    let deadline = Instant::now() + KILL_GRACE;
                    loop {
                        match child.try_wait() {
                            Ok(Some(status)) => {
                                record_exit(status, &exit_code, &exited, &running);
                                return;
                            }
                            Ok(None) if Instant::now() < deadline => {
                                std::thread::sleep(MONITOR_TICK)
                            }
                            _ => break,
                        }
                    }
                    tracing::warn!("bridge child ignored quit, killing");
                    let _ = child.kill();
                    if let Ok(status) = child.wait() {
                        record_exit(status, &exit_code, &exited, &running);
                    } else {
                        running.store(false, Ordering::Release);
                    }
                    return;
                }
                Ok(MonitorRequest::Kill) => {
                    let _ = child.kill();
                    if let Ok(status) = child.wait() {
                        record_exit(status, &exit_code, &exited, &running);
                    } else {
                        running.store(false, Ordering::Release);
                    }
                    return;
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            record_exit(status, &exit_code, &exited, &running);
                            return;
                        }
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::warn!("child wait failed: {e}");
                            running.store(false, Ordering::Release);
                            return;
                        }
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    // Owner dropped without stop(); reap hard.
                    let _ = child.kill();
                    let _ = child.wait();
                    running.store(false, Ordering::Release);
                    return;
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Exit code once the child has been reaped. `-1` when killed by signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.exited
            .load(Ordering::Acquire)
            .then(|| self.exit_code.load(Ordering::Relaxed))
    }

    /// Ask the monitor to wind the child down (grace period, then kill) and
    /// wait for it to be reaped.
    pub fn stop(&mut self) {
        let _ = self.request_tx.send(MonitorRequest::Stop);
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
    }

    /// Force-kill without grace.
    pub fn kill(&mut self) {
        let _ = self.request_tx.send(MonitorRequest::Kill);
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if self.monitor.is_some() {
            self.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_for(binary: &str) -> SpawnSpec {
        SpawnSpec {
            binary: PathBuf::from(binary),
            plugin_type: PluginType::Internal,
            filename: PathBuf::new(),
            label: String::new(),
            unique_id: 0,
            shm_ids: "aaaaaabbbbbbccccccdddddd".to_string(),
            engine_options: vec![],
            wine: WineOptions::default(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_child_exit_is_observed() {
        // `sleep` rejects our argv and exits at once; what matters is that
        // the monitor notices and records an exit code.
        let supervisor = ProcessSupervisor::spawn(&spec_for("sleep")).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!supervisor.is_running());
        assert_ne!(supervisor.exit_code(), None);
        assert_ne!(supervisor.exit_code(), Some(0));
    }

    #[test]
    fn test_spawn_missing_binary_fails() {
        let spec = SpawnSpec {
            binary: PathBuf::from("/nonexistent/halcyon-bridge"),
            plugin_type: PluginType::Lv2,
            filename: PathBuf::new(),
            label: String::new(),
            unique_id: 0,
            shm_ids: String::new(),
            engine_options: vec![],
            wine: WineOptions::default(),
        };
        assert!(matches!(ProcessSupervisor::spawn(&spec), Err(BridgeError::Spawn(_))));
    }

    #[test]
    fn test_find_wine_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("myprefix");
        let plugin_dir = prefix.join("drive_c/Program Files/VstPlugins");
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::create_dir_all(prefix.join("drive_c")).unwrap();

        let plugin = plugin_dir.join("synth.dll");
        std::fs::write(&plugin, b"").unwrap();

        assert_eq!(find_wine_prefix(&plugin), Some(prefix));
        assert_eq!(find_wine_prefix(Path::new("/tmp/nothing-here.dll")), None);
    }
}
