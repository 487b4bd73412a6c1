//! Run Supervisor - one-shot interpreter executions with live output
//!
//! Each `run()` spawns the runtime with the interpreter script and the
//! target file, then returns immediately. Background tasks:
//! - stdout/stderr readers feeding a per-run channel
//! - a forwarder appending that channel to the run's sink
//! - a waiter that records the exit code once the child is gone and both
//!   streams are drained, then writes `Process exited with code <n>`

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Configuration;
use crate::output::{OutputSink, OutputSource};
use crate::supervisor::error::SupervisorError;
use crate::supervisor::process::{apply_creation_flags, exit_code, terminate};
use crate::supervisor::resolve::resolve_interpreter;
use crate::supervisor::stream::{spawn_forwarder, spawn_reader, CHANNEL_CAPACITY};

/// Fixed runtime flags placed before the interpreter script.
pub const WARNING_FILTER_ARGS: [&str; 2] = ["-W", "ignore::SyntaxWarning"];

/// How long a cancelled run may keep flushing output.
const CANCEL_DRAIN_GRACE: Duration = Duration::from_secs(2);

// ─── Types ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub interpreter_path: PathBuf,
    pub file_to_run: PathBuf,
    pub working_directory: PathBuf,
}

impl RunRequest {
    /// Working directory is the target file's directory.
    pub fn new(interpreter_path: impl Into<PathBuf>, file_to_run: impl Into<PathBuf>) -> Self {
        let file_to_run = file_to_run.into();
        let working_directory = file_to_run
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            interpreter_path: interpreter_path.into(),
            file_to_run,
            working_directory,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "lowercase")]
pub enum FailureReason {
    /// The runtime could not be started at all
    Spawn(String),
    /// Terminated through `cancel()`
    Cancelled,
    /// Waiting on the child failed
    Wait(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "lowercase")]
pub enum RunState {
    Running,
    Exited(i32),
    Failed(FailureReason),
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Running)
    }
}

// ─── Run Handle ──────────────────────────────────────────────

/// One in-flight execution.
pub struct RunHandle {
    id: Uuid,
    pid: Option<u32>,
    request: RunRequest,
    state_rx: watch::Receiver<RunState>,
    cancel: CancellationToken,
    sink: Arc<dyn OutputSink>,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn request(&self) -> &RunRequest {
        &self.request
    }

    pub fn sink(&self) -> Arc<dyn OutputSink> {
        self.sink.clone()
    }

    pub fn state(&self) -> RunState {
        self.state_rx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.state().is_terminal()
    }

    /// Wait until the run reaches its terminal state.
    pub async fn wait(&self) -> RunState {
        let mut rx = self.state_rx.clone();
        loop {
            let state = rx.borrow().clone();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    /// Request termination. Returns false if the run already finished.
    ///
    /// `true` only means the request was made: a child that exits on its
    /// own before the waiter sees the request still ends in `Exited`.
    /// `wait()` reports the state the run actually ended in.
    pub fn cancel(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        tracing::info!("Cancelling run {}", self.id);
        self.cancel.cancel();
        true
    }
}

// ─── Run Supervisor ──────────────────────────────────────────

/// Spawns interpreter runs. Runs are independent; the supervisor only
/// remembers cancellation tokens so teardown can stop stragglers.
pub struct RunSupervisor {
    runtime_path: String,
    active: Arc<StdMutex<HashMap<Uuid, CancellationToken>>>,
}

impl RunSupervisor {
    pub fn new(config: &Configuration) -> Self {
        Self {
            runtime_path: config.runtime_path.clone(),
            active: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn runtime_path(&self) -> &str {
        &self.runtime_path
    }

    pub fn resolve_interpreter(
        &self,
        config: &Configuration,
        workspace_root: Option<&Path>,
    ) -> Result<PathBuf, SupervisorError> {
        resolve_interpreter(config, workspace_root)
    }

    /// Spawn the run and return at once. Must be called inside a tokio runtime.
    pub fn run(&self, request: RunRequest, sink: Arc<dyn OutputSink>) -> RunHandle {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let mut cmd = Command::new(&self.runtime_path);
        cmd.args(WARNING_FILTER_ARGS)
            .arg(&request.interpreter_path)
            .arg(&request.file_to_run)
            .current_dir(&request.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        apply_creation_flags(&mut cmd);

        tracing::info!(
            "Run {}: {} {} {} (cwd {})",
            id,
            self.runtime_path,
            request.interpreter_path.display(),
            request.file_to_run.display(),
            request.working_directory.display()
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = SupervisorError::SpawnFailure {
                    program: self.runtime_path.clone(),
                    reason: e.to_string(),
                };
                tracing::error!("Run {}: {}", id, err);
                sink.append_line(&err.to_string());
                let (_tx, state_rx) = watch::channel(RunState::Failed(FailureReason::Spawn(e.to_string())));
                return RunHandle { id, pid: None, request, state_rx, cancel, sink };
            }
        };
        let pid = child.id();

        let (chunk_tx, chunk_rx) = mpsc::channel(CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, OutputSource::Stdout, chunk_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, OutputSource::Stderr, chunk_tx.clone());
        }
        drop(chunk_tx);
        let forwarder = spawn_forwarder(chunk_rx, sink.clone());

        let (state_tx, state_rx) = watch::channel(RunState::Running);
        self.lock_active().insert(id, cancel.clone());

        // ── waiter ───────────────────────────────────────────
        {
            let sink = sink.clone();
            let cancel = cancel.clone();
            let active = self.active.clone();
            tokio::spawn(async move {
                let outcome = tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) => Ok(exit_code(&status)),
                        Err(e) => Err(FailureReason::Wait(e.to_string())),
                    },
                    _ = cancel.cancelled() => {
                        terminate(&mut child);
                        let _ = child.wait().await;
                        Err(FailureReason::Cancelled)
                    }
                };

                let drained = match outcome {
                    Ok(_) => forwarder.await.ok(),
                    Err(_) => {
                        let abort = forwarder.abort_handle();
                        match tokio::time::timeout(CANCEL_DRAIN_GRACE, forwarder).await {
                            Ok(joined) => joined.ok(),
                            Err(_) => {
                                abort.abort();
                                None
                            }
                        }
                    }
                };

                let state = match outcome {
                    Ok(code) => {
                        if drained == Some(false) {
                            sink.append("\n");
                        }
                        sink.append_line(&format!("Process exited with code {}", code));
                        tracing::info!("Run {} exited with code {}", id, code);
                        RunState::Exited(code)
                    }
                    Err(reason) => {
                        tracing::warn!("Run {} failed: {:?}", id, reason);
                        RunState::Failed(reason)
                    }
                };

                active
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&id);
                let _ = state_tx.send(state);
            });
        }

        RunHandle { id, pid, request, state_rx, cancel, sink }
    }

    /// Send a termination signal to `handle`'s child; the handle ends in
    /// `Failed(Cancelled)`.
    pub fn cancel(&self, handle: &RunHandle) -> bool {
        handle.cancel()
    }

    /// Cancel every run still in flight. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let tokens: Vec<CancellationToken> = self.lock_active().values().cloned().collect();
        for token in &tokens {
            token.cancel();
        }
        if !tokens.is_empty() {
            tracing::info!("Cancelled {} in-flight run(s)", tokens.len());
        }
        tokens.len()
    }

    /// Number of runs that have not reached a terminal state.
    pub fn active_runs(&self) -> usize {
        self.lock_active().len()
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputChannel;

    #[test]
    fn test_request_working_directory() {
        let req = RunRequest::new("/ext/server/interpreter.py", "/proj/src/main.pmo");
        assert_eq!(req.working_directory, PathBuf::from("/proj/src"));

        let bare = RunRequest::new("interp.py", "main.pmo");
        assert_eq!(bare.working_directory, PathBuf::from("."));
    }

    #[test]
    fn test_run_state_terminal() {
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Exited(1).is_terminal());
        assert!(RunState::Failed(FailureReason::Cancelled).is_terminal());
    }

    #[test]
    fn test_run_state_json() {
        let json = serde_json::to_value(RunState::Exited(0)).unwrap();
        assert_eq!(json, serde_json::json!({"state": "exited", "value": 0}));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_terminal_without_exit_line() {
        let cfg = Configuration::new(Path::new("/ext"))
            .with_runtime("/definitely/not/a/runtime-binary");
        let supervisor = RunSupervisor::new(&cfg);
        let sink = Arc::new(OutputChannel::new("run"));

        let handle = supervisor.run(
            RunRequest::new("/ext/server/interpreter.py", std::env::temp_dir().join("main.pmo")),
            sink.clone(),
        );

        assert!(matches!(handle.state(), RunState::Failed(FailureReason::Spawn(_))));
        assert!(matches!(handle.wait().await, RunState::Failed(FailureReason::Spawn(_))));
        assert!(handle.pid().is_none());
        assert!(!handle.cancel());
        assert_eq!(supervisor.active_runs(), 0);

        let out = sink.contents();
        assert!(out.contains("Failed to start '/definitely/not/a/runtime-binary'"));
        assert!(!out.contains("Process exited with code"));
    }
}
