//! Connection Supervisor - lifecycle of the analysis-service link
//!
//! One service process per session, spoken to over JSON-RPC on stdio.
//! Every state change goes through the `StateMachine` while holding the
//! connection lock; the handshake itself runs without the lock, and a
//! generation counter stops a late handshake from reviving a connection
//! that was stopped in the meantime.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::{Configuration, LANGUAGE_ID};
use crate::output::OutputSink;
use crate::protocol::{file_uri, FileEvent, FileWatch, Notification, RpcChannel};
use crate::supervisor::error::SupervisorError;
use crate::supervisor::process::{apply_creation_flags, reap};
use crate::supervisor::state_machine::{ConnectionState, StateMachine};

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Point-in-time view of the connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub pid: Option<u32>,
    /// `serverInfo.name` from the initialize result, when provided
    pub server_name: Option<String>,
}

struct Connection {
    machine: StateMachine,
    generation: u64,
    child: Option<Child>,
    channel: Option<RpcChannel>,
    watch: FileWatch,
    /// Notifications accepted while `Starting`, flushed on `Ready`
    queued: Vec<Notification>,
    server_name: Option<String>,
    shutdown_grace: Duration,
}

impl Connection {
    fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            generation: 0,
            child: None,
            channel: None,
            watch: FileWatch::default(),
            queued: Vec::new(),
            server_name: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.machine.state(),
            pid: self.child.as_ref().and_then(Child::id),
            server_name: self.server_name.clone(),
        }
    }

    fn transition(&mut self, to: ConnectionState) -> Result<(), SupervisorError> {
        self.machine
            .transition(to)
            .map_err(|e| SupervisorError::Internal(anyhow::anyhow!(e)))
    }
}

pub struct ConnectionSupervisor {
    inner: Mutex<Connection>,
    log: Arc<dyn OutputSink>,
}

impl ConnectionSupervisor {
    /// `log` receives the service's stderr and log messages.
    pub fn new(log: Arc<dyn OutputSink>) -> Self {
        Self {
            inner: Mutex::new(Connection::new()),
            log,
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.machine.state()
    }

    pub async fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.lock().await.snapshot()
    }

    /// Launch the service and complete the initialize handshake.
    pub async fn start(
        &self,
        config: &Configuration,
        workspace_root: Option<&Path>,
    ) -> Result<ConnectionSnapshot, SupervisorError> {
        let (generation, channel) = {
            let mut conn = self.inner.lock().await;
            match conn.machine.state() {
                ConnectionState::Ready => return Ok(conn.snapshot()),
                ConnectionState::Starting => return Err(SupervisorError::AlreadyRunning),
                ConnectionState::Failed => conn.transition(ConnectionState::Stopped)?,
                ConnectionState::Stopped => {}
            }
            conn.transition(ConnectionState::Starting)?;
            conn.generation += 1;
            conn.shutdown_grace = config.shutdown_grace;

            let mut child = match self.spawn_service(config) {
                Ok(child) => child,
                Err(e) => {
                    conn.transition(ConnectionState::Failed)?;
                    return Err(e);
                }
            };

            let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
                let _ = child.start_kill();
                conn.transition(ConnectionState::Failed)?;
                return Err(SupervisorError::ServiceUnreachable(
                    "service stdio was not captured".to_string(),
                ));
            };
            if let Some(stderr) = child.stderr.take() {
                let log = self.log.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        log.append_line(&line);
                    }
                });
            }

            let channel = RpcChannel::spawn(stdin, stdout, self.log.clone());
            conn.child = Some(child);
            conn.channel = Some(channel.clone());
            (conn.generation, channel)
        };

        let params = initialize_params(workspace_root);
        let handshake = tokio::time::timeout(
            config.handshake_timeout,
            channel.request("initialize", Some(params)),
        )
        .await;

        let mut conn = self.inner.lock().await;
        if conn.generation != generation || conn.machine.state() != ConnectionState::Starting {
            tracing::info!("Handshake finished after the connection was stopped; discarding");
            return Err(SupervisorError::ServiceUnreachable(
                "connection stopped during handshake".to_string(),
            ));
        }

        let failure = match handshake {
            Ok(Ok(result)) => match channel.notify("initialized", Some(json!({}))).await {
                Ok(()) => {
                    conn.server_name = result
                        .pointer("/serverInfo/name")
                        .and_then(Value::as_str)
                        .map(String::from);
                    None
                }
                Err(e) => Some(format!("failed to send initialized: {}", e)),
            },
            Ok(Err(e)) => Some(format!("initialize failed: {}", e)),
            Err(_) => Some(format!(
                "no initialize response within {:?}",
                config.handshake_timeout
            )),
        };

        if let Some(reason) = failure {
            conn.transition(ConnectionState::Failed)?;
            if let Some(mut child) = conn.child.take() {
                let _ = child.start_kill();
            }
            let _ = tokio::time::timeout(config.shutdown_grace, channel.close()).await;
            conn.channel = None;
            conn.queued.clear();
            tracing::error!("Language service unreachable: {}", reason);
            self.log.append_line(&format!("[client] {}", reason));
            return Err(SupervisorError::ServiceUnreachable(reason));
        }

        conn.transition(ConnectionState::Ready)?;
        let queued = std::mem::take(&mut conn.queued);
        if !queued.is_empty() {
            tracing::debug!("Flushing {} queued notification(s)", queued.len());
        }
        let flush = tokio::time::timeout(config.handshake_timeout, async {
            for note in queued {
                if let Err(e) = channel.send_notification(note).await {
                    tracing::warn!("Failed to flush queued notification: {}", e);
                }
            }
        })
        .await;
        if flush.is_err() {
            tracing::warn!("Service is not reading its input; queued notifications dropped");
        }

        {
            let log = self.log.clone();
            let watcher = channel.clone();
            tokio::spawn(async move {
                watcher.closed().await;
                tracing::debug!("Service channel closed");
                log.append_line("[client] language service connection closed");
            });
        }

        tracing::info!("Language service ready (pid {:?})", conn.snapshot().pid);
        Ok(conn.snapshot())
    }

    fn spawn_service(&self, config: &Configuration) -> Result<Child, SupervisorError> {
        let mut cmd = Command::new(&config.runtime_path);
        cmd.arg(&config.service_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_creation_flags(&mut cmd);

        tracing::info!(
            "Starting language service: {} {}",
            config.runtime_path,
            config.service_path.display()
        );
        cmd.spawn().map_err(|e| {
            let reason = format!("failed to spawn '{}': {}", config.runtime_path, e);
            tracing::error!("{}", reason);
            self.log.append_line(&format!("[client] {}", reason));
            SupervisorError::ServiceUnreachable(reason)
        })
    }

    /// Orderly shutdown. Safe to call in any state, any number of times.
    pub async fn stop(&self) {
        let (was, channel, mut child, grace) = {
            let mut conn = self.inner.lock().await;
            let was = conn.machine.state();
            if was == ConnectionState::Stopped {
                return;
            }
            if let Err(e) = conn.transition(ConnectionState::Stopped) {
                tracing::error!("{}", e);
            }
            conn.generation += 1;
            conn.queued.clear();
            conn.server_name = None;
            (was, conn.channel.take(), conn.child.take(), conn.shutdown_grace)
        };

        if let Some(channel) = &channel {
            if was == ConnectionState::Ready {
                let shutdown = tokio::time::timeout(
                    grace,
                    channel.request("shutdown", None),
                )
                .await;
                match shutdown {
                    Ok(Ok(_)) => tracing::debug!("Service acknowledged shutdown"),
                    Ok(Err(e)) => tracing::warn!("Shutdown request failed: {}", e),
                    Err(_) => tracing::warn!("Service did not answer shutdown within {:?}", grace),
                }
                match tokio::time::timeout(grace, channel.notify("exit", None)).await {
                    Ok(Ok(())) => tracing::debug!("Sent exit notification"),
                    Ok(Err(e)) => tracing::debug!("Exit notification failed: {}", e),
                    Err(_) => tracing::debug!("Exit notification not written within {:?}", grace),
                }
            }

            if tokio::time::timeout(grace, channel.close()).await.is_err() {
                // a blocked write holds the writer until the child is gone
                tracing::warn!("Service input is blocked, killing the service");
                if let Some(child) = child.as_mut() {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!("start_kill failed: {}", e);
                    }
                }
                if tokio::time::timeout(grace, channel.close()).await.is_err() {
                    tracing::warn!("Service input still blocked after kill");
                }
            }
        }

        if let Some(mut child) = child {
            let grace = if was == ConnectionState::Ready { grace } else { Duration::ZERO };
            let status = reap(&mut child, grace).await;
            tracing::info!("Language service stopped ({:?})", status);
        }
    }

    /// Replace the file-watch subscription.
    pub async fn register_file_watch<S: AsRef<str>>(&self, patterns: &[S]) -> Result<(), SupervisorError> {
        let watch = FileWatch::compile(patterns)?;
        tracing::debug!("Watching {:?}", watch.sources());
        self.inner.lock().await.watch = watch;
        Ok(())
    }

    /// Forward a file-system event if it matches the watch patterns.
    /// Returns whether it was sent or queued.
    pub async fn notify_file_event(&self, event: &FileEvent) -> bool {
        let matches = self.inner.lock().await.watch.matches(&event.path);
        if !matches {
            return false;
        }
        self.deliver(Notification::new(
            "workspace/didChangeWatchedFiles",
            Some(event.to_params()),
        ))
        .await
    }

    pub async fn open_document(&self, path: &Path, language_id: &str, version: i32, text: &str) -> bool {
        if language_id != LANGUAGE_ID {
            return false;
        }
        self.deliver(Notification::new(
            "textDocument/didOpen",
            Some(json!({
                "textDocument": {
                    "uri": file_uri(path),
                    "languageId": language_id,
                    "version": version,
                    "text": text,
                }
            })),
        ))
        .await
    }

    /// Full-text sync.
    pub async fn change_document(&self, path: &Path, language_id: &str, version: i32, text: &str) -> bool {
        if language_id != LANGUAGE_ID {
            return false;
        }
        self.deliver(Notification::new(
            "textDocument/didChange",
            Some(json!({
                "textDocument": { "uri": file_uri(path), "version": version },
                "contentChanges": [{ "text": text }],
            })),
        ))
        .await
    }

    pub async fn close_document(&self, path: &Path, language_id: &str) -> bool {
        if language_id != LANGUAGE_ID {
            return false;
        }
        self.deliver(Notification::new(
            "textDocument/didClose",
            Some(json!({ "textDocument": { "uri": file_uri(path) } })),
        ))
        .await
    }

    /// Send when `Ready`, queue when `Starting`, drop otherwise. The write
    /// happens outside the connection lock.
    async fn deliver(&self, note: Notification) -> bool {
        let channel = {
            let mut conn = self.inner.lock().await;
            match conn.machine.state() {
                ConnectionState::Starting => {
                    conn.queued.push(note);
                    return true;
                }
                ConnectionState::Ready => match conn.channel.clone() {
                    Some(channel) => channel,
                    None => return false,
                },
                state => {
                    tracing::debug!("Dropping '{}' while {:?}", note.method, state);
                    return false;
                }
            }
        };

        match channel.send_notification(note).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to forward notification: {}", e);
                false
            }
        }
    }

    /// Number of notifications waiting for `Ready`.
    pub async fn queued_len(&self) -> usize {
        self.inner.lock().await.queued.len()
    }
}

fn initialize_params(workspace_root: Option<&Path>) -> Value {
    let root_uri = workspace_root.map(file_uri);
    let folders = workspace_root.map(|root| {
        json!([{
            "uri": file_uri(root),
            "name": root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| root.display().to_string()),
        }])
    });
    json!({
        "processId": std::process::id(),
        "clientInfo": { "name": "tspmo-core", "version": env!("CARGO_PKG_VERSION") },
        "rootUri": root_uri,
        "rootPath": workspace_root.map(|r| r.display().to_string()),
        "workspaceFolders": folders,
        "capabilities": {
            "workspace": {
                "didChangeWatchedFiles": { "dynamicRegistration": false },
                "workspaceFolders": true,
            },
            "textDocument": {
                "synchronization": { "dynamicRegistration": false, "didSave": false },
                "hover": { "contentFormat": ["markdown", "plaintext"] },
                "completion": { "completionItem": { "snippetSupport": false } },
                "publishDiagnostics": { "relatedInformation": false },
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputChannel;
    use crate::protocol::FileChangeKind;

    fn supervisor() -> (ConnectionSupervisor, Arc<OutputChannel>) {
        let log = Arc::new(OutputChannel::new("TSPMO Language Server"));
        (ConnectionSupervisor::new(log.clone()), log)
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let (sup, _log) = supervisor();
        sup.stop().await;
        sup.stop().await;
        assert_eq!(sup.state().await, ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_unreachable() {
        let (sup, log) = supervisor();
        let cfg = Configuration::new(Path::new("/ext")).with_runtime("/no/such/runtime");
        let err = sup.start(&cfg, None).await.unwrap_err();
        assert_eq!(err.error_code(), "SERVICE_UNREACHABLE");
        assert_eq!(sup.state().await, ConnectionState::Failed);
        assert!(log.contents().contains("failed to spawn"));

        sup.stop().await;
        assert_eq!(sup.state().await, ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_events_dropped_while_stopped() {
        let (sup, _log) = supervisor();
        sup.register_file_watch(&["**/*.pmo"]).await.unwrap();
        let event = FileEvent::new("/proj/main.pmo", FileChangeKind::Created);
        assert!(!sup.notify_file_event(&event).await);
        assert_eq!(sup.queued_len().await, 0);
    }

    #[tokio::test]
    async fn test_unmatched_event_ignored() {
        let (sup, _log) = supervisor();
        sup.register_file_watch(&["**/*.pmo"]).await.unwrap();
        let event = FileEvent::new("/proj/notes.txt", FileChangeKind::Changed);
        assert!(!sup.notify_file_event(&event).await);
    }

    #[tokio::test]
    async fn test_document_selector() {
        let (sup, _log) = supervisor();
        assert!(!sup.open_document(Path::new("/proj/a.py"), "python", 1, "x").await);
    }

    #[cfg(unix)]
    #[test]
    fn test_initialize_params() {
        let params = initialize_params(Some(Path::new("/proj")));
        assert_eq!(params["rootUri"], "file:///proj");
        assert_eq!(params["workspaceFolders"][0]["name"], "proj");
        assert!(params["capabilities"]["workspace"]["didChangeWatchedFiles"].is_object());

        let bare = initialize_params(None);
        assert!(bare["rootUri"].is_null());
        assert!(bare["workspaceFolders"].is_null());
    }
}
