//! Session - everything between extension activation and deactivation.
//!
//! The session owns the configuration, one `ConnectionSupervisor` and one
//! `RunSupervisor`, and the teardown registry that stops them. The editor
//! itself is reached only through [`EditorHost`].

pub mod teardown;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{Configuration, LANGUAGE_ID};
use crate::output::OutputSink;
use crate::protocol::FileEvent;
use crate::supervisor::{
    resolve_interpreter, ConnectionSnapshot, ConnectionSupervisor, FailureReason, RunHandle,
    RunRequest, RunState, RunSupervisor, SupervisorError,
};

pub use teardown::Teardown;

/// Output channel receiving run output.
pub const RUN_CHANNEL: &str = "TSPMO Run";
/// Output channel receiving the language service's own diagnostics.
pub const SERVICE_CHANNEL: &str = "TSPMO Language Server";

/// The document focused in the editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveDocument {
    pub path: PathBuf,
    pub language_id: String,
}

impl ActiveDocument {
    pub fn new(path: impl Into<PathBuf>, language_id: &str) -> Self {
        Self {
            path: path.into(),
            language_id: language_id.to_string(),
        }
    }
}

/// What the core needs from the editor.
pub trait EditorHost: Send + Sync {
    fn active_document(&self) -> Option<ActiveDocument>;

    /// Persist the document so the interpreter sees the latest text.
    fn save_document(&self, document: &ActiveDocument) -> anyhow::Result<()>;

    fn workspace_root(&self) -> Option<PathBuf>;

    /// Named append-only channel; the same name yields the same channel.
    fn output_channel(&self, name: &str) -> Arc<dyn OutputSink>;

    /// A new sink titled [`RUN_CHANNEL`] for one run. Every call returns a
    /// distinct sink, so overlapping runs never write into each other.
    fn create_run_channel(&self) -> Arc<dyn OutputSink>;

    /// Visible error notification.
    fn show_error(&self, message: &str);
}

pub struct Session {
    config: Configuration,
    host: Arc<dyn EditorHost>,
    connection: Arc<ConnectionSupervisor>,
    runs: Arc<RunSupervisor>,
    teardown: Teardown,
}

impl Session {
    /// Build the session and register teardown for both supervisors.
    /// Nothing is spawned yet.
    pub fn new(config: Configuration, host: Arc<dyn EditorHost>) -> Self {
        let connection = Arc::new(ConnectionSupervisor::new(host.output_channel(SERVICE_CHANNEL)));
        let runs = Arc::new(RunSupervisor::new(&config));
        let teardown = Teardown::new();

        {
            let connection = connection.clone();
            teardown.register("language service", move || async move {
                connection.stop().await;
            });
        }
        {
            let runs = runs.clone();
            teardown.register("in-flight runs", move || async move {
                runs.cancel_all();
            });
        }

        Self { config, host, connection, runs, teardown }
    }

    /// `new` followed by `start_language_client`. A service that cannot
    /// be reached is reported to the user; the session carries on without
    /// analysis features.
    pub async fn activate(config: Configuration, host: Arc<dyn EditorHost>) -> Self {
        tracing::info!("Session activating");
        let session = Self::new(config, host);
        if let Err(e) = session.start_language_client().await {
            tracing::warn!("Continuing without language service: {}", e);
        }
        session
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionSupervisor {
        &self.connection
    }

    pub fn runs(&self) -> &RunSupervisor {
        &self.runs
    }

    pub async fn start_language_client(&self) -> Result<ConnectionSnapshot, SupervisorError> {
        let result = async {
            self.connection
                .register_file_watch(&self.config.file_watch_patterns)
                .await?;
            let root = self.host.workspace_root();
            self.connection.start(&self.config, root.as_deref()).await
        }
        .await;

        if let Err(e) = &result {
            self.host.show_error(&e.to_string());
        }
        result
    }

    /// Save the active document and run it through the interpreter.
    ///
    /// Errors before the spawn are returned and shown to the user. A spawn
    /// failure is reported the same way but still yields the (failed)
    /// handle, whose sink carries the reason.
    pub async fn run_current_file(&self) -> Result<RunHandle, SupervisorError> {
        let request = match self.prepare_run() {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Run aborted: {}", e);
                self.host.show_error(&e.to_string());
                return Err(e);
            }
        };

        let sink = self.host.create_run_channel();
        sink.show();

        let handle = self.runs.run(request, sink);
        if let RunState::Failed(FailureReason::Spawn(reason)) = handle.state() {
            let err = SupervisorError::SpawnFailure {
                program: self.runs.runtime_path().to_string(),
                reason,
            };
            self.host.show_error(&err.to_string());
        }
        Ok(handle)
    }

    fn prepare_run(&self) -> Result<RunRequest, SupervisorError> {
        let document = self
            .host
            .active_document()
            .ok_or(SupervisorError::NoActiveEditor)?;
        if document.language_id != LANGUAGE_ID {
            return Err(SupervisorError::UnsupportedDocument(
                document.path.display().to_string(),
            ));
        }

        self.host
            .save_document(&document)
            .map_err(|e| SupervisorError::SaveFailed {
                path: document.path.display().to_string(),
                reason: e.to_string(),
            })?;

        let root = self.host.workspace_root();
        let interpreter = resolve_interpreter(&self.config, root.as_deref())?;
        Ok(RunRequest::new(interpreter, document.path))
    }

    pub async fn notify_file_event(&self, event: &FileEvent) -> bool {
        self.connection.notify_file_event(event).await
    }

    pub async fn document_opened(&self, document: &ActiveDocument, version: i32, text: &str) -> bool {
        self.connection
            .open_document(&document.path, &document.language_id, version, text)
            .await
    }

    pub async fn document_changed(&self, document: &ActiveDocument, version: i32, text: &str) -> bool {
        self.connection
            .change_document(&document.path, &document.language_id, version, text)
            .await
    }

    pub async fn document_closed(&self, path: &Path, language_id: &str) -> bool {
        self.connection.close_document(path, language_id).await
    }

    /// Run teardown. Idempotent; every exit path should end here.
    pub async fn deactivate(&self) {
        let ran = self.teardown.run().await;
        if ran > 0 {
            tracing::info!("Session deactivated ({} teardown action(s))", ran);
        }
    }

    pub fn is_deactivated(&self) -> bool {
        self.teardown.is_done()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.teardown.is_done() {
            // The service child is spawned with kill_on_drop.
            tracing::warn!("Session dropped without deactivate()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputChannel;
    use crate::supervisor::ConnectionState;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeHost {
        document: Option<ActiveDocument>,
        root: Option<PathBuf>,
        channels: Mutex<HashMap<String, Arc<OutputChannel>>>,
        run_channels: Mutex<Vec<Arc<OutputChannel>>>,
        errors: Mutex<Vec<String>>,
        saved: Mutex<Vec<PathBuf>>,
    }

    impl FakeHost {
        fn channel(&self, name: &str) -> Arc<OutputChannel> {
            self.channels
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(OutputChannel::new(name)))
                .clone()
        }
    }

    impl EditorHost for FakeHost {
        fn active_document(&self) -> Option<ActiveDocument> {
            self.document.clone()
        }
        fn save_document(&self, document: &ActiveDocument) -> anyhow::Result<()> {
            self.saved.lock().unwrap().push(document.path.clone());
            Ok(())
        }
        fn workspace_root(&self) -> Option<PathBuf> {
            self.root.clone()
        }
        fn output_channel(&self, name: &str) -> Arc<dyn OutputSink> {
            self.channel(name)
        }
        fn create_run_channel(&self) -> Arc<dyn OutputSink> {
            let channel = Arc::new(OutputChannel::new(RUN_CHANNEL));
            self.run_channels.lock().unwrap().push(channel.clone());
            channel
        }
        fn show_error(&self, message: &str) {
            self.errors.lock().unwrap().push(message.to_string());
        }
    }

    fn config() -> Configuration {
        Configuration::new(Path::new("/ext"))
    }

    #[tokio::test]
    async fn test_no_active_editor() {
        let host = Arc::new(FakeHost::default());
        let session = Session::new(config(), host.clone());
        let err = session.run_current_file().await.err().unwrap();
        assert!(matches!(err, SupervisorError::NoActiveEditor));
        assert_eq!(*host.errors.lock().unwrap(), vec!["No active editor.".to_string()]);
        session.deactivate().await;
    }

    #[tokio::test]
    async fn test_wrong_language_is_rejected_before_save() {
        let host = Arc::new(FakeHost {
            document: Some(ActiveDocument::new("/proj/notes.md", "markdown")),
            ..Default::default()
        });
        let session = Session::new(config(), host.clone());
        let err = session.run_current_file().await.err().unwrap();
        assert_eq!(err.error_code(), "UNSUPPORTED_DOCUMENT");
        assert!(host.saved.lock().unwrap().is_empty());
        session.deactivate().await;
    }

    #[tokio::test]
    async fn test_relative_interpreter_without_workspace() {
        let host = Arc::new(FakeHost {
            document: Some(ActiveDocument::new("/proj/main.pmo", LANGUAGE_ID)),
            ..Default::default()
        });
        let session = Session::new(config().with_interpreter_path("tools/interp.py"), host.clone());
        let err = session.run_current_file().await.err().unwrap();
        assert_eq!(err.error_code(), "NO_WORKSPACE");
        assert_eq!(host.errors.lock().unwrap().len(), 1);
        // no run channel is created
        assert!(host.run_channels.lock().unwrap().is_empty());
        session.deactivate().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_shown() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("main.pmo");
        std::fs::write(&file, "ts yap legit hi bro pmo").unwrap();

        let host = Arc::new(FakeHost {
            document: Some(ActiveDocument::new(&file, LANGUAGE_ID)),
            root: Some(tmp.path().to_path_buf()),
            ..Default::default()
        });
        let cfg = config().with_runtime("/no/such/python");
        let session = Session::new(cfg, host.clone());

        let handle = session.run_current_file().await.unwrap();
        assert!(matches!(handle.wait().await, RunState::Failed(FailureReason::Spawn(_))));
        assert_eq!(*host.saved.lock().unwrap(), vec![file.clone()]);

        let errors = host.errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Failed to start '/no/such/python'"));

        let run = host.run_channels.lock().unwrap()[0].clone();
        assert!(run.is_visible());
        assert!(!run.contents().contains("Process exited"));
        session.deactivate().await;
    }

    #[tokio::test]
    async fn test_activate_with_unreachable_service() {
        let host = Arc::new(FakeHost::default());
        let session = Session::activate(config().with_runtime("/no/such/python"), host.clone()).await;
        assert_eq!(session.connection().state().await, ConnectionState::Failed);
        assert_eq!(host.errors.lock().unwrap().len(), 1);

        session.deactivate().await;
        assert!(session.is_deactivated());
        assert_eq!(session.connection().state().await, ConnectionState::Stopped);
        // second deactivate is a no-op
        session.deactivate().await;
    }
}
