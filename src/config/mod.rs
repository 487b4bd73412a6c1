use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::supervisor::error::SupervisorError;

/// Language id of documents handled by this integration.
pub const LANGUAGE_ID: &str = "tspmo";

/// Runtime used to launch both the service and the interpreter script.
pub const DEFAULT_RUNTIME: &str = "python3";

/// Files whose create/change/delete events are forwarded to the service.
pub const DEFAULT_WATCH_PATTERNS: &[&str] = &["**/*.{tspmo,pmo}"];

const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;

/// Settings file layout (`settings.toml`):
///
/// ```toml
/// [tspmo]
/// pythonPath = "python3"
/// interpreterPath = ""
/// ```
#[derive(Deserialize, Debug, Clone, Default)]
pub struct SettingsFile {
    #[serde(default)]
    pub tspmo: Settings,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub python_path: String,
    pub interpreter_path: String,
    pub file_watch: Vec<String>,
    pub handshake_timeout_secs: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            python_path: DEFAULT_RUNTIME.to_string(),
            interpreter_path: String::new(),
            file_watch: DEFAULT_WATCH_PATTERNS.iter().map(|p| p.to_string()).collect(),
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

/// Session-wide configuration, read once at activation.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Executable runtime for the service and the interpreter script
    pub runtime_path: String,
    /// Analysis service entry point (`<bundle>/server/server.py`)
    pub service_path: PathBuf,
    /// User override for the interpreter script; `None` selects the bundled one
    pub interpreter_path: Option<String>,
    /// Interpreter script shipped with the extension
    pub bundled_interpreter: PathBuf,
    pub file_watch_patterns: Vec<String>,
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Configuration {
    /// Defaults for an extension installed at `bundle_dir`.
    pub fn new(bundle_dir: &Path) -> Self {
        Self::from_settings(bundle_dir, Settings::default())
    }

    pub fn from_settings(bundle_dir: &Path, settings: Settings) -> Self {
        let server_dir = bundle_dir.join("server");
        let interpreter_path = Some(settings.interpreter_path)
            .filter(|p| !p.trim().is_empty());
        let runtime_path = if settings.python_path.trim().is_empty() {
            DEFAULT_RUNTIME.to_string()
        } else {
            settings.python_path
        };

        Self {
            runtime_path,
            service_path: server_dir.join("server.py"),
            interpreter_path,
            bundled_interpreter: server_dir.join("interpreter.py"),
            file_watch_patterns: settings.file_watch,
            handshake_timeout: Duration::from_secs(settings.handshake_timeout_secs),
            shutdown_grace: Duration::from_millis(settings.shutdown_grace_ms),
        }
    }

    /// Load settings from a TOML file. A missing file yields defaults;
    /// a malformed one is reported as `InvalidConfig`.
    pub fn load(bundle_dir: &Path, settings_path: &Path) -> Result<Self, SupervisorError> {
        let settings = match std::fs::read_to_string(settings_path) {
            Ok(s) => Self::parse_settings(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No settings at {}, using defaults", settings_path.display());
                Settings::default()
            }
            Err(e) => {
                return Err(SupervisorError::InvalidConfig(format!(
                    "cannot read {}: {}",
                    settings_path.display(),
                    e
                )))
            }
        };
        let cfg = Self::from_settings(bundle_dir, settings);
        tracing::info!(
            "Configuration loaded: runtime '{}', service {}",
            cfg.runtime_path,
            cfg.service_path.display()
        );
        Ok(cfg)
    }

    pub fn parse_settings(s: &str) -> Result<Settings, SupervisorError> {
        let file: SettingsFile = toml::from_str(s)
            .map_err(|e| SupervisorError::InvalidConfig(e.to_string()))?;
        Ok(file.tspmo)
    }

    pub fn with_runtime(mut self, runtime_path: impl Into<String>) -> Self {
        self.runtime_path = runtime_path.into();
        self
    }

    pub fn with_service_path(mut self, service_path: impl Into<PathBuf>) -> Self {
        self.service_path = service_path.into();
        self
    }

    /// Empty strings clear the override, same as an unset setting.
    pub fn with_interpreter_path(mut self, interpreter_path: &str) -> Self {
        self.interpreter_path = Some(interpreter_path.to_string())
            .filter(|p| !p.trim().is_empty());
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}
