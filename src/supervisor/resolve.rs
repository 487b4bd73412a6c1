use std::path::{Path, PathBuf};

use crate::config::Configuration;
use crate::supervisor::error::SupervisorError;

/// Resolve the interpreter script to launch.
///
/// - unset (or empty) → the bundled interpreter, whatever the workspace
/// - absolute → returned unchanged
/// - relative → joined onto `workspace_root`; `NoWorkspace` without one
pub fn resolve_interpreter(
    config: &Configuration,
    workspace_root: Option<&Path>,
) -> Result<PathBuf, SupervisorError> {
    let Some(configured) = config.interpreter_path.as_deref().filter(|p| !p.is_empty()) else {
        tracing::debug!("Using bundled interpreter {}", config.bundled_interpreter.display());
        return Ok(config.bundled_interpreter.clone());
    };

    let path = Path::new(configured);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }

    match workspace_root {
        Some(root) => {
            let resolved = root.join(path);
            tracing::debug!("Resolved '{}' against workspace -> {}", configured, resolved.display());
            Ok(resolved)
        }
        None => Err(SupervisorError::NoWorkspace(configured.to_string())),
    }
}
