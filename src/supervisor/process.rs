//! Child-process helpers shared by both supervisors.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::{Child, Command};

/// Apply platform-specific flags to hide the console window on Windows.
/// On non-Windows platforms, this is a no-op.
#[cfg(target_os = "windows")]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}

/// Ask the child to terminate: SIGTERM on Unix, a hard kill elsewhere.
pub fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            tracing::info!("Sending TERM signal to pid {}", pid);
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => return,
                Err(e) => tracing::warn!("Failed to signal pid {}: {}", pid, e),
            }
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::debug!("start_kill failed (process already gone?): {}", e);
    }
}

/// Numeric exit code. A Unix process killed by a signal reports
/// `128 + signal`, the shell convention.
pub fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}

/// Wait up to `grace` for the child to exit on its own, then kill it.
pub async fn reap(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => return Some(status),
        Ok(Err(e)) => {
            tracing::warn!("Failed to wait for child: {}", e);
            return None;
        }
        Err(_) => {
            tracing::info!("Child still alive after {:?}, killing", grace);
        }
    }
    if let Err(e) = child.kill().await {
        tracing::warn!("Failed to kill child: {}", e);
        return None;
    }
    child.try_wait().ok().flatten()
}
