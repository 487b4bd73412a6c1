#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tspmo_core::Configuration;

/// Stand-in for the Python runtime: drops the warning-filter flags when
/// present and hands the remaining arguments to `/bin/sh`.
pub const FAKE_RUNTIME: &str =
    "#!/bin/sh\nif [ \"$1\" = \"-W\" ]; then shift 2; fi\nexec /bin/sh \"$@\"\n";

/// Script that answers the initialize request, then swallows the rest of
/// its input, copying it to `capture` when given.
pub fn fake_service(dir: &Path, capture: Option<&Path>) -> PathBuf {
    let sink = capture
        .map(|p| format!("'{}'", p.display()))
        .unwrap_or_else(|| "/dev/null".to_string());
    scripted_service(dir, "fake-service.sh", "", &format!("exec cat > {}", sink))
}

/// Service that runs `before` ahead of its initialize reply and `after`
/// once the reply is written.
pub fn scripted_service(dir: &Path, name: &str, before: &str, after: &str) -> PathBuf {
    let body = format!(
        r#"IFS= read -r _header
{}
body='{{"jsonrpc":"2.0","id":1,"result":{{"capabilities":{{}},"serverInfo":{{"name":"fake-tspmo"}}}}}}'
printf 'Content-Length: %d\r\n\r\n%s' "${{#body}}" "$body"
{}
"#,
        before, after
    );
    write_script(dir, name, &body)
}

/// Exits without answering.
pub const DEAD_SERVICE: &str = "exit 1\n";

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Configuration whose runtime is the fake runtime in `dir`.
pub fn run_config(dir: &Path) -> Configuration {
    let runtime = write_script(dir, "fake-runtime", FAKE_RUNTIME);
    Configuration::new(dir).with_runtime(runtime.to_string_lossy().into_owned())
}

/// Configuration launching `service` through `/bin/sh`.
pub fn service_config(service: &Path) -> Configuration {
    Configuration::new(service.parent().unwrap_or(Path::new("/")))
        .with_runtime("/bin/sh")
        .with_service_path(service)
        .with_handshake_timeout(Duration::from_secs(5))
        .with_shutdown_grace(Duration::from_millis(200))
}
