use tracing_subscriber::EnvFilter;

/// Variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "TSPMO_LOG";

/// Install the stderr subscriber. Safe to call more than once; later calls
/// (or a host that already installed its own subscriber) are ignored.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter())
        .with_target(false)
        .try_init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
