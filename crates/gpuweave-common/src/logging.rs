use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "GPUWEAVE_LOG";

/// Initialize structured logging with environment filter.
/// Set GPUWEAVE_LOG=debug (or trace, info, warn, error) for verbosity control.
pub fn init_logging() {
    fmt()
        .with_env_filter(filter())
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Like [`init_logging`], but tolerates a subscriber that is already installed.
/// Used by the C entry points, which may be called after the host set one up.
pub fn try_init_logging() -> bool {
    fmt()
        .with_env_filter(filter())
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .is_ok()
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}
