//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// JSON lines with timestamps; the filter comes from `RUST_LOG` and falls
/// back to `info`. Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
}

/// Initialize with an explicit filter instead of `RUST_LOG`.
pub fn init_with_filter(filter: EnvFilter) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
