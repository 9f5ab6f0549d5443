//! Tracing and logging setup shared by processes embedding the job coordinator.

/// Initialize process-wide tracing from the environment (JSON unless
/// `LOG_FORMAT=text`, filter from `RUST_LOG` or `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    init_with(&LogConfig::from_env());
}

/// Initialize with explicit settings. Returns `false` if a subscriber was
/// already installed.
pub fn init_with(config: &LogConfig) -> bool {
    tracing::init(config)
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::{LogConfig, LogFormat};
