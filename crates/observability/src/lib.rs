//! Tracing and logging setup shared by the repo iterator binaries.

/// Initialize process-wide logging from the environment.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&tracing::LogConfig::from_env());
}

/// Subscriber configuration and installation.
pub mod tracing;

pub use self::tracing::{LogConfig, LogFormat};
