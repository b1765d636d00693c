//! Process-wide logging setup for the job pipeline binaries.

pub mod tracing;

pub use crate::tracing::{LogConfig, LogFormat};

/// Install the default subscriber (JSON, `info`, `RUST_LOG` overrides).
///
/// Safe to call more than once; only the first call installs anything.
pub fn init() {
    tracing::init(&LogConfig::from_env());
}
